//! Define 9P error representations
//!
//! In 9P2000, errors are represented as strings: an `Rerror` reply carries
//! the error text in its `ename` field and there is no error-code taxonomy.

use std::error as stderror;
use std::{fmt, io};

/// 9P error type
///
/// `Error::Ename` is a protocol-level error: either an `Rerror` received
/// from the peer, or a condition the server dispatcher turns into an
/// `Rerror{ename}` reply. `Error::Io` is a transport or codec failure and
/// never reaches the wire as an `Rerror`.
#[derive(Debug)]
pub enum Error {
    /// 9P error string, as carried by `Rerror`
    Ename(String),
    /// I/O error
    Io(io::Error),
}

impl Error {
    /// Shorthand for building an `Ename` error from a string slice
    pub fn ename(e: &str) -> Error {
        Error::Ename(e.to_owned())
    }

    /// The string to place in an `Rerror` reply for this error
    pub fn to_ename(&self) -> String {
        match *self {
            Error::Ename(ref e) => e.clone(),
            Error::Io(ref e) => e.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Ename(ref e) => write!(f, "9P error: {}", e),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::Ename(_) => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Ename(e)
    }
}

/// 9P error strings
///
/// The canonical message set shared by the dispatcher and scripted tests.
///
/// # Protocol
/// 9P2000
pub mod string {
    pub const EBADOFFSET: &str = "bad offset";
    pub const EBOTCH: &str = "9P protocol botch";
    pub const ECLONEOPEN: &str = "cannot clone open fid";
    pub const ECREATENONDIR: &str = "create in non-directory";
    pub const EDUPFID: &str = "duplicate fid";
    pub const EDUPTAG: &str = "duplicate tag";
    pub const EISDIR: &str = "is a directory";
    pub const ENOAUTH: &str = "authentication not required";
    pub const ENOCREATE: &str = "create prohibited";
    pub const ENOREAD: &str = "read prohibited";
    pub const ENOREMOVE: &str = "remove prohibited";
    pub const ENOSTAT: &str = "stat prohibited";
    pub const ENOTFOUND: &str = "file not found";
    pub const ENOWALK: &str = "walk prohibited";
    pub const ENOWRITE: &str = "write prohibited";
    pub const ENOWSTAT: &str = "wstat prohibited";
    pub const EPERM: &str = "permission denied";
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const EUNKNOWNMSG: &str = "unknown message";
    pub const EWALKNODIR: &str = "walk in non-directory";
}
