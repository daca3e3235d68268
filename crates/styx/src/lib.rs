#![forbid(unsafe_code)]
//! 9P2000 protocol library for Rust: a bit-exact wire codec, a synchronous
//! client, and an asynchronous server framework, all tokio-based.
//!
//! # Overview
//!
//! The 9P protocol was developed for the Plan 9 distributed operating
//! system; 9P2000 is its current revision. A connection is an ordered,
//! reliable byte stream carrying length-prefixed messages: the client sends
//! T-messages, the server answers each with the matching R-message (or
//! `Rerror`), paired by a 16-bit tag. File handles are 32-bit fids chosen
//! by the client and tracked by the server until clunked.
//!
//! This crate deliberately stops at the byte-stream boundary: dialing and
//! listening are the caller's concern, and storage is behind the
//! [`srv::Filesystem`] trait.
//!
//! # Client
//!
//! ```no_run
//! use styx::client::Client;
//!
//! # async fn demo() -> styx::Result<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:564").await?;
//! let mut fs = Client::mount(stream, "").await?;
//!
//! let mut fid = fs.open("usr/glenda/readme", styx::om::READ).await?;
//! let mut buf = vec![0; 128];
//! let n = fs.read(&mut fid, &mut buf).await?;
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//! fs.clunk(fid).await?;
//! fs.unmount().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Server
//!
//! Implement [`srv::Filesystem`] for your backend and hand
//! [`srv::serve`] an accepted connection:
//!
//! ```no_run
//! use styx::srv::{Filesystem, serve};
//! use async_trait::async_trait;
//!
//! #[derive(Clone)]
//! struct Hello;
//!
//! #[async_trait]
//! impl Filesystem for Hello {
//!     type Fid = ();
//!
//!     async fn attach(
//!         &self,
//!         _fid: &styx::srv::Fid<Self::Fid>,
//!         _afid: Option<&styx::srv::Fid<Self::Fid>>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> styx::Result<styx::Fcall> {
//!         Ok(styx::Fcall::Rattach {
//!             qid: styx::Qid {
//!                 typ: styx::QidType::DIR,
//!                 version: 0,
//!                 path: 0,
//!             },
//!         })
//!     }
//!
//!     // walk, open, read, stat ...
//! }
//!
//! # async fn demo() -> styx::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:564").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let (r, w) = stream.into_split();
//!     tokio::spawn(serve(Hello, r, w));
//! }
//! # }
//! ```
//!
//! # Fid management
//!
//! A fid is unique per connection and persists until `Tclunk` or `Tremove`
//! (both always consume it, even when the removal fails). The server
//! dispatcher enforces the protocol's fid rules before the backend runs:
//! walking from an open fid, walking names from a non-directory, opening
//! twice, or reading without an open all become the canonical `Rerror`
//! strings. Tag uniqueness among outstanding requests is enforced the same
//! way, and `Tflush` cancellation is sequenced so an `Rflush` is never
//! written before the flushed request's own reply.
//!
//! Backends that need to see past the fids a callback is handed receive a
//! cloneable [`srv::Session`] handle at [`srv::Filesystem::start`] carrying
//! the table primitives: `lookup_fid`, `alloc_fid`, `remove_fid`, and the
//! `request_pending` tag predicate.
//!
//! # Error handling
//!
//! 9P2000 errors are strings on the wire. [`Error::Ename`] carries them —
//! both server-side (what goes into `Rerror`) and client-side (what an
//! `Rerror` reply surfaces as) — while [`Error::Io`] is a transport or
//! codec failure. The canonical message set lives in [`error::string`].

pub mod client;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
