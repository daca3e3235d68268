//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! The server frames and decodes incoming T-messages, validates each one
//! against the session's fid and tag state, invokes the [`Filesystem`]
//! backend for the decisions the protocol leaves to the implementation, and
//! commits the reply's state changes (open mode, qid, directory offset)
//! before it goes out on the wire. Protocol errors never terminate the
//! session; they are answered with `Rerror`. Only transport EOF or a frame
//! that fails to decode ends the dispatch loop.

use {
    crate::{
        error::{Error, string::*},
        fcall::*,
        serialize,
        utils::Result,
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, Mutex as StdMutex},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::Mutex,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedWrite, length_delimited::LengthDelimitedCodec},
};

/// Represents a fid of clients holding associated `Filesystem::Fid`.
///
/// The engine owns the protocol-visible state (qid, open mode, owning user,
/// directory offset) and updates it when replies commit; backends keep their
/// own per-fid data in `aux`.
#[derive(Debug)]
pub struct Fid<T> {
    /// Raw client side fid.
    fid: u32,

    meta: StdMutex<FidMeta>,

    /// `Filesystem::Fid` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

#[derive(Debug)]
struct FidMeta {
    qid: Qid,
    omode: Option<u8>,
    uid: String,
    offset: u64,
}

impl<T: Default> Fid<T> {
    fn new(fid: u32, uid: String) -> Fid<T> {
        Fid {
            fid,
            meta: StdMutex::new(FidMeta {
                qid: Qid::default(),
                omode: None,
                uid,
                offset: 0,
            }),
            aux: T::default(),
        }
    }
}

impl<T> Fid<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The qid last committed for this fid by attach/walk/open/create.
    pub fn qid(&self) -> Qid {
        self.meta.lock().unwrap().qid
    }

    /// The mode this fid was opened with; `None` while it has never been
    /// opened.
    pub fn omode(&self) -> Option<u8> {
        self.meta.lock().unwrap().omode
    }

    /// The user that attached this fid (copied from `Tattach`/`Tauth`, and
    /// onto cloned fids by `Twalk`).
    pub fn uid(&self) -> String {
        self.meta.lock().unwrap().uid.clone()
    }

    /// Directory read position, maintained by the engine for sequential
    /// directory reads.
    pub fn offset(&self) -> u64 {
        self.meta.lock().unwrap().offset
    }

    fn set_qid(&self, qid: Qid) {
        self.meta.lock().unwrap().qid = qid;
    }

    fn set_offset(&self, offset: u64) {
        self.meta.lock().unwrap().offset = offset;
    }

    fn open_commit(&self, mode: u8, qid: Qid) {
        let mut meta = self.meta.lock().unwrap();
        meta.omode = Some(mode);
        meta.qid = qid;
        if qid.typ.contains(QidType::DIR) {
            meta.offset = 0;
        }
    }
}

/// Backend of a 9P2000 server.
///
/// One method per T-message whose outcome the protocol leaves to the
/// implementation. The dispatcher performs all fid/tag bookkeeping and
/// protocol validation before a method is invoked, and commits session
/// state from the reply afterwards; implementations only decide what the
/// file tree looks like.
///
/// Returning `Err` sends `Rerror` to the client. Most methods have default
/// implementations that refuse the operation, so a read-only synthetic
/// filesystem only needs `attach`, `walk`, `open`, `read` and `stat`.
///
/// A method may take as long as it likes before returning; the dispatch
/// loop keeps consuming requests meanwhile, and `Tflush` cancellation
/// semantics are honored by the engine when the method finally returns.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// This type stores per-fid backend state such as a path, an open file
    /// handle, or a directory cursor.
    type Fid: Send + Sync + Default;

    /// Authenticate a user.
    ///
    /// `afid` is the freshly allocated fid the client will use to carry the
    /// authentication exchange with reads and writes. Servers that do not
    /// require authentication keep the default, which answers
    /// `"authentication not required"`.
    ///
    /// # Returns
    /// `Fcall::Rauth` with the qid of the auth file, or an error.
    async fn auth(&self, _afid: &Fid<Self::Fid>, _uname: &str, _aname: &str) -> Result<Fcall> {
        Err(Error::ename(ENOAUTH))
    }

    /// Attach to the filesystem root.
    ///
    /// The first operation of a session after version negotiation. `fid` is
    /// the fid the client chose for the root; `afid` is the previously
    /// established auth fid, if the client presented one.
    ///
    /// # Returns
    /// `Fcall::Rattach` with the root qid, or an error. The replied qid is
    /// recorded on the fid; walks check it for the directory bit.
    async fn attach(
        &self,
        _fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Fcall> {
        Ok(Fcall::Rattach {
            qid: Qid::default(),
        })
    }

    /// Notification that the client asked to abandon the outstanding
    /// request with tag `oldtag`.
    ///
    /// Purely advisory: a backend holding that request may release it
    /// early. The engine withholds the `Rflush` until the old request's
    /// reply has been written, whatever this method does.
    async fn flush(&self, _oldtag: u16) {}

    /// Walk path elements starting from `fid`, establishing `newfid`.
    ///
    /// Walk one name at a time and stop at the first that fails: return
    /// `Fcall::Rwalk` carrying one qid per element successfully walked. A
    /// shorter-than-requested qid list is a partial walk; the engine
    /// reports it to the client and tears the new fid down. Return an error
    /// only if the first element fails.
    ///
    /// `wnames` may be empty, which clones `fid` into `newfid`.
    async fn walk(
        &self,
        _fid: &Fid<Self::Fid>,
        _newfid: &Fid<Self::Fid>,
        _wnames: &[String],
    ) -> Result<Fcall> {
        Err(Error::ename(ENOWALK))
    }

    /// Open `fid` with the (already validated) open mode.
    ///
    /// # Returns
    /// `Fcall::Ropen` with the file's qid and preferred I/O unit (0 lets
    /// the client pick). The default accepts the open without touching any
    /// backing store.
    async fn open(&self, fid: &Fid<Self::Fid>, _mode: u8) -> Result<Fcall> {
        Ok(Fcall::Ropen {
            qid: fid.qid(),
            iounit: 0,
        })
    }

    /// Create `name` in the directory `fid` refers to and open it with
    /// `mode`. On success the fid stops referring to the directory and
    /// refers, open, to the new file.
    ///
    /// # Returns
    /// `Fcall::Rcreate` with the new file's qid, or an error.
    async fn create(
        &self,
        _fid: &Fid<Self::Fid>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<Fcall> {
        Err(Error::ename(ENOCREATE))
    }

    /// Read up to `count` bytes at `offset`.
    ///
    /// A short read is fine; zero bytes means end-of-file. For directories
    /// the payload must be a concatenation of whole stat records and the
    /// engine guarantees `offset` is sequential.
    async fn read(&self, _fid: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Fcall> {
        Err(Error::ename(ENOREAD))
    }

    /// Write `data` at `offset`, returning the count actually written in
    /// `Fcall::Rwrite`.
    async fn write(&self, _fid: &Fid<Self::Fid>, _offset: u64, _data: &Data) -> Result<Fcall> {
        Err(Error::ename(ENOWRITE))
    }

    /// Produce the stat record for `fid` in `Fcall::Rstat`.
    async fn stat(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::ename(ENOSTAT))
    }

    /// Apply a metadata update. Fields the client left at their "don't
    /// touch" values must be preserved.
    async fn wstat(&self, _fid: &Fid<Self::Fid>, _stat: &Stat) -> Result<Fcall> {
        Err(Error::ename(ENOWSTAT))
    }

    /// Remove the file `fid` refers to. The fid is gone from the session
    /// whatever this returns.
    async fn remove(&self, _fid: &Fid<Self::Fid>) -> Result<Fcall> {
        Err(Error::ename(ENOREMOVE))
    }

    /// Called whenever a fid leaves the session: clunk, remove, a failed
    /// attach/auth, partial-walk teardown, or end of session. Release any
    /// backend resources held in `aux` here.
    async fn destroy_fid(&self, _fid: &Fid<Self::Fid>) {}

    /// Called once before the first request of a session.
    ///
    /// The handle exposes the session's fid and request tables
    /// ([`Session::lookup_fid`], [`Session::alloc_fid`],
    /// [`Session::remove_fid`], [`Session::request_pending`]); keep a clone
    /// to introspect or manipulate them from any later callback.
    async fn start(&self, _session: &Session<Self::Fid>) {}

    /// Called once after the dispatch loop ends.
    async fn end(&self, _session: &Session<Self::Fid>) {}
}

/// The live fid and request tables of one connection.
///
/// A clone of this handle is handed to [`Filesystem::start`]; backends that
/// need to see past the fids the dispatcher passes them keep the clone and
/// use it from any later callback, the way a C 9P server walks its own
/// tables.
pub struct Session<T> {
    state: Arc<Mutex<SessionState<T>>>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Session<T> {
        Session {
            state: self.state.clone(),
        }
    }
}

struct SessionState<T> {
    msize: u32,
    fids: HashMap<u32, Arc<Fid<T>>>,
    reqs: HashMap<u16, InFlight>,
}

/// Per-request record, pinned by tag until the reply is written.
#[derive(Default)]
struct InFlight {
    /// Tags of `Tflush` requests parked until this request's reply goes out
    flushes: Vec<u16>,
}

impl<T: Default> Session<T> {
    fn new(msize: u32) -> Session<T> {
        Session {
            state: Arc::new(Mutex::new(SessionState {
                msize,
                fids: HashMap::new(),
                reqs: HashMap::new(),
            })),
        }
    }

    /// Look up a live fid by number.
    pub async fn lookup_fid(&self, fid: u32) -> Option<Arc<Fid<T>>> {
        self.state.lock().await.fids.get(&fid).cloned()
    }

    /// Introduce a fid under `uid`, the way `Tauth`/`Tattach`/`Twalk` do;
    /// a number that is already live answers `"duplicate fid"`.
    pub async fn alloc_fid(&self, fid: u32, uid: &str) -> Result<Arc<Fid<T>>> {
        self.state.lock().await.alloc(fid, uid.to_owned())
    }

    /// Take a fid out of the table, returning it. The dispatcher's own
    /// removals run [`Filesystem::destroy_fid`]; a backend removing a fid
    /// through this handle owns that cleanup itself.
    pub async fn remove_fid(&self, fid: u32) -> Option<Arc<Fid<T>>> {
        self.state.lock().await.remove(fid)
    }

    /// Whether a request with this tag is outstanding: accepted by the
    /// dispatch loop and not yet answered.
    pub async fn request_pending(&self, tag: u16) -> bool {
        self.state.lock().await.reqs.contains_key(&tag)
    }

    /// Maximum message size currently negotiated for the connection.
    pub async fn msize(&self) -> u32 {
        self.state.lock().await.msize
    }
}

impl<T: Default> SessionState<T> {
    fn lookup(&self, fid: u32) -> Result<Arc<Fid<T>>> {
        self.fids
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::ename(EUNKNOWNFID))
    }

    fn alloc(&mut self, fid: u32, uid: String) -> Result<Arc<Fid<T>>> {
        if self.fids.contains_key(&fid) {
            return Err(Error::ename(EDUPFID));
        }
        let f = Arc::new(Fid::new(fid, uid));
        self.fids.insert(fid, f.clone());
        Ok(f)
    }

    fn remove(&mut self, fid: u32) -> Option<Arc<Fid<T>>> {
        self.fids.remove(&fid)
    }
}

struct Conn<Fs, W>
where
    Fs: Filesystem,
{
    fs: Fs,
    session: Session<Fs::Fid>,
    writer: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
}

/// Serve one 9P2000 session over an already-open stream pair, returning
/// when the read side reaches EOF or produces an undecodable frame.
///
/// The loop itself is single-threaded; each accepted request runs as its
/// own task so a backend may hold a request (a blocking read, say) while
/// later requests, including the `Tflush` that cancels it, keep flowing.
pub async fn serve<Fs, R, W>(fs: Fs, reader: R, writer: W) -> Result<()>
where
    Fs: Filesystem + 'static,
    Fs::Fid: 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut framedread = serialize::frame_builder().new_read(reader);
    let conn = Arc::new(Conn {
        fs,
        session: Session::new(MSIZE_DEFAULT),
        writer: Mutex::new(serialize::frame_builder().new_write(writer)),
    });

    conn.fs.start(&conn.session).await;

    while let Some(frame) = framedread.next().await {
        let Ok(bytes) = frame else {
            break;
        };
        let msg = match serialize::read_msg(&mut bytes.reader()) {
            Ok(msg) => msg,
            Err(_) => break,
        };
        info!("\t← {:?}", msg);

        let tag = msg.tag;
        {
            let mut state = conn.session.state.lock().await;
            if state.reqs.contains_key(&tag) {
                drop(state);
                // The original request stays in flight; only the intruder
                // is answered.
                conn.write_error(tag, EDUPTAG).await;
                continue;
            }
            state.reqs.insert(tag, InFlight::default());
        }

        let conn = conn.clone();
        tokio::spawn(async move {
            conn.handle(msg).await;
        });
    }

    conn.fs.end(&conn.session).await;

    let fids: Vec<_> = {
        let mut state = conn.session.state.lock().await;
        state.fids.drain().map(|(_, f)| f).collect()
    };
    for fid in fids {
        conn.fs.destroy_fid(&fid).await;
    }

    Ok(())
}

impl<Fs, W> Conn<Fs, W>
where
    Fs: Filesystem,
    W: AsyncWrite + Send + Unpin,
{
    async fn handle(self: Arc<Self>, msg: Msg) {
        let tag = msg.tag;
        match msg.body {
            Fcall::Tversion { msize, version } => self.tversion(tag, msize, version).await,
            Fcall::Tauth { afid, uname, aname } => self.tauth(tag, afid, uname, aname).await,
            Fcall::Tattach {
                fid,
                afid,
                uname,
                aname,
            } => self.tattach(tag, fid, afid, uname, aname).await,
            Fcall::Tflush { oldtag } => self.tflush(tag, oldtag).await,
            Fcall::Twalk {
                fid,
                newfid,
                wnames,
            } => self.twalk(tag, fid, newfid, wnames).await,
            Fcall::Topen { fid, mode } => self.topen(tag, fid, mode).await,
            Fcall::Tcreate {
                fid,
                name,
                perm,
                mode,
            } => self.tcreate(tag, fid, name, perm, mode).await,
            Fcall::Tread { fid, offset, count } => self.tread(tag, fid, offset, count).await,
            Fcall::Twrite { fid, offset, data } => self.twrite(tag, fid, offset, data).await,
            Fcall::Tclunk { fid } => self.tclunk(tag, fid).await,
            Fcall::Tremove { fid } => self.tremove(tag, fid).await,
            Fcall::Tstat { fid } => self.tstat(tag, fid).await,
            Fcall::Twstat { fid, stat } => self.twstat(tag, fid, stat).await,
            _ => self.respond(tag, Err(Error::ename(EUNKNOWNMSG))).await,
        }
    }

    async fn tversion(&self, tag: u16, msize: u32, version: String) {
        let reply = if version == P92000 {
            let mut session = self.session.state.lock().await;
            session.msize = msize;
            Fcall::Rversion { msize, version }
        } else {
            Fcall::Rversion {
                msize,
                version: VERSION_UNKNOWN.to_owned(),
            }
        };
        self.respond(tag, Ok(reply)).await;
    }

    async fn tauth(&self, tag: u16, afid: u32, uname: String, aname: String) {
        let allocated = {
            let mut session = self.session.state.lock().await;
            session.alloc(afid, uname.clone())
        };
        let afid = match allocated {
            Ok(f) => f,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let result = match self.fs.auth(&afid, &uname, &aname).await {
            Ok(Fcall::Rauth { aqid }) => {
                afid.set_qid(aqid);
                Ok(Fcall::Rauth { aqid })
            }
            Ok(other) => Ok(other),
            Err(e) => {
                self.drop_fid(afid.fid).await;
                Err(e)
            }
        };
        self.respond(tag, result).await;
    }

    async fn tattach(&self, tag: u16, fid: u32, afid: u32, uname: String, aname: String) {
        let (validated, undo) = {
            let mut session = self.session.state.lock().await;
            match session.alloc(fid, uname.clone()) {
                Err(e) => (Err(e), None),
                Ok(f) => {
                    if afid != NOFID {
                        match session.lookup(afid) {
                            Ok(af) => (Ok((f, Some(af))), None),
                            Err(e) => {
                                // The fid was allocated before the afid
                                // lookup failed; take it back out.
                                session.remove(fid);
                                (Err(e), Some(f))
                            }
                        }
                    } else {
                        (Ok((f, None)), None)
                    }
                }
            }
        };
        if let Some(f) = undo {
            self.fs.destroy_fid(&f).await;
        }
        let (fid, afid) = match validated {
            Ok(v) => v,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let result = match self.fs.attach(&fid, afid.as_deref(), &uname, &aname).await {
            Ok(Fcall::Rattach { qid }) => {
                fid.set_qid(qid);
                Ok(Fcall::Rattach { qid })
            }
            Ok(other) => Ok(other),
            Err(e) => {
                self.drop_fid(fid.fid).await;
                Err(e)
            }
        };
        self.respond(tag, result).await;
    }

    async fn tflush(&self, tag: u16, oldtag: u16) {
        let parked = {
            let mut session = self.session.state.lock().await;
            if oldtag != tag {
                match session.reqs.get_mut(&oldtag) {
                    Some(oldreq) => {
                        oldreq.flushes.push(tag);
                        true
                    }
                    None => false,
                }
            } else {
                false
            }
        };
        if parked {
            // Replied by the old request's respond; see `respond`.
            self.fs.flush(oldtag).await;
        } else {
            self.respond(tag, Ok(Fcall::Rflush)).await;
        }
    }

    async fn twalk(&self, tag: u16, fid: u32, newfid: u32, wnames: Vec<String>) {
        let validated = {
            let mut session = self.session.state.lock().await;
            walk_validate(&mut session, fid, newfid, &wnames)
        };
        let (src, dst) = match validated {
            Ok(v) => v,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let distinct = fid != newfid;
        let result = match self.fs.walk(&src, &dst, &wnames).await {
            Ok(Fcall::Rwalk { wqids }) => {
                if wqids.len() == wnames.len() {
                    dst.set_qid(wqids.last().copied().unwrap_or_else(|| src.qid()));
                    Ok(Fcall::Rwalk { wqids })
                } else if wqids.is_empty() {
                    if distinct {
                        self.drop_fid(dst.fid).await;
                    }
                    Err(Error::ename(ENOTFOUND))
                } else {
                    // Partial walk: no error on the wire, the truncated qid
                    // list tells the client how far it got.
                    if distinct {
                        self.drop_fid(dst.fid).await;
                    }
                    Ok(Fcall::Rwalk { wqids })
                }
            }
            Ok(other) => Ok(other),
            Err(e) => {
                if distinct {
                    self.drop_fid(dst.fid).await;
                }
                Err(e)
            }
        };
        self.respond(tag, result).await;
    }

    async fn topen(&self, tag: u16, fid: u32, mode: u8) {
        let validated = {
            let session = self.session.state.lock().await;
            session.lookup(fid).and_then(|f| open_validate(&f, mode).map(|_| f))
        };
        let fid = match validated {
            Ok(f) => f,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let result = match self.fs.open(&fid, mode).await {
            Ok(Fcall::Ropen { qid, iounit }) => {
                fid.open_commit(mode, qid);
                Ok(Fcall::Ropen { qid, iounit })
            }
            other => other,
        };
        self.respond(tag, result).await;
    }

    async fn tcreate(&self, tag: u16, fid: u32, name: String, perm: u32, mode: u8) {
        let validated = {
            let session = self.session.state.lock().await;
            session.lookup(fid).and_then(|f| {
                if f.omode().is_some() {
                    Err(Error::ename(EBOTCH))
                } else if !f.qid().typ.contains(QidType::DIR) {
                    Err(Error::ename(ECREATENONDIR))
                } else {
                    Ok(f)
                }
            })
        };
        let fid = match validated {
            Ok(f) => f,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let result = match self.fs.create(&fid, &name, perm, mode).await {
            Ok(Fcall::Rcreate { qid, iounit }) => {
                fid.open_commit(mode, qid);
                Ok(Fcall::Rcreate { qid, iounit })
            }
            other => other,
        };
        self.respond(tag, result).await;
    }

    async fn tread(&self, tag: u16, fid: u32, offset: u64, count: u32) {
        let validated = {
            let session = self.session.state.lock().await;
            session.lookup(fid).and_then(|f| {
                if count > i32::MAX as u32 {
                    return Err(Error::ename(EBOTCH));
                }
                if offset > i64::MAX as u64 {
                    return Err(Error::ename(EBADOFFSET));
                }
                let isdir = f.qid().typ.contains(QidType::DIR);
                if isdir && offset != 0 && offset != f.offset() {
                    return Err(Error::ename(EBADOFFSET));
                }
                match f.omode() {
                    Some(m) if matches!(m & 3, om::READ | om::RDWR | om::EXEC) => {}
                    _ => return Err(Error::ename(EBOTCH)),
                }
                let count = count.min(session.msize.saturating_sub(IOHDRSZ));
                Ok((f, count, isdir))
            })
        };
        let (fid, count, isdir) = match validated {
            Ok(v) => v,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let result = match self.fs.read(&fid, offset, count).await {
            Ok(Fcall::Rread { data }) => {
                if isdir {
                    fid.set_offset(offset + data.0.len() as u64);
                }
                Ok(Fcall::Rread { data })
            }
            other => other,
        };
        self.respond(tag, result).await;
    }

    async fn twrite(&self, tag: u16, fid: u32, offset: u64, data: Data) {
        let validated = {
            let session = self.session.state.lock().await;
            session.lookup(fid).and_then(|f| {
                if offset > i64::MAX as u64 {
                    return Err(Error::ename(EBOTCH));
                }
                match f.omode() {
                    None => return Err(Error::ename(EBOTCH)),
                    Some(m) if matches!(m & 3, om::WRITE | om::RDWR) => {}
                    Some(m) => {
                        return Err(Error::Ename(format!(
                            "write on fid with open mode {:#x}",
                            m
                        )));
                    }
                }
                let cap = session.msize.saturating_sub(IOHDRSZ) as usize;
                Ok((f, cap))
            })
        };
        let (fid, cap) = match validated {
            Ok(v) => v,
            Err(e) => return self.respond(tag, Err(e)).await,
        };

        let data = if data.0.len() > cap {
            Data(data.0[..cap].to_vec())
        } else {
            data
        };
        let result = self.fs.write(&fid, offset, &data).await;
        self.respond(tag, result).await;
    }

    async fn tclunk(&self, tag: u16, fid: u32) {
        let removed = {
            let mut session = self.session.state.lock().await;
            session.remove(fid)
        };
        match removed {
            None => self.respond(tag, Err(Error::ename(EUNKNOWNFID))).await,
            Some(f) => {
                self.fs.destroy_fid(&f).await;
                self.respond(tag, Ok(Fcall::Rclunk)).await;
            }
        }
    }

    async fn tremove(&self, tag: u16, fid: u32) {
        let removed = {
            let mut session = self.session.state.lock().await;
            session.remove(fid)
        };
        match removed {
            None => self.respond(tag, Err(Error::ename(EUNKNOWNFID))).await,
            Some(f) => {
                // The fid is consumed whether or not the backend refuses.
                let result = self.fs.remove(&f).await;
                self.respond(tag, result).await;
                self.fs.destroy_fid(&f).await;
            }
        }
    }

    async fn tstat(&self, tag: u16, fid: u32) {
        let looked = {
            let session = self.session.state.lock().await;
            session.lookup(fid)
        };
        let result = match looked {
            Ok(f) => self.fs.stat(&f).await,
            Err(e) => Err(e),
        };
        self.respond(tag, result).await;
    }

    async fn twstat(&self, tag: u16, fid: u32, stat: Stat) {
        let looked = {
            let session = self.session.state.lock().await;
            session.lookup(fid)
        };
        let result = match looked {
            Ok(f) => self.fs.wstat(&f, &stat).await,
            Err(e) => Err(e),
        };
        self.respond(tag, result).await;
    }

    /// Remove a fid from the table and run the backend's destroy hook.
    async fn drop_fid(&self, fid: u32) {
        let removed = {
            let mut session = self.session.state.lock().await;
            session.remove(fid)
        };
        if let Some(f) = removed {
            self.fs.destroy_fid(&f).await;
        }
    }

    /// The reply path. Retires the tag, writes the reply (`Rerror` when the
    /// handler produced an error), then drains every `Rflush` parked on
    /// this request, all under one writer acquisition so nothing can land
    /// between a reply and its flushes. Responding twice to a tag is a
    /// no-op.
    async fn respond(&self, tag: u16, result: Result<Fcall>) {
        let flushes = {
            let mut session = self.session.state.lock().await;
            match session.reqs.remove(&tag) {
                Some(inflight) => inflight.flushes,
                None => return,
            }
        };
        let body = match result {
            Ok(body) => body,
            Err(e) => Fcall::Rerror {
                ename: e.to_ename(),
            },
        };

        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, &Msg { tag, body }).await;

        let mut queue: VecDeque<u16> = flushes.into();
        while let Some(ftag) = queue.pop_front() {
            let waiters = {
                let mut session = self.session.state.lock().await;
                session.reqs.remove(&ftag).map(|inflight| inflight.flushes)
            };
            if let Some(waiters) = waiters {
                self.write_locked(
                    &mut writer,
                    &Msg {
                        tag: ftag,
                        body: Fcall::Rflush,
                    },
                )
                .await;
                queue.extend(waiters);
            }
        }
    }

    /// Error reply that bypasses the request table; used for duplicate
    /// tags, where the original request must stay pinned.
    async fn write_error(&self, tag: u16, ename: &str) {
        let msg = Msg {
            tag,
            body: Fcall::Rerror {
                ename: ename.to_owned(),
            },
        };
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, &msg).await;
    }

    async fn write_locked(&self, writer: &mut FramedWrite<W, LengthDelimitedCodec>, msg: &Msg) {
        let mut buf = bytes::BytesMut::with_capacity(4096).writer();
        if let Err(e) = serialize::write_msg(&mut buf, msg) {
            error!("failed to serialize reply for tag {}: {:?}", msg.tag, e);
            return;
        }
        if let Err(e) = writer.send(buf.into_inner().freeze()).await {
            error!("failed to send reply for tag {}: {:?}", msg.tag, e);
            return;
        }
        info!("\t→ {:?}", msg);
    }
}

fn walk_validate<T: Default>(
    session: &mut SessionState<T>,
    fid: u32,
    newfid: u32,
    wnames: &[String],
) -> Result<(Arc<Fid<T>>, Arc<Fid<T>>)> {
    let src = session.lookup(fid)?;
    if src.omode().is_some() {
        return Err(Error::ename(ECLONEOPEN));
    }
    if !wnames.is_empty() && !src.qid().typ.contains(QidType::DIR) {
        return Err(Error::ename(EWALKNODIR));
    }
    let dst = if fid != newfid {
        let dst = session.alloc(newfid, src.uid())?;
        dst.set_qid(src.qid());
        dst
    } else {
        src.clone()
    };
    Ok((src, dst))
}

fn open_validate<T>(fid: &Fid<T>, mode: u8) -> Result<()> {
    if fid.omode().is_some() {
        return Err(Error::ename(EBOTCH));
    }
    let isdir = fid.qid().typ.contains(QidType::DIR);
    if isdir && (mode & !om::TRUNC) != om::READ {
        return Err(Error::ename(EISDIR));
    }
    let mut access = match mode & 3 {
        om::READ => am::READ,
        om::WRITE => am::WRITE,
        om::RDWR => am::READ | am::WRITE,
        _ => am::EXEC,
    };
    if mode & om::TRUNC != 0 {
        access |= am::WRITE;
    }
    if isdir && access != am::READ {
        return Err(Error::ename(EPERM));
    }
    Ok(())
}
