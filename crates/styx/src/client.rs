//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! The client is strictly synchronous: one request is outstanding on the
//! connection at a time, and every reply is matched against the request's
//! tag and type before it is surfaced. Tags still rotate through the u16
//! space (skipping `NOTAG`) so concurrent-request support can be added
//! without changing the wire behavior.

use {
    crate::{
        error::{self, Error},
        fcall::*,
        io_err, res, serialize,
        utils::Result,
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::debug,
    std::io::SeekFrom,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_stream::StreamExt,
    tokio_util::codec::{Framed, length_delimited::LengthDelimitedCodec},
};

/// Open modes used by `Client::access`, indexed by `mode & 7`
const OMODE_TABLE: [u8; 8] = [
    0,
    om::EXEC,
    om::WRITE,
    om::RDWR,
    om::READ,
    om::EXEC,
    om::RDWR,
    om::RDWR,
];

/// A file handle on a mounted connection.
///
/// A `Fid` holds no reference to its client; every wire operation on it goes
/// through the `Client` it was produced by. Handles are cheap to clone, but
/// a clone shares the same fid number on the server, so clunking one
/// invalidates the others.
#[derive(Clone, Debug)]
pub struct Fid {
    fid: u32,
    qid: Qid,
    mode: Option<u8>,
    offset: u64,
}

impl Fid {
    /// Raw fid number on the connection
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// The server's current qid for this file
    pub fn qid(&self) -> Qid {
        self.qid
    }

    /// The mode this fid was opened with, `None` until opened
    pub fn omode(&self) -> Option<u8> {
        self.mode
    }

    /// Implicit stream offset used by `read`/`write`, adjustable via `seek`
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// One 9P2000 connection speaking to a server over a byte stream.
pub struct Client<S> {
    transport: Framed<S, LengthDelimitedCodec>,
    msize: u32,
    nexttag: u16,
    nextfid: u32,
    root: Fid,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Establish a session on an already-connected stream: negotiate the
    /// protocol version, then attach to `aname` as the current OS user.
    pub async fn mount(stream: S, aname: &str) -> Result<Client<S>> {
        Self::mount_as(stream, &getuser(), aname).await
    }

    /// Like `mount`, with an explicit user name.
    pub async fn mount_as(stream: S, uname: &str, aname: &str) -> Result<Client<S>> {
        let mut client = Client {
            transport: serialize::frame_builder().new_framed(stream),
            msize: 8192,
            nexttag: 1,
            nextfid: 1,
            root: Fid {
                fid: NOFID,
                qid: Qid::default(),
                mode: None,
                offset: 0,
            },
        };
        client.version(8192).await?;
        client.root = client.attach(None, uname, aname).await?;
        Ok(client)
    }

    /// Clunk the root fid and drop the transport.
    pub async fn unmount(mut self) -> Result<()> {
        let root = self.root.clone();
        self.clunk(root).await
    }

    /// The fid established by the session's attach
    pub fn root(&self) -> &Fid {
        &self.root
    }

    /// Maximum message size negotiated for this connection
    pub fn msize(&self) -> u32 {
        self.msize
    }

    fn next_tag(&mut self) -> u16 {
        let tag = self.nexttag;
        self.nexttag = self.nexttag.wrapping_add(1);
        if self.nexttag == NOTAG {
            self.nexttag = 1;
        }
        tag
    }

    fn next_fid(&mut self) -> u32 {
        let fid = self.nextfid;
        self.nextfid = self.nextfid.wrapping_add(1);
        if self.nextfid == NOFID {
            self.nextfid = 1;
        }
        fid
    }

    /// Issue one RPC: assign a tag, write the request, read one reply.
    ///
    /// The reply must decode, carry the request's tag, and have the type
    /// code one past the request's. An `Rerror` reply is surfaced as
    /// `Error::Ename` so the caller can distinguish a server-side refusal
    /// from a transport failure.
    async fn rpc(&mut self, body: Fcall) -> Result<Fcall> {
        let tag = match body {
            Fcall::Tversion { .. } => NOTAG,
            _ => self.next_tag(),
        };
        let txtype = MsgType::from(&body) as u8;
        let tx = Msg { tag, body };
        debug!("-> {:?}", tx);

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, &tx)?;
        self.transport.send(writer.into_inner().freeze()).await?;

        let frame = match self.transport.next().await {
            Some(frame) => frame?,
            None => return res!(io_err!(UnexpectedEof, "connection closed")),
        };
        let rx = serialize::read_msg(&mut frame.reader())?;
        debug!("<- {:?}", rx);

        if let Fcall::Rerror { ref ename } = rx.body {
            return Err(Error::Ename(ename.clone()));
        }
        if MsgType::from(&rx.body) as u8 != txtype + 1 || rx.tag != tag {
            return res!(io_err!(InvalidData, "mismatched reply"));
        }
        Ok(rx.body)
    }

    async fn version(&mut self, msize: u32) -> Result<()> {
        let rx = self
            .rpc(Fcall::Tversion {
                msize,
                version: P92000.to_owned(),
            })
            .await?;
        match rx {
            Fcall::Rversion {
                msize: rmsize,
                version,
            } if version == P92000 => {
                self.msize = msize.min(rmsize);
                Ok(())
            }
            _ => res!(io_err!(InvalidData, "version mismatch")),
        }
    }

    /// Obtain an auth fid to carry the authentication exchange, for servers
    /// that require one before `attach`.
    pub async fn auth(&mut self, uname: &str, aname: &str) -> Result<Fid> {
        let afid = self.next_fid();
        let rx = self
            .rpc(Fcall::Tauth {
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?;
        match rx {
            Fcall::Rauth { aqid } => Ok(Fid {
                fid: afid,
                qid: aqid,
                mode: None,
                offset: 0,
            }),
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Establish a root fid for `aname` under `uname`, optionally presenting
    /// a previously authenticated fid.
    pub async fn attach(&mut self, afid: Option<&Fid>, uname: &str, aname: &str) -> Result<Fid> {
        let fid = self.next_fid();
        let rx = self
            .rpc(Fcall::Tattach {
                fid,
                afid: afid.map_or(NOFID, |f| f.fid),
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?;
        match rx {
            Fcall::Rattach { qid } => Ok(Fid {
                fid,
                qid,
                mode: None,
                offset: 0,
            }),
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Walk from the root to `path`, producing a fresh fid.
    pub async fn walk(&mut self, path: &str) -> Result<Fid> {
        let (fid, qid) = (self.root.fid, self.root.qid);
        self.walk_fid(fid, qid, path).await
    }

    /// Walk from an existing fid, which must not be open.
    pub async fn walk_from(&mut self, fid: &Fid, path: &str) -> Result<Fid> {
        self.walk_fid(fid.fid, fid.qid, path).await
    }

    /// The walk core: path elements go out in batches of at most `MAXWELEM`
    /// names, the first batch from the source fid, later batches chained
    /// through the new fid. A batch answered with fewer qids than names is
    /// a failure; a chained fid is clunked on the way out.
    async fn walk_fid(&mut self, srcfid: u32, srcqid: Qid, path: &str) -> Result<Fid> {
        let wfid = self.next_fid();
        let mut qid = srcqid;
        let parts: Vec<String> = walk_elements(path);

        let mut first = true;
        let mut batches = parts.chunks(MAXWELEM);
        loop {
            let wnames = match batches.next() {
                Some(chunk) => chunk.to_vec(),
                None if first => Vec::new(), // empty path clones the source
                None => break,
            };
            let nwname = wnames.len();
            let res = self
                .rpc(Fcall::Twalk {
                    fid: if first { srcfid } else { wfid },
                    newfid: wfid,
                    wnames,
                })
                .await;
            match res {
                Ok(Fcall::Rwalk { wqids }) if wqids.len() == nwname => {
                    if let Some(last) = wqids.last() {
                        qid = *last;
                    }
                }
                other => {
                    if !first {
                        let _ = self.clunk_fid(wfid).await;
                    }
                    return match other {
                        Err(e) => Err(e),
                        Ok(_) => Err(Error::ename(error::string::ENOTFOUND)),
                    };
                }
            }
            if nwname == 0 {
                break;
            }
            first = false;
        }

        Ok(Fid {
            fid: wfid,
            qid,
            mode: None,
            offset: 0,
        })
    }

    /// Walk to `name` and open it; the fid is clunked if the open fails.
    pub async fn open(&mut self, name: &str, mode: u8) -> Result<Fid> {
        let mut fid = self.walk(name).await?;
        match self.fopen(&mut fid, mode).await {
            Ok(()) => Ok(fid),
            Err(e) => {
                let _ = self.clunk(fid).await;
                Err(e)
            }
        }
    }

    /// Open an already-walked fid.
    pub async fn fopen(&mut self, fid: &mut Fid, mode: u8) -> Result<()> {
        let rx = self.rpc(Fcall::Topen { fid: fid.fid, mode }).await?;
        match rx {
            Fcall::Ropen { qid, .. } => {
                fid.mode = Some(mode);
                fid.qid = qid;
                fid.offset = 0;
                Ok(())
            }
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Create `name` in its parent directory and leave the fid open on the
    /// new file.
    pub async fn create(&mut self, name: &str, mode: u8, perm: u32) -> Result<Fid> {
        let (dir, elem) = split_path(name);
        let mut fid = self.walk(dir).await?;
        match self.fcreate(&mut fid, elem, mode, perm).await {
            Ok(()) => Ok(fid),
            Err(e) => {
                let _ = self.clunk(fid).await;
                Err(e)
            }
        }
    }

    /// Create `name` in the directory `fid` refers to; on success the fid
    /// becomes an open fid for the new file.
    pub async fn fcreate(&mut self, fid: &mut Fid, name: &str, mode: u8, perm: u32) -> Result<()> {
        let rx = self
            .rpc(Fcall::Tcreate {
                fid: fid.fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?;
        match rx {
            Fcall::Rcreate { qid, .. } => {
                fid.mode = Some(mode);
                fid.qid = qid;
                fid.offset = 0;
                Ok(())
            }
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Walk to `name` and remove it. The walked fid is consumed by the
    /// server whether or not the removal succeeds.
    pub async fn remove(&mut self, name: &str) -> Result<()> {
        let fid = self.walk(name).await?;
        self.fremove(fid).await
    }

    /// Remove the file `fid` refers to, consuming the fid.
    pub async fn fremove(&mut self, fid: Fid) -> Result<()> {
        match self.rpc(Fcall::Tremove { fid: fid.fid }).await? {
            Fcall::Rremove => Ok(()),
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Read at the fid's implicit offset, advancing it by the bytes read.
    /// A short read is normal; zero bytes means end-of-file.
    pub async fn read(&mut self, fid: &mut Fid, buf: &mut [u8]) -> Result<usize> {
        let offset = fid.offset;
        let n = self.pread(fid, buf, offset).await?;
        fid.offset += n as u64;
        Ok(n)
    }

    /// Read at an explicit offset without touching the implicit one.
    pub async fn pread(&mut self, fid: &Fid, buf: &mut [u8], offset: u64) -> Result<usize> {
        let count = (buf.len() as u64).min(u64::from(self.msize - IOHDRSZ)) as u32;
        let rx = self
            .rpc(Fcall::Tread {
                fid: fid.fid,
                offset,
                count,
            })
            .await?;
        match rx {
            Fcall::Rread { data } => {
                let n = data.0.len().min(buf.len());
                buf[..n].copy_from_slice(&data.0[..n]);
                Ok(n)
            }
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Read until `buf` is full or the server reports end-of-file.
    pub async fn readn(&mut self, fid: &mut Fid, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.read(fid, &mut buf[total..]).await {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(total)
    }

    /// Write at the fid's implicit offset, advancing it by the bytes
    /// written.
    pub async fn write(&mut self, fid: &mut Fid, buf: &[u8]) -> Result<usize> {
        let offset = fid.offset;
        let n = self.pwrite(fid, buf, offset).await?;
        fid.offset += n as u64;
        Ok(n)
    }

    /// Write at an explicit offset. The buffer goes out in chunks of at
    /// most `msize - IOHDRSZ` bytes; a partial inner write stops the loop
    /// and the total written so far is returned.
    pub async fn pwrite(&mut self, fid: &Fid, buf: &[u8], offset: u64) -> Result<usize> {
        let chunk = (self.msize - IOHDRSZ) as usize;
        let mut total = 0;
        while total < buf.len() {
            let want = (buf.len() - total).min(chunk);
            let res = self
                .rpc(Fcall::Twrite {
                    fid: fid.fid,
                    offset: offset + total as u64,
                    data: Data(buf[total..total + want].to_vec()),
                })
                .await;
            match res {
                Ok(Fcall::Rwrite { count }) => {
                    let got = count as usize;
                    if got == 0 {
                        if total == 0 {
                            return res!(io_err!(WriteZero, "zero-length write"));
                        }
                        break;
                    }
                    total += got;
                    if got < want {
                        break;
                    }
                }
                Ok(_) => return res!(io_err!(InvalidData, "mismatched reply")),
                Err(e) => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(total)
    }

    /// One directory read of up to `DIRMAX` bytes, parsed into entries.
    pub async fn dirread(&mut self, fid: &mut Fid) -> Result<Vec<Stat>> {
        let mut buf = vec![0; DIRMAX as usize];
        let n = self.read(fid, &mut buf).await?;
        dir_entries(&buf[..n])
    }

    /// Read the directory to the end (up to `DIRBUFMAX` bytes in total) and
    /// parse every entry.
    pub async fn dirreadall(&mut self, fid: &mut Fid) -> Result<Vec<Stat>> {
        let mut buf = Vec::new();
        while buf.len() + DIRMAX as usize <= DIRBUFMAX as usize {
            let mut chunk = vec![0; DIRMAX as usize];
            match self.read(fid, &mut chunk).await {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    if buf.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        dir_entries(&buf)
    }

    /// Stat the fid.
    pub async fn fstat(&mut self, fid: &Fid) -> Result<Stat> {
        match self.rpc(Fcall::Tstat { fid: fid.fid }).await? {
            Fcall::Rstat { stat } => Ok(stat),
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Walk to `name`, stat it, clunk the fid.
    pub async fn stat(&mut self, name: &str) -> Result<Stat> {
        let fid = self.walk(name).await?;
        let stat = self.fstat(&fid).await;
        let _ = self.clunk(fid).await;
        stat
    }

    /// Update the fid's metadata.
    pub async fn fwstat(&mut self, fid: &Fid, stat: &Stat) -> Result<()> {
        let rx = self
            .rpc(Fcall::Twstat {
                fid: fid.fid,
                stat: stat.clone(),
            })
            .await?;
        match rx {
            Fcall::Rwstat => Ok(()),
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }

    /// Walk to `name`, update its metadata, clunk the fid.
    pub async fn wstat(&mut self, name: &str, stat: &Stat) -> Result<()> {
        let fid = self.walk(name).await?;
        let r = self.fwstat(&fid, stat).await;
        let _ = self.clunk(fid).await;
        r
    }

    /// Adjust the fid's implicit offset. `SeekFrom::End` issues a stat for
    /// the current file length; a negative resulting position is an error.
    pub async fn seek(&mut self, fid: &mut Fid, pos: SeekFrom) -> Result<u64> {
        let newpos = match pos {
            SeekFrom::Start(offset) => {
                fid.offset = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => fid.offset as i64 + delta,
            SeekFrom::End(delta) => {
                let stat = self.fstat(fid).await?;
                stat.length as i64 + delta
            }
        };
        if newpos < 0 {
            return res!(io_err!(InvalidInput, "negative seek offset"));
        }
        fid.offset = newpos as u64;
        Ok(newpos as u64)
    }

    /// Reachability test: `am::EXIST` stats the path, any other mode opens
    /// it with the matching open mode and clunks. No permission bits are
    /// inspected on the client side.
    pub async fn access(&mut self, name: &str, mode: u32) -> Result<()> {
        if mode == am::EXIST {
            let stat = self.stat(name).await?;
            if stat.name.is_empty() {
                return Err(Error::ename(error::string::ENOTFOUND));
            }
            return Ok(());
        }
        let fid = self.open(name, OMODE_TABLE[(mode & 7) as usize]).await?;
        self.clunk(fid).await
    }

    /// Release a fid.
    pub async fn clunk(&mut self, fid: Fid) -> Result<()> {
        self.clunk_fid(fid.fid).await
    }

    async fn clunk_fid(&mut self, fid: u32) -> Result<()> {
        match self.rpc(Fcall::Tclunk { fid }).await? {
            Fcall::Rclunk => Ok(()),
            _ => res!(io_err!(InvalidData, "mismatched reply")),
        }
    }
}

/// Current process user, `"none"` when the uid has no passwd entry.
fn getuser() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| "none".to_owned())
}

/// Split a path into walkable elements, dropping empty components and `.`
fn walk_elements(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_owned)
        .collect()
}

/// Split off the last path element: `"a/b/c"` becomes `("a/b", "c")`
fn split_path(name: &str) -> (&str, &str) {
    match name.rsplit_once('/') {
        Some((dir, elem)) => (dir, elem),
        None => ("", name),
    }
}

/// Parse a directory-read payload: a concatenation of size-prefixed stat
/// records, each independently decodable.
fn dir_entries(buf: &[u8]) -> Result<Vec<Stat>> {
    use crate::serialize::Decodable;

    let mut entries = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        if i + 2 > buf.len() {
            return res!(io_err!(InvalidData, "truncated directory entry"));
        }
        let m = 2 + u16::from_le_bytes([buf[i], buf[i + 1]]) as usize;
        if i + m > buf.len() {
            return res!(io_err!(InvalidData, "truncated directory entry"));
        }
        let mut record = &buf[i..i + m];
        let stat: Stat = Decodable::decode(&mut record)?;
        if stat.name.is_empty() && m > 2 {
            return res!(io_err!(InvalidData, "corrupted directory entry"));
        }
        entries.push(stat);
        i += m;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::Encodable;

    #[test]
    fn walk_element_splitting() {
        assert_eq!(walk_elements("a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(walk_elements("/a//b/"), vec!["a", "b"]);
        assert_eq!(walk_elements("./a/./b"), vec!["a", "b"]);
        assert!(walk_elements("").is_empty());
        assert!(walk_elements("/").is_empty());
        assert!(walk_elements(".").is_empty());
    }

    #[test]
    fn path_splitting() {
        assert_eq!(split_path("a/b/c"), ("a/b", "c"));
        assert_eq!(split_path("c"), ("", "c"));
        assert_eq!(split_path("/c"), ("", "c"));
    }

    #[test]
    fn access_mode_table() {
        assert_eq!(OMODE_TABLE[am::EXEC as usize], om::EXEC);
        assert_eq!(OMODE_TABLE[am::WRITE as usize], om::WRITE);
        assert_eq!(OMODE_TABLE[am::READ as usize], om::READ);
        assert_eq!(OMODE_TABLE[(am::READ | am::WRITE) as usize], om::RDWR);
    }

    fn entry(name: &str) -> Stat {
        Stat {
            name: name.to_owned(),
            uid: "u".to_owned(),
            gid: "g".to_owned(),
            muid: "u".to_owned(),
            ..Stat::default()
        }
    }

    #[test]
    fn dir_entry_concatenation() {
        let mut buf = Vec::new();
        for name in ["a", "bb", "ccc"] {
            entry(name).encode(&mut buf).unwrap();
        }
        let entries = dir_entries(&buf).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "bb", "ccc"]);
    }

    #[test]
    fn dir_entry_truncation() {
        let mut buf = Vec::new();
        entry("a").encode(&mut buf).unwrap();
        buf.pop();
        assert!(dir_entries(&buf).is_err());
    }

    #[test]
    fn dir_entry_zero_name() {
        let mut buf = Vec::new();
        entry("").encode(&mut buf).unwrap();
        assert!(dir_entries(&buf).is_err());
    }
}
