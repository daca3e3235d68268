//! Client/server sessions over an in-process duplex stream.

use {
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    std::{
        collections::HashMap,
        io::SeekFrom,
        sync::{Arc, Mutex},
    },
    styx::{
        Data, Error, Fcall, Msg, NOFID, NOTAG, Qid, QidType, Result, Stat, am, dm, errstr,
        client::Client,
        om, serialize,
        srv::{Fid, Filesystem, Session, serve},
    },
    tokio::{
        io::{DuplexStream, duplex, split},
        sync::{Notify, RwLock},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{Framed, length_delimited::LengthDelimitedCodec},
};

#[derive(Clone)]
struct TestNode {
    qid: Qid,
    content: Vec<u8>,
    children: Vec<String>,
}

impl TestNode {
    fn is_dir(&self) -> bool {
        self.qid.typ.contains(QidType::DIR)
    }
}

/// A tiny in-memory tree backend. Paths are relative to the root ("" is the
/// root itself). The file "slow" parks reads on a gate so tests can hold a
/// request open, and "ro" refuses removal.
#[derive(Clone)]
struct TestFs {
    nodes: Arc<Mutex<HashMap<String, TestNode>>>,
    gate: Arc<Notify>,
    walks: Arc<Mutex<Vec<(u32, u32, usize)>>>,
    writes: Arc<Mutex<Vec<(u64, usize)>>>,
    destroyed: Arc<Mutex<Vec<u32>>>,
}

impl TestFs {
    fn new() -> TestFs {
        let mut nodes = HashMap::new();
        let mut qidpath = 0u64;
        let mut dir = |nodes: &mut HashMap<String, TestNode>, path: &str, children: Vec<&str>| {
            qidpath += 1;
            nodes.insert(
                path.to_owned(),
                TestNode {
                    qid: Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: qidpath,
                    },
                    content: Vec::new(),
                    children: children.into_iter().map(str::to_owned).collect(),
                },
            );
        };
        dir(&mut nodes, "", vec!["a", "ro", "slow", "w", "w0"]);
        dir(&mut nodes, "a", vec!["b"]);

        let mut qidpath = 100u64;
        let mut file = |nodes: &mut HashMap<String, TestNode>, path: &str, content: &[u8]| {
            qidpath += 1;
            nodes.insert(
                path.to_owned(),
                TestNode {
                    qid: Qid {
                        typ: QidType::FILE,
                        version: 0,
                        path: qidpath,
                    },
                    content: content.to_vec(),
                    children: Vec::new(),
                },
            );
        };
        file(&mut nodes, "a/b", b"hello, 9p");
        file(&mut nodes, "ro", b"keep");
        file(&mut nodes, "slow", b"");
        file(&mut nodes, "w", b"");

        // a 40-deep chain for walk batching
        let mut path = String::new();
        for i in 0..40 {
            let name = format!("w{}", i);
            let next = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path, name)
            };
            nodes.insert(
                next.clone(),
                TestNode {
                    qid: Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: 1000 + i,
                    },
                    content: Vec::new(),
                    children: vec![format!("w{}", i + 1)],
                },
            );
            path = next;
        }

        TestFs {
            nodes: Arc::new(Mutex::new(nodes)),
            gate: Arc::new(Notify::new()),
            walks: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn node(&self, path: &str) -> Option<TestNode> {
        self.nodes.lock().unwrap().get(path).cloned()
    }

    fn stat_of(&self, path: &str) -> Stat {
        let node = self.node(path).expect("stat of missing node");
        let name = match path.rsplit('/').next() {
            Some("") | None => "/",
            Some(last) => last,
        };
        Stat {
            typ: 0,
            dev: 0,
            qid: node.qid,
            mode: if node.is_dir() {
                dm::DIR | 0o755
            } else {
                0o644
            },
            atime: 1_700_000_000,
            mtime: 1_700_000_000,
            length: node.content.len() as u64,
            name: name.to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: "glenda".to_owned(),
        }
    }

    fn dir_bytes(&self, path: &str) -> Vec<u8> {
        use styx::serialize::Encodable;

        let node = self.node(path).expect("dir bytes of missing node");
        let mut buf = Vec::new();
        for child in &node.children {
            let childpath = if path.is_empty() {
                child.clone()
            } else {
                format!("{}/{}", path, child)
            };
            self.stat_of(&childpath).encode(&mut buf).unwrap();
        }
        buf
    }
}

#[async_trait]
impl Filesystem for TestFs {
    type Fid = RwLock<String>;

    async fn auth(&self, _afid: &Fid<Self::Fid>, uname: &str, _aname: &str) -> Result<Fcall> {
        if uname == "mallory" {
            return Err(Error::ename("authentication failed"));
        }
        Ok(Fcall::Rauth {
            aqid: Qid {
                typ: QidType::AUTH,
                version: 0,
                path: 999,
            },
        })
    }

    async fn attach(
        &self,
        fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Fcall> {
        *fid.aux.write().await = String::new();
        Ok(Fcall::Rattach {
            qid: self.node("").unwrap().qid,
        })
    }

    async fn walk(
        &self,
        fid: &Fid<Self::Fid>,
        newfid: &Fid<Self::Fid>,
        wnames: &[String],
    ) -> Result<Fcall> {
        self.walks
            .lock()
            .unwrap()
            .push((fid.fid(), newfid.fid(), wnames.len()));

        let mut path = fid.aux.read().await.clone();
        let mut wqids = Vec::new();
        for (i, name) in wnames.iter().enumerate() {
            let next = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path, name)
            };
            match self.node(&next) {
                Some(node) => {
                    wqids.push(node.qid);
                    path = next;
                }
                None if i == 0 => return Err(Error::ename(errstr::ENOTFOUND)),
                None => break,
            }
        }
        *newfid.aux.write().await = path;
        Ok(Fcall::Rwalk { wqids })
    }

    async fn read(&self, fid: &Fid<Self::Fid>, offset: u64, count: u32) -> Result<Fcall> {
        let path = fid.aux.read().await.clone();
        if path == "slow" {
            self.gate.notified().await;
            return Ok(Fcall::Rread {
                data: Data(b"hi".to_vec()),
            });
        }
        let node = self.node(&path).ok_or_else(|| Error::ename("gone"))?;
        let bytes = if node.is_dir() {
            self.dir_bytes(&path)
        } else {
            node.content
        };
        let start = (offset as usize).min(bytes.len());
        let end = (start + count as usize).min(bytes.len());
        Ok(Fcall::Rread {
            data: Data(bytes[start..end].to_vec()),
        })
    }

    async fn write(&self, fid: &Fid<Self::Fid>, offset: u64, data: &Data) -> Result<Fcall> {
        let path = fid.aux.read().await.clone();
        self.writes.lock().unwrap().push((offset, data.0.len()));

        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&path).ok_or_else(|| Error::ename("gone"))?;
        let end = offset as usize + data.0.len();
        if node.content.len() < end {
            node.content.resize(end, 0);
        }
        node.content[offset as usize..end].copy_from_slice(&data.0);
        Ok(Fcall::Rwrite {
            count: data.0.len() as u32,
        })
    }

    async fn create(
        &self,
        fid: &Fid<Self::Fid>,
        name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<Fcall> {
        let dirpath = fid.aux.read().await.clone();
        let path = if dirpath.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", dirpath, name)
        };
        let qid = {
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&path) {
                return Err(Error::ename("file exists"));
            }
            let qid = Qid {
                typ: QidType::FILE,
                version: 0,
                path: 9000 + nodes.len() as u64,
            };
            nodes.insert(
                path.clone(),
                TestNode {
                    qid,
                    content: Vec::new(),
                    children: Vec::new(),
                },
            );
            nodes
                .get_mut(&dirpath)
                .expect("parent directory")
                .children
                .push(name.to_owned());
            qid
        };
        *fid.aux.write().await = path;
        Ok(Fcall::Rcreate { qid, iounit: 0 })
    }

    async fn stat(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let path = fid.aux.read().await.clone();
        if self.node(&path).is_none() {
            return Err(Error::ename(errstr::ENOTFOUND));
        }
        Ok(Fcall::Rstat {
            stat: self.stat_of(&path),
        })
    }

    async fn remove(&self, fid: &Fid<Self::Fid>) -> Result<Fcall> {
        let path = fid.aux.read().await.clone();
        if path == "ro" {
            return Err(Error::ename(errstr::ENOREMOVE));
        }
        self.nodes.lock().unwrap().remove(&path);
        Ok(Fcall::Rremove)
    }

    async fn destroy_fid(&self, fid: &Fid<Self::Fid>) {
        self.destroyed.lock().unwrap().push(fid.fid());
    }
}

/// Spawn a server session on one end of a duplex pipe and hand back the
/// client end.
fn pipe_to<Fs>(fs: Fs) -> DuplexStream
where
    Fs: Filesystem + 'static,
    Fs::Fid: 'static,
{
    let (ours, theirs) = duplex(1 << 20);
    let (r, w) = split(theirs);
    tokio::spawn(serve(fs, r, w));
    ours
}

/// A raw framed peer for driving the server with hand-built messages.
struct Peer {
    framed: Framed<DuplexStream, LengthDelimitedCodec>,
}

impl Peer {
    fn new(stream: DuplexStream) -> Peer {
        Peer {
            framed: serialize::frame_builder().new_framed(stream),
        }
    }

    async fn send(&mut self, tag: u16, body: Fcall) {
        let mut writer = bytes::BytesMut::new().writer();
        serialize::write_msg(&mut writer, &Msg { tag, body }).unwrap();
        self.framed.send(writer.into_inner().freeze()).await.unwrap();
    }

    async fn recv(&mut self) -> Msg {
        let frame = self.framed.next().await.expect("peer closed").unwrap();
        serialize::read_msg(&mut frame.reader()).unwrap()
    }

    /// Version + attach preamble; returns with fid 1 attached at the root.
    async fn handshake(&mut self) {
        self.send(
            NOTAG,
            Fcall::Tversion {
                msize: 8192,
                version: styx::P92000.to_owned(),
            },
        )
        .await;
        assert!(matches!(self.recv().await.body, Fcall::Rversion { .. }));

        self.send(
            1,
            Fcall::Tattach {
                fid: 1,
                afid: NOFID,
                uname: "alice".to_owned(),
                aname: String::new(),
            },
        )
        .await;
        let rx = self.recv().await;
        assert_eq!(rx.tag, 1);
        assert!(matches!(rx.body, Fcall::Rattach { .. }));
    }
}

#[tokio::test]
async fn mount_establishes_root() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    assert!(client.root().qid().typ.contains(QidType::DIR));
    assert_eq!(client.msize(), 8192);
    client.unmount().await.unwrap();
}

#[tokio::test]
async fn walk_open_read() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let mut fid = client.open("a/b", om::READ).await.unwrap();
    assert_eq!(fid.omode(), Some(om::READ));
    assert!(!fid.qid().typ.contains(QidType::DIR));

    let mut buf = vec![0; 64];
    let n = client.read(&mut fid, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello, 9p");
    assert_eq!(fid.offset(), n as u64);

    // a second read sees end-of-file
    let n = client.read(&mut fid, &mut buf).await.unwrap();
    assert_eq!(n, 0);
    client.clunk(fid).await.unwrap();
}

#[tokio::test]
async fn readn_fills_or_hits_eof() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let mut fid = client.open("a/b", om::READ).await.unwrap();
    let mut buf = vec![0; 4];
    let n = client.readn(&mut fid, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hell");

    // the file has 5 bytes left; a larger buffer stops at end-of-file
    let mut buf = vec![0; 64];
    let n = client.readn(&mut fid, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"o, 9p");

    // explicit offsets leave the implicit one alone
    let mut buf = vec![0; 5];
    let n = client.pread(&fid, &mut buf, 7).await.unwrap();
    assert_eq!(&buf[..n], b"9p");
    assert_eq!(fid.offset(), 9);
    client.clunk(fid).await.unwrap();
}

#[tokio::test]
async fn open_missing_file_fails() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    match client.open("a/missing", om::READ).await {
        Err(Error::Ename(e)) => assert_eq!(e, errstr::ENOTFOUND),
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn write_chunks_at_msize() {
    let fs = TestFs::new();
    let writes = fs.writes.clone();
    let nodes = fs.nodes.clone();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let mut fid = client.open("w", om::WRITE).await.unwrap();
    let payload: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
    let n = client.write(&mut fid, &payload).await.unwrap();
    assert_eq!(n, 20000);

    // msize 8192 minus the 24-byte I/O header
    let chunk = 8192 - 24;
    assert_eq!(
        writes.lock().unwrap().as_slice(),
        &[
            (0, chunk),
            (chunk as u64, chunk),
            (2 * chunk as u64, 20000 - 2 * chunk),
        ]
    );
    assert_eq!(nodes.lock().unwrap().get("w").unwrap().content, payload);
}

#[tokio::test]
async fn create_then_read_back() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let mut fid = client.create("a/new", om::RDWR, 0o644).await.unwrap();
    assert_eq!(fid.omode(), Some(om::RDWR));
    client.write(&mut fid, b"fresh").await.unwrap();

    let mut buf = vec![0; 16];
    let n = client.pread(&fid, &mut buf, 0).await.unwrap();
    assert_eq!(&buf[..n], b"fresh");
    client.clunk(fid).await.unwrap();

    let stat = client.stat("a/new").await.unwrap();
    assert_eq!(stat.name, "new");
    assert_eq!(stat.length, 5);
}

#[tokio::test]
async fn dirread_enumerates_then_eof() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let mut root = client.walk("").await.unwrap();
    client.fopen(&mut root, om::READ).await.unwrap();

    let entries = client.dirreadall(&mut root).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "ro", "slow", "w", "w0"]);

    // enumeration done: the next read at the current offset reports EOF
    let more = client.dirread(&mut root).await.unwrap();
    assert!(more.is_empty());
    client.clunk(root).await.unwrap();
}

#[tokio::test]
async fn seek_adjusts_implicit_offset() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let mut fid = client.open("a/b", om::READ).await.unwrap();
    let pos = client.seek(&mut fid, SeekFrom::End(-2)).await.unwrap();
    assert_eq!(pos, 7);

    let mut buf = vec![0; 8];
    let n = client.read(&mut fid, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"9p");

    let pos = client.seek(&mut fid, SeekFrom::Current(-4)).await.unwrap();
    assert_eq!(pos, 5);
    let pos = client.seek(&mut fid, SeekFrom::Start(0)).await.unwrap();
    assert_eq!(pos, 0);

    assert!(client.seek(&mut fid, SeekFrom::Current(-1)).await.is_err());
    client.clunk(fid).await.unwrap();
}

#[tokio::test]
async fn access_checks_reachability() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    client.access("a/b", am::EXIST).await.unwrap();
    client.access("a/b", am::READ).await.unwrap();
    assert!(client.access("a/missing", am::EXIST).await.is_err());
}

#[tokio::test]
async fn wstat_prohibited_by_default() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let stat = client.stat("a/b").await.unwrap();
    match client.wstat("a/b", &stat).await {
        Err(Error::Ename(e)) => assert_eq!(e, errstr::ENOWSTAT),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn auth_then_attach_with_afid() {
    let fs = TestFs::new();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let afid = client.auth("alice", "").await.unwrap();
    assert!(afid.qid().typ.contains(QidType::AUTH));

    // present the established auth fid on a fresh attach
    let root = client.attach(Some(&afid), "alice", "").await.unwrap();
    assert!(root.qid().typ.contains(QidType::DIR));

    client.clunk(root).await.unwrap();
    client.clunk(afid).await.unwrap();
}

#[tokio::test]
async fn auth_refusal_releases_afid() {
    let fs = TestFs::new();
    let destroyed = fs.destroyed.clone();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Tauth {
            afid: 9,
            uname: "mallory".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, "authentication failed"),
        other => panic!("expected Rerror, got {:?}", other),
    }

    // the fid allocated for the exchange is gone again
    peer.send(3, Fcall::Tclunk { fid: 9 }).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
    assert!(destroyed.lock().unwrap().contains(&9));

    // an afid colliding with a live fid is refused outright
    peer.send(
        4,
        Fcall::Tauth {
            afid: 1,
            uname: "alice".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EDUPFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn attach_with_unknown_afid_is_undone() {
    let fs = TestFs::new();
    let destroyed = fs.destroyed.clone();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Tattach {
            fid: 5,
            afid: 77,
            uname: "alice".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }

    // fid 5 was allocated before the afid lookup failed and must not
    // survive the error
    peer.send(3, Fcall::Tclunk { fid: 5 }).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
    assert!(destroyed.lock().unwrap().contains(&5));
}

#[tokio::test]
async fn walk_batches_by_sixteen() {
    let fs = TestFs::new();
    let walks = fs.walks.clone();
    let mut client = Client::mount_as(pipe_to(fs), "alice", "").await.unwrap();

    let path: Vec<String> = (0..40).map(|i| format!("w{}", i)).collect();
    let fid = client.walk(&path.join("/")).await.unwrap();

    // three Twalk messages: 16, 16, 8 names, the second and third chained
    // through the new fid
    let log = walks.lock().unwrap().clone();
    let wfid = fid.fid();
    assert_eq!(
        log,
        vec![(1, wfid, 16), (wfid, wfid, 16), (wfid, wfid, 8)]
    );
    client.clunk(fid).await.unwrap();
}

/// A scripted server that logs every T-message and answers mechanically;
/// used to observe the client's side of the wire.
async fn script_server(stream: DuplexStream, log: Arc<Mutex<Vec<Msg>>>) {
    let mut peer = Peer::new(stream);
    let dirqid = Qid {
        typ: QidType::DIR,
        version: 0,
        path: 0,
    };
    loop {
        let frame = match peer.framed.next().await {
            Some(Ok(frame)) => frame,
            _ => return,
        };
        let msg = serialize::read_msg(&mut frame.reader()).unwrap();
        log.lock().unwrap().push(msg.clone());
        let reply = match msg.body {
            Fcall::Tversion { msize, version } => Fcall::Rversion { msize, version },
            Fcall::Tattach { .. } => Fcall::Rattach { qid: dirqid },
            Fcall::Twalk { ref wnames, .. } => Fcall::Rwalk {
                wqids: wnames.iter().map(|_| dirqid).collect(),
            },
            Fcall::Topen { .. } => Fcall::Ropen {
                qid: dirqid,
                iounit: 0,
            },
            Fcall::Tread { .. } => Fcall::Rread {
                data: Data(Vec::new()),
            },
            Fcall::Tstat { .. } => Fcall::Rstat {
                stat: Stat {
                    name: "x".to_owned(),
                    ..Stat::default()
                },
            },
            Fcall::Tclunk { .. } => Fcall::Rclunk,
            Fcall::Tremove { .. } => Fcall::Rremove,
            _ => Fcall::Rerror {
                ename: "unexpected".to_owned(),
            },
        };
        peer.send(msg.tag, reply).await;
    }
}

#[tokio::test]
async fn tags_unique_and_version_uses_notag() {
    let (ours, theirs) = duplex(1 << 20);
    let log = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(script_server(theirs, log.clone()));

    let mut client = Client::mount_as(ours, "alice", "").await.unwrap();
    for i in 0..10 {
        let fid = client.walk(&format!("d{}", i)).await.unwrap();
        client.clunk(fid).await.unwrap();
    }
    let _ = client.stat("d").await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(
        log[0],
        Msg {
            tag: NOTAG,
            body: Fcall::Tversion {
                msize: 8192,
                version: styx::P92000.to_owned(),
            },
        }
    );
    match &log[1].body {
        Fcall::Tattach {
            afid,
            uname,
            aname,
            ..
        } => {
            assert_eq!(*afid, NOFID);
            assert_eq!(uname, "alice");
            assert_eq!(aname, "");
        }
        other => panic!("unexpected second message: {:?}", other),
    }

    let tags: Vec<u16> = log.iter().skip(1).map(|m| m.tag).collect();
    let mut dedup = tags.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert!(!tags.contains(&NOTAG));
    assert_eq!(tags.len(), dedup.len(), "tags reused: {:?}", tags);
}

#[tokio::test]
async fn flush_waits_for_old_reply() {
    let fs = TestFs::new();
    let gate = fs.gate.clone();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["slow".to_owned()],
        },
    )
    .await;
    peer.recv().await;
    peer.send(3, Fcall::Topen { fid: 2, mode: om::READ }).await;
    peer.recv().await;

    // tag 5 parks in the backend; tag 6 asks to flush it
    peer.send(
        5,
        Fcall::Tread {
            fid: 2,
            offset: 0,
            count: 100,
        },
    )
    .await;
    peer.send(6, Fcall::Tflush { oldtag: 5 }).await;

    // let both requests land, then release the read
    tokio::task::yield_now().await;
    gate.notify_one();

    let first = peer.recv().await;
    assert_eq!(first.tag, 5);
    match first.body {
        Fcall::Rread { data } => assert_eq!(data.0, b"hi"),
        other => panic!("expected Rread, got {:?}", other),
    }

    let second = peer.recv().await;
    assert_eq!(second.tag, 6);
    assert!(matches!(second.body, Fcall::Rflush));
}

#[tokio::test]
async fn flush_of_unknown_tag_replies_immediately() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(7, Fcall::Tflush { oldtag: 999 }).await;
    let rx = peer.recv().await;
    assert_eq!(rx.tag, 7);
    assert!(matches!(rx.body, Fcall::Rflush));
}

#[tokio::test]
async fn partial_walk_closes_newfid() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["a".to_owned(), "missing".to_owned(), "b".to_owned()],
        },
    )
    .await;
    let rx = peer.recv().await;
    match rx.body {
        Fcall::Rwalk { wqids } => assert_eq!(wqids.len(), 1),
        other => panic!("expected partial Rwalk, got {:?}", other),
    }

    // the server tore the new fid down
    peer.send(3, Fcall::Tclunk { fid: 2 }).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn walk_to_nothing_is_not_found() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["missing".to_owned()],
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::ENOTFOUND),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn read_after_clunk_is_unknown_fid() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 2,
            newfid: 2,
            wnames: Vec::new(),
        },
    )
    .await;
    // walk source is the unknown fid 2
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }

    peer.send(3, Fcall::Tclunk { fid: 1 }).await;
    assert!(matches!(peer.recv().await.body, Fcall::Rclunk));

    peer.send(
        4,
        Fcall::Tread {
            fid: 1,
            offset: 0,
            count: 10,
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn read_on_unopened_fid_is_botch() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["a".to_owned(), "b".to_owned()],
        },
    )
    .await;
    peer.recv().await;

    peer.send(
        3,
        Fcall::Tread {
            fid: 2,
            offset: 0,
            count: 10,
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EBOTCH),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_tag_rejected() {
    let fs = TestFs::new();
    let gate = fs.gate.clone();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["slow".to_owned()],
        },
    )
    .await;
    peer.recv().await;
    peer.send(3, Fcall::Topen { fid: 2, mode: om::READ }).await;
    peer.recv().await;

    peer.send(
        7,
        Fcall::Tread {
            fid: 2,
            offset: 0,
            count: 10,
        },
    )
    .await;
    // tag 7 is still outstanding
    peer.send(7, Fcall::Tstat { fid: 1 }).await;
    let rx = peer.recv().await;
    assert_eq!(rx.tag, 7);
    match rx.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EDUPTAG),
        other => panic!("expected Rerror, got {:?}", other),
    }

    // the original request is unharmed
    gate.notify_one();
    let rx = peer.recv().await;
    assert_eq!(rx.tag, 7);
    assert!(matches!(rx.body, Fcall::Rread { .. }));
}

#[tokio::test]
async fn duplicate_fid_rejected() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Tattach {
            fid: 1,
            afid: NOFID,
            uname: "alice".to_owned(),
            aname: String::new(),
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EDUPFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn remove_consumes_fid_even_on_error() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["ro".to_owned()],
        },
    )
    .await;
    peer.recv().await;

    peer.send(3, Fcall::Tremove { fid: 2 }).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::ENOREMOVE),
        other => panic!("expected Rerror, got {:?}", other),
    }

    // refused or not, the fid is gone
    peer.send(4, Fcall::Tclunk { fid: 2 }).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNFID),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_version_answered_unknown() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));

    peer.send(
        NOTAG,
        Fcall::Tversion {
            msize: 8192,
            version: "9P1999".to_owned(),
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rversion { version, .. } => assert_eq!(version, styx::VERSION_UNKNOWN),
        other => panic!("expected Rversion, got {:?}", other),
    }
}

#[tokio::test]
async fn r_message_from_peer_is_unknown() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(9, Fcall::Rflush).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EUNKNOWNMSG),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn directory_open_refuses_writes() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["a".to_owned()],
        },
    )
    .await;
    peer.recv().await;

    peer.send(3, Fcall::Topen { fid: 2, mode: om::WRITE }).await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EISDIR),
        other => panic!("expected Rerror, got {:?}", other),
    }

    // truncate on a directory sneaks in a write permission
    peer.send(
        4,
        Fcall::Topen {
            fid: 2,
            mode: om::READ | om::TRUNC,
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::EPERM),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

#[tokio::test]
async fn walk_from_open_fid_rejected() {
    let fs = TestFs::new();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(2, Fcall::Topen { fid: 1, mode: om::READ }).await;
    peer.recv().await;

    peer.send(
        3,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: Vec::new(),
        },
    )
    .await;
    match peer.recv().await.body {
        Fcall::Rerror { ename } => assert_eq!(ename, errstr::ECLONEOPEN),
        other => panic!("expected Rerror, got {:?}", other),
    }
}

/// Backend that keeps the session handle from `start` and inspects the fid
/// and request tables from inside a later callback.
#[derive(Clone, Default)]
struct IntrospectFs {
    session: Arc<Mutex<Option<Session<()>>>>,
}

#[async_trait]
impl Filesystem for IntrospectFs {
    type Fid = ();

    async fn start(&self, session: &Session<Self::Fid>) {
        *self.session.lock().unwrap() = Some(session.clone());
    }

    async fn attach(
        &self,
        _fid: &Fid<Self::Fid>,
        _afid: Option<&Fid<Self::Fid>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<Fcall> {
        Ok(Fcall::Rattach {
            qid: Qid {
                typ: QidType::DIR,
                version: 0,
                path: 0,
            },
        })
    }

    async fn walk(
        &self,
        _fid: &Fid<Self::Fid>,
        _newfid: &Fid<Self::Fid>,
        wnames: &[String],
    ) -> Result<Fcall> {
        Ok(Fcall::Rwalk {
            wqids: wnames
                .iter()
                .map(|_| Qid {
                    typ: QidType::FILE,
                    version: 0,
                    path: 1,
                })
                .collect(),
        })
    }

    async fn read(&self, _fid: &Fid<Self::Fid>, _offset: u64, _count: u32) -> Result<Fcall> {
        let session = { self.session.lock().unwrap().clone() }.expect("session handle");

        // this request (tag 5) is outstanding until we return
        assert!(session.request_pending(5).await);
        assert!(!session.request_pending(99).await);
        assert!(session.lookup_fid(99).await.is_none());

        let owner = match session.lookup_fid(1).await {
            Some(root) => root.uid(),
            None => String::new(),
        };
        Ok(Fcall::Rread {
            data: Data(owner.into_bytes()),
        })
    }
}

#[tokio::test]
async fn backend_can_introspect_session() {
    let fs = IntrospectFs::default();
    let mut peer = Peer::new(pipe_to(fs));
    peer.handshake().await;

    peer.send(
        2,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["x".to_owned()],
        },
    )
    .await;
    peer.recv().await;
    peer.send(3, Fcall::Topen { fid: 2, mode: om::READ }).await;
    peer.recv().await;

    peer.send(
        5,
        Fcall::Tread {
            fid: 2,
            offset: 0,
            count: 100,
        },
    )
    .await;
    let rx = peer.recv().await;
    assert_eq!(rx.tag, 5);
    match rx.body {
        // the backend looked up the attach fid and reported its owner
        Fcall::Rread { data } => assert_eq!(data.0, b"alice"),
        other => panic!("expected Rread, got {:?}", other),
    }
}
