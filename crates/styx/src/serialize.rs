//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};
use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Length-delimited framing for 9P messages
///
/// Every message on the wire starts with a little-endian u32 length that
/// counts itself, so the adjustment of -4 makes a decoded frame start at the
/// type byte, which is where `Msg::decode` picks up.
pub fn frame_builder() -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian();
    builder
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Fcall::*;

        if let Twalk { ref wnames, .. } = self.body {
            if wnames.len() > MAXWELEM {
                return res!(io_err!(InvalidInput, "too many walk elements"));
            }
        }
        if let Rwalk { ref wqids } = self.body {
            if wqids.len() > MAXWELEM {
                return res!(io_err!(InvalidInput, "too many walk qids"));
            }
        }

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            Tversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Rversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            Rwalk { ref wqids } => buf << wqids,
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            Rcreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            Rstat { ref stat } => buf << &(stat.size() + 2) << stat,
            Twstat { ref fid, ref stat } => buf << fid << &(stat.size() + 2) << stat,
            Rwstat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        // The leading size field is redundant with the field layout; bounds
        // are enforced by the individual field reads.
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(Tversion) => Fcall::Tversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Rversion) => Fcall::Rversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Tauth) => Fcall::Tauth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rauth) => Fcall::Rauth { aqid: decode!(buf) },
            Some(Tattach) => Fcall::Tattach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rattach) => Fcall::Rattach { qid: decode!(buf) },
            Some(Rerror) => Fcall::Rerror {
                ename: decode!(buf),
            },
            Some(Tflush) => Fcall::Tflush {
                oldtag: decode!(buf),
            },
            Some(Rflush) => Fcall::Rflush,
            Some(Twalk) => {
                let fid = decode!(buf);
                let newfid = decode!(buf);
                let wnames: Vec<String> = decode!(buf);
                if wnames.len() > MAXWELEM {
                    return res!(io_err!(InvalidData, "too many walk elements"));
                }
                Fcall::Twalk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            Some(Rwalk) => {
                let wqids: Vec<Qid> = decode!(buf);
                if wqids.len() > MAXWELEM {
                    return res!(io_err!(InvalidData, "too many walk qids"));
                }
                Fcall::Rwalk { wqids }
            }
            Some(Topen) => Fcall::Topen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(Ropen) => Fcall::Ropen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tcreate) => Fcall::Tcreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(Rcreate) => Fcall::Rcreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tread) => Fcall::Tread {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(Rread) => Fcall::Rread { data: decode!(buf) },
            Some(Twrite) => Fcall::Twrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(Rwrite) => Fcall::Rwrite {
                count: decode!(buf),
            },
            Some(Tclunk) => Fcall::Tclunk { fid: decode!(buf) },
            Some(Rclunk) => Fcall::Rclunk,
            Some(Tremove) => Fcall::Tremove { fid: decode!(buf) },
            Some(Rremove) => Fcall::Rremove,
            Some(Tstat) => Fcall::Tstat { fid: decode!(buf) },
            Some(Rstat) => {
                let _len: u16 = decode!(buf);
                Fcall::Rstat { stat: decode!(buf) }
            }
            Some(Twstat) => {
                let fid = decode!(buf);
                let _len: u16 = decode!(buf);
                Fcall::Twstat {
                    fid,
                    stat: decode!(buf),
                }
            }
            Some(Rwstat) => Fcall::Rwstat,
            None => return res!(io_err!(Other, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
fn frame(msg: &Msg) -> Vec<u8> {
    let mut body = Vec::new();
    let _ = msg.encode(&mut body);
    let mut buf = Vec::new();
    let _ = ((body.len() + 4) as u32).encode(&mut buf);
    buf.extend_from_slice(&body);
    buf
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    use std::io::Cursor;

    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    loop {
        match Decodable::decode(&mut decoder) {
            Ok(i) => actual.push(i),
            Err(_) => break,
        }
    }
    assert_eq!(expected, actual);
}

#[cfg(test)]
fn sample_stat() -> Stat {
    Stat {
        typ: 3,
        dev: 9,
        qid: Qid {
            typ: QidType::FILE,
            version: 1,
            path: 42,
        },
        mode: 0o644,
        atime: 1_700_000_000,
        mtime: 1_700_000_001,
        length: 128,
        name: "readme".to_owned(),
        uid: "alice".to_owned(),
        gid: "staff".to_owned(),
        muid: "bob".to_owned(),
    }
}

#[test]
fn msg_encode_decode1() {
    use std::io::Cursor;

    let expected = Msg {
        tag: 0xdead,
        body: Fcall::Rversion {
            msize: 40,
            version: P92000.to_owned(),
        },
    };
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf);

    let mut readbuf = Cursor::new(buf);
    let actual = Decodable::decode(&mut readbuf);

    assert_eq!(expected, actual.unwrap());
}

#[test]
fn msg_roundtrip_all_variants() {
    use std::io::Cursor;

    let qid = Qid {
        typ: QidType::DIR,
        version: 2,
        path: 7,
    };
    let msgs = vec![
        Fcall::Tversion {
            msize: 8192,
            version: P92000.to_owned(),
        },
        Fcall::Rversion {
            msize: 8192,
            version: P92000.to_owned(),
        },
        Fcall::Tauth {
            afid: 4,
            uname: "alice".to_owned(),
            aname: "".to_owned(),
        },
        Fcall::Rauth { aqid: qid },
        Fcall::Tattach {
            fid: 1,
            afid: NOFID,
            uname: "alice".to_owned(),
            aname: "/".to_owned(),
        },
        Fcall::Rattach { qid },
        Fcall::Rerror {
            ename: "file not found".to_owned(),
        },
        Fcall::Tflush { oldtag: 9 },
        Fcall::Rflush,
        Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["a".to_owned(), "b".to_owned()],
        },
        Fcall::Rwalk {
            wqids: vec![qid, qid],
        },
        Fcall::Topen { fid: 2, mode: 0 },
        Fcall::Ropen { qid, iounit: 0 },
        Fcall::Tcreate {
            fid: 2,
            name: "f".to_owned(),
            perm: 0o644,
            mode: 1,
        },
        Fcall::Rcreate { qid, iounit: 0 },
        Fcall::Tread {
            fid: 2,
            offset: 0,
            count: 100,
        },
        Fcall::Rread {
            data: Data(b"hi".to_vec()),
        },
        Fcall::Twrite {
            fid: 2,
            offset: 4,
            data: Data(b"data".to_vec()),
        },
        Fcall::Rwrite { count: 4 },
        Fcall::Tclunk { fid: 2 },
        Fcall::Rclunk,
        Fcall::Tremove { fid: 2 },
        Fcall::Rremove,
        Fcall::Tstat { fid: 2 },
        Fcall::Rstat {
            stat: sample_stat(),
        },
        Fcall::Twstat {
            fid: 2,
            stat: sample_stat(),
        },
        Fcall::Rwstat,
    ];

    for (i, body) in msgs.into_iter().enumerate() {
        let expected = Msg {
            tag: i as u16,
            body,
        };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();
        let actual: Msg = Decodable::decode(&mut Cursor::new(buf)).unwrap();
        assert_eq!(expected, actual);
    }
}

#[test]
fn tversion_bit_exact() {
    let msg = Msg {
        tag: NOTAG,
        body: Fcall::Tversion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    let expected: &[u8] = &[
        0x13, 0x00, 0x00, 0x00, // size 19
        0x64, // Tversion
        0xff, 0xff, // NOTAG
        0x00, 0x20, 0x00, 0x00, // msize 8192
        0x06, 0x00, // strlen 6
        b'9', b'P', b'2', b'0', b'0', b'0',
    ];
    assert_eq!(frame(&msg), expected);
}

#[test]
fn decode_rejects_truncation() {
    use std::io::Cursor;

    let msgs = vec![
        Msg {
            tag: 1,
            body: Fcall::Twalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["usr".to_owned(), "bin".to_owned()],
            },
        },
        Msg {
            tag: 2,
            body: Fcall::Rread {
                data: Data(b"payload".to_vec()),
            },
        },
        Msg {
            tag: 3,
            body: Fcall::Rstat {
                stat: sample_stat(),
            },
        },
        Msg {
            tag: 4,
            body: Fcall::Tattach {
                fid: 1,
                afid: NOFID,
                uname: "alice".to_owned(),
                aname: "".to_owned(),
            },
        },
    ];

    for msg in msgs {
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        for cut in 0..buf.len() {
            let short = &buf[..cut];
            let r: Result<Msg> = Decodable::decode(&mut Cursor::new(short.to_vec()));
            assert!(r.is_err(), "decoded from {} of {} bytes", cut, buf.len());
        }
    }
}

#[test]
fn decode_rejects_unknown_type() {
    use std::io::Cursor;

    // Terror (106) is illegal, as is anything outside 100..=127
    for typ in [0u8, 99, 106, 128, 255] {
        let buf = vec![typ, 0x01, 0x00];
        let r: Result<Msg> = Decodable::decode(&mut Cursor::new(buf));
        assert!(r.is_err());
    }
}

#[test]
fn walk_element_limit() {
    use std::io::Cursor;

    let names: Vec<String> = (0..MAXWELEM + 1).map(|i| format!("d{}", i)).collect();
    let msg = Msg {
        tag: 1,
        body: Fcall::Twalk {
            fid: 1,
            newfid: 2,
            wnames: names,
        },
    };
    let mut buf = Vec::new();
    assert!(msg.encode(&mut buf).is_err());

    // Hand-craft a Twalk frame declaring 17 elements
    let mut raw = Vec::new();
    (MsgType::Twalk as u8).encode(&mut raw).unwrap();
    1u16.encode(&mut raw).unwrap();
    1u32.encode(&mut raw).unwrap();
    2u32.encode(&mut raw).unwrap();
    ((MAXWELEM + 1) as u16).encode(&mut raw).unwrap();
    for _ in 0..MAXWELEM + 1 {
        "x".to_owned().encode(&mut raw).unwrap();
    }
    let r: Result<Msg> = Decodable::decode(&mut Cursor::new(raw));
    assert!(r.is_err());
}

#[test]
fn stat_record_size_field() {
    let stat = sample_stat();
    let mut buf = Vec::new();
    stat.encode(&mut buf).unwrap();

    assert_eq!(buf.len(), stat.size() as usize + 2);
    let lead = u16::from_le_bytes([buf[0], buf[1]]);
    assert_eq!(lead, stat.size());
}
