//! Serialize/deserialize 9P messages into/from binary.
//!
//! A frame on the wire is `size[4] type[1] tag[2] body`, where `size` counts
//! itself. The `*_body` functions work on a frame whose size field has already
//! been stripped by the transport; the `*_frame` functions include it.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Cursor, Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_retain(decode!($buf))
    };
}

/// Size of `type[1] tag[2]`
pub const HEADER_SIZE: usize = 3;

/// Size of the leading `size[4]` field of a frame
pub const SIZE_FIELD: usize = 4;

// Never allocates more than the reader can actually deliver.
fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    Read::take(r, size as u64).read_to_end(&mut buf)?;
    if buf.len() != size {
        return res!(io_err!(
            UnexpectedEof,
            "field length exceeds the remaining buffer"
        ));
    }
    Ok(buf)
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
        let len = u16::try_from(self.len())
            .map_err(|_| io_err!(InvalidInput, "string longer than 65535 bytes"))?;
        let mut bytes = len.encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = u16::try_from(self.size())
            .map_err(|_| io_err!(InvalidInput, "stat larger than 65535 bytes"))?;
        match Encoder::new(w)
            << &size
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
        let count = u32::try_from(size)
            .map_err(|_| io_err!(InvalidInput, "data larger than 4 GiB"))?;
        let bytes = count.encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len())
            .map_err(|_| io_err!(InvalidInput, "array longer than 65535 elements"))?;
        match self
            .iter()
            .fold(Encoder::new(w) << &len, |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

// `stat[n]` envelope of RStat and TWStat: an outer count, then the stat itself.
fn stat_envelope_len(stat: &Stat) -> Result<u16> {
    u16::try_from(stat.size() + mem::size_of::<u16>())
        .map_err(|_| io_err!(InvalidInput, "stat larger than 65535 bytes"))
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << &stat_envelope_len(stat)? << stat,
            TWStat { ref fid, ref stat } => buf << fid << &stat_envelope_len(stat)? << stat,
            RWStat => buf,
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
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let size: u16 = Decodable::decode(r)?;
        let stat = Stat {
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
        };
        if size as usize != stat.size() {
            return res!(io_err!(InvalidData, "stat size does not match its contents"));
        }
        Ok(stat)
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

fn decode_stat_envelope<R: ReadBytesExt>(r: &mut R) -> Result<Stat> {
    let n: u16 = Decodable::decode(r)?;
    let stat: Stat = Decodable::decode(r)?;
    if n as usize != stat.size() + mem::size_of::<u16>() {
        return res!(io_err!(InvalidData, "stat envelope does not match stat size"));
    }
    Ok(stat)
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => FCall::RStat {
                stat: decode_stat_envelope(buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode_stat_envelope(buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            Some(TError) | None => return res!(io_err!(InvalidData, "Invalid message type")),
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

/// Read `(type, tag)` from a frame without its size field.
///
/// The body is not looked at, so this succeeds for opcodes this crate does not know.
pub fn peek_header(buf: &[u8]) -> Result<(u8, u16)> {
    if buf.len() < HEADER_SIZE {
        return res!(io_err!(UnexpectedEof, "frame shorter than a 9P header"));
    }
    Ok((buf[0], u16::from_le_bytes([buf[1], buf[2]])))
}

/// Encode a message without the leading size field.
pub fn encode_body(msg: &Msg) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_msg(&mut buf, msg)?;
    Ok(buf)
}

/// Decode a frame without its leading size field, requiring every byte to be consumed.
pub fn decode_body(buf: &[u8]) -> Result<Msg> {
    let mut cursor = Cursor::new(buf);
    let msg = read_msg(&mut cursor)?;
    if cursor.position() as usize != buf.len() {
        return res!(io_err!(InvalidData, "trailing bytes after 9P message"));
    }
    Ok(msg)
}

/// Encode a complete frame, size field included.
pub fn encode_frame(msg: &Msg) -> Result<Vec<u8>> {
    let mut buf = vec![0; SIZE_FIELD];
    write_msg(&mut buf, msg)?;
    let size = u32::try_from(buf.len())
        .map_err(|_| io_err!(InvalidInput, "message larger than 4 GiB"))?;
    buf[..SIZE_FIELD].copy_from_slice(&size.to_le_bytes());
    Ok(buf)
}

/// Decode a complete frame; the declared size must equal the frame length.
pub fn decode_frame(buf: &[u8]) -> Result<Msg> {
    let mut cursor = Cursor::new(buf);
    let size: u32 = Decodable::decode(&mut cursor)?;
    if size as usize != buf.len() {
        return res!(io_err!(InvalidData, "declared size does not match frame length"));
    }
    decode_body(&buf[SIZE_FIELD..])
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

#[test]
fn msg_encode_decode1() {
    let expected = Msg {
        tag: 0xdead,
        body: FCall::RVersion {
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
fn tversion_vector() {
    let msg = Msg {
        tag: 0xaa55,
        body: FCall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    assert_eq!(
        encode_frame(&msg).unwrap(),
        vec![19, 0, 0, 0, 100, 0x55, 0xaa, 0, 32, 0, 0, 6, 0, 57, 80, 50, 48, 48, 48]
    );
}

#[test]
fn rversion_vector() {
    let msg = Msg {
        tag: 0x55aa,
        body: FCall::RVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    assert_eq!(
        encode_frame(&msg).unwrap(),
        vec![19, 0, 0, 0, 101, 0xaa, 0x55, 0, 32, 0, 0, 6, 0, 57, 80, 50, 48, 48, 48]
    );
}

#[test]
fn captured_traces_reencode_identically() {
    // Frames captured between a Plan 9 client and server.
    let traces: Vec<(&str, Vec<u8>)> = vec![
        ("Tflush", vec![9, 0, 0, 0, 108, 1, 0, 2, 0]),
        (
            "Tauth",
            vec![
                23, 0, 0, 0, 102, 1, 0, 45, 0, 0, 0, 8, 0, 114, 109, 105, 110, 110, 105, 99, 104,
                0, 0,
            ],
        ),
        (
            "Tattach",
            vec![
                27, 0, 0, 0, 104, 1, 0, 48, 0, 0, 0, 255, 255, 255, 255, 8, 0, 114, 109, 105, 110,
                110, 105, 99, 104, 0, 0,
            ],
        ),
        (
            "Rattach",
            vec![
                20, 0, 0, 0, 105, 1, 0, 128, 99, 207, 44, 145, 115, 221, 96, 0, 0, 0, 0, 0,
            ],
        ),
        (
            "Rerror",
            [
                vec![39, 0, 0, 0, 107, 1, 0, 30, 0],
                b"no authentication required: 22".to_vec(),
            ]
            .concat(),
        ),
        (
            "Twalk",
            vec![
                23, 0, 0, 0, 110, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 4, 0, 110, 117, 108, 108,
            ],
        ),
        ("Topen", vec![12, 0, 0, 0, 112, 0, 0, 1, 0, 0, 0, 2]),
        (
            "Tcreate",
            vec![
                19, 0, 0, 0, 114, 3, 0, 74, 0, 0, 0, 1, 0, 121, 182, 1, 0, 0, 0,
            ],
        ),
        (
            "Rcreate",
            vec![
                24, 0, 0, 0, 115, 3, 0, 0, 226, 200, 71, 172, 45, 166, 98, 0, 0, 0, 0, 0, 0, 0, 0,
                0,
            ],
        ),
        (
            "Tread",
            vec![
                23, 0, 0, 0, 116, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32, 0, 0,
            ],
        ),
        (
            "Twrite",
            vec![
                26, 0, 0, 0, 118, 3, 0, 139, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 104, 105,
                10,
            ],
        ),
        ("Rwrite", vec![11, 0, 0, 0, 119, 3, 0, 3, 0, 0, 0]),
        ("Tclunk", vec![11, 0, 0, 0, 120, 1, 0, 49, 0, 0, 0]),
        ("Rclunk", vec![7, 0, 0, 0, 121, 1, 0]),
        ("Tremove", vec![11, 0, 0, 0, 122, 1, 0, 49, 0, 0, 0]),
        ("Tstat", vec![11, 0, 0, 0, 124, 1, 0, 49, 0, 0, 0]),
        (
            "Rstat",
            vec![
                84, 0, 0, 0, 125, 1, 0, 75, 0, 73, 0, 0, 0, 0, 0, 0, 0, 128, 99, 207, 44, 145, 115,
                221, 96, 0, 0, 0, 0, 0, 253, 1, 0, 128, 109, 185, 47, 86, 196, 66, 41, 86, 0, 16,
                0, 0, 0, 0, 0, 0, 6, 0, 104, 97, 114, 118, 101, 121, 8, 0, 114, 109, 105, 110,
                110, 105, 99, 104, 8, 0, 114, 109, 105, 110, 110, 105, 99, 104, 4, 0, 110, 111,
                110, 101,
            ],
        ),
        (
            "Twstat",
            vec![
                62, 0, 0, 0, 126, 3, 0, 49, 0, 0, 0, 49, 0, 47, 0, 255, 255, 255, 255, 255, 255,
                255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
                255, 255, 255, 255, 255, 199, 185, 47, 86, 255, 255, 255, 255, 255, 255, 255, 255,
                0, 0, 0, 0, 0, 0, 0, 0,
            ],
        ),
    ];

    for (name, frame) in traces {
        let msg = decode_frame(&frame).unwrap_or_else(|e| panic!("{}: {}", name, e));
        assert_eq!(MsgType::from(&msg.body).to_string(), name);
        assert_eq!(encode_frame(&msg).unwrap(), frame, "{}", name);
    }
}

#[test]
fn twstat_trace_decodes_dont_touch_values() {
    let frame = vec![
        62, 0, 0, 0, 126, 3, 0, 49, 0, 0, 0, 49, 0, 47, 0, 255, 255, 255, 255, 255, 255, 255, 255,
        255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255,
        255, 199, 185, 47, 86, 255, 255, 255, 255, 255, 255, 255, 255, 0, 0, 0, 0, 0, 0, 0, 0,
    ];
    let expected = Stat {
        mtime: 1445968327,
        ..Stat::unchanged()
    };
    match decode_frame(&frame).unwrap().body {
        FCall::TWStat { fid, stat } => {
            assert_eq!(fid, 49);
            assert_eq!(stat, expected);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn declared_size_must_match() {
    let mut frame = vec![19, 0, 0, 0, 100, 0x55, 0xaa, 0, 32, 0, 0, 6, 0, 57, 80, 50, 48, 48, 48];
    frame[0] = 20;
    assert!(decode_frame(&frame).is_err());
    frame[0] = 19;
    frame.push(0);
    assert!(decode_frame(&frame).is_err());
}

#[test]
fn string_overrunning_buffer_is_rejected() {
    // Tversion claiming a 200-byte version string but carrying 6 bytes.
    let body = vec![100, 0, 0, 0, 32, 0, 0, 200, 0, 57, 80, 50, 48, 48, 48];
    let err = decode_body(&body).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn huge_data_count_does_not_allocate() {
    // Rread declaring 4 GiB of data with none present.
    let body = vec![117, 1, 0, 255, 255, 255, 255];
    assert!(decode_body(&body).is_err());
}

#[test]
fn unknown_and_illegal_types_are_rejected() {
    assert!(decode_body(&[200, 1, 0]).is_err());
    assert!(decode_body(&[106, 1, 0]).is_err());
    assert_eq!(peek_header(&[200, 0x34, 0x12]).unwrap(), (200, 0x1234));
    assert!(peek_header(&[100, 0]).is_err());
}

#[test]
fn stat_with_wrong_envelope_is_rejected() {
    let mut frame = encode_frame(&Msg {
        tag: 1,
        body: FCall::RStat {
            stat: Stat::default(),
        },
    })
    .unwrap();
    frame[7] += 1;
    assert!(decode_frame(&frame).is_err());
}

#[test]
fn every_message_survives_a_frame_round_trip() {
    let qid = QId {
        typ: QIdType::DIR | QIdType::APPEND,
        version: 7,
        path: 0x0102_0304_0506_0708,
    };
    let stat = Stat {
        typ: 1,
        dev: 2,
        qid,
        mode: dm::DIR | 0o755,
        atime: 1445968327,
        mtime: 1445968328,
        length: 0,
        name: "usr".to_owned(),
        uid: "glenda".to_owned(),
        gid: "sys".to_owned(),
        muid: "bootes".to_owned(),
    };

    let bodies = vec![
        FCall::TVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
        FCall::RVersion {
            msize: 4096,
            version: VERSION_UNKNOWN.to_owned(),
        },
        FCall::TAuth {
            afid: 3,
            uname: "glenda".to_owned(),
            aname: String::new(),
        },
        FCall::RAuth { aqid: qid },
        FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".to_owned(),
            aname: "main".to_owned(),
        },
        FCall::RAttach { qid },
        FCall::RError {
            ename: "file does not exist".to_owned(),
        },
        FCall::TFlush { oldtag: 0x1234 },
        FCall::RFlush,
        FCall::TWalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".to_owned(), "glenda".to_owned()],
        },
        FCall::TWalk {
            fid: 1,
            newfid: 1,
            wnames: Vec::new(),
        },
        FCall::RWalk {
            wqids: vec![qid, QId::default()],
        },
        FCall::RWalk { wqids: Vec::new() },
        FCall::TOpen {
            fid: 1,
            mode: om::RDWR | om::TRUNC,
        },
        FCall::ROpen { qid, iounit: 8168 },
        FCall::TCreate {
            fid: 1,
            name: "new".to_owned(),
            perm: 0o644,
            mode: om::WRITE,
        },
        FCall::RCreate { qid, iounit: 0 },
        FCall::TRead {
            fid: 1,
            offset: u64::MAX - 1,
            count: 8168,
        },
        FCall::RRead {
            data: Data(b"hello".to_vec()),
        },
        FCall::RRead { data: Data(Vec::new()) },
        FCall::TWrite {
            fid: 1,
            offset: 11,
            data: Data(vec![0xff; 300]),
        },
        FCall::RWrite { count: 300 },
        FCall::TClunk { fid: 1 },
        FCall::RClunk,
        FCall::TRemove { fid: 2 },
        FCall::RRemove,
        FCall::TStat { fid: 0 },
        FCall::RStat { stat: stat.clone() },
        FCall::TWStat {
            fid: 0,
            stat: Stat::unchanged(),
        },
        FCall::TWStat { fid: 0, stat },
        FCall::RWStat,
    ];

    let mut seen = std::collections::HashSet::new();
    for (i, body) in bodies.into_iter().enumerate() {
        seen.insert(MsgType::from(&body) as u8);
        let msg = Msg {
            tag: i as u16,
            body,
        };
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), msg);
    }
    // every type except Terror, which has no wire form
    assert_eq!(seen.len(), 27);
    assert!(!seen.contains(&(MsgType::TError as u8)));
}
