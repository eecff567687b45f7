//! Wire types for the out-of-band control protocol.
//!
//! Everything on the wire is big-endian with a fixed field order, so the
//! encoders and decoders here are written out by hand rather than derived.
//! Strings travel as a u16 byte-length prefix followed by UTF-8 with no
//! trailing NUL. The same encoding of [`PoolAttr`] doubles as the on-disk
//! pool header layout.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

/// Encoded size of a [`PoolAttr`].
pub const POOL_ATTR_SIZE: usize = 8 + 4 * 4 + 16 * 4;
/// Encoded size of a [`RespAttr`].
pub const RESP_ATTR_SIZE: usize = 2 + 8 + 8 + 4 + 4;

/// Protocol status word. Zero is success, a small set of named codes covers
/// the storage failure modes, and anything else is a raw errno reported by
/// the close flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Exists,
    NoAccess,
    NoExist,
    Busy,
    BadSize,
    Fatal,
    FatalConn,
    Errno(u32),
}

impl Status {
    pub fn to_u32(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::Exists => 1,
            Status::NoAccess => 2,
            Status::NoExist => 3,
            Status::Busy => 4,
            Status::BadSize => 5,
            Status::Fatal => 6,
            Status::FatalConn => 7,
            Status::Errno(errno) => errno,
        }
    }

    pub fn from_u32(v: u32) -> Status {
        match v {
            0 => Status::Ok,
            1 => Status::Exists,
            2 => Status::NoAccess,
            3 => Status::NoExist,
            4 => Status::Busy,
            5 => Status::BadSize,
            6 => Status::Fatal,
            7 => Status::FatalConn,
            errno => Status::Errno(errno),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "success"),
            Status::Exists => write!(f, "pool already exists"),
            Status::NoAccess => write!(f, "permission denied"),
            Status::NoExist => write!(f, "pool not found"),
            Status::Busy => write!(f, "pool locked by another opener"),
            Status::BadSize => write!(f, "requested size exceeds the usable region"),
            Status::Fatal => write!(f, "fatal error"),
            Status::FatalConn => write!(f, "fatal in-band connection error"),
            Status::Errno(errno) => {
                write!(f, "{}", io::Error::from_raw_os_error(*errno as i32))
            }
        }
    }
}

/// Fabric provider requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Unknown,
    Verbs,
    Sockets,
}

impl Provider {
    pub fn to_u32(self) -> u32 {
        match self {
            Provider::Unknown => 0,
            Provider::Verbs => 1,
            Provider::Sockets => 2,
        }
    }

    pub fn from_u32(v: u32) -> Provider {
        match v {
            1 => Provider::Verbs,
            2 => Provider::Sockets,
            _ => Provider::Unknown,
        }
    }
}

/// How durability of remote writes is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMethod {
    /// The client's own durability marker write suffices, the daemon
    /// performs no flush.
    Apm,
    /// Each persist request triggers an explicit flush on the daemon.
    Gpspm,
}

impl PersistMethod {
    pub fn to_u32(self) -> u32 {
        match self {
            PersistMethod::Apm => 1,
            PersistMethod::Gpspm => 2,
        }
    }

    pub fn from_u32(v: u32) -> Option<PersistMethod> {
        match v {
            1 => Some(PersistMethod::Apm),
            2 => Some(PersistMethod::Gpspm),
            _ => None,
        }
    }
}

/// Immutable pool metadata, stored in the backing file header and echoed
/// over the wire on create and open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolAttr {
    pub signature: [u8; 8],
    pub major: u32,
    pub compat_features: u32,
    pub incompat_features: u32,
    pub ro_compat_features: u32,
    pub poolset_uuid: [u8; 16],
    pub uuid: [u8; 16],
    pub prev_uuid: [u8; 16],
    pub next_uuid: [u8; 16],
}

impl PoolAttr {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.signature)?;
        w.write_u32::<NetworkEndian>(self.major)?;
        w.write_u32::<NetworkEndian>(self.compat_features)?;
        w.write_u32::<NetworkEndian>(self.incompat_features)?;
        w.write_u32::<NetworkEndian>(self.ro_compat_features)?;
        w.write_all(&self.poolset_uuid)?;
        w.write_all(&self.uuid)?;
        w.write_all(&self.prev_uuid)?;
        w.write_all(&self.next_uuid)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<PoolAttr> {
        let mut attr = PoolAttr::default();
        r.read_exact(&mut attr.signature)?;
        attr.major = r.read_u32::<NetworkEndian>()?;
        attr.compat_features = r.read_u32::<NetworkEndian>()?;
        attr.incompat_features = r.read_u32::<NetworkEndian>()?;
        attr.ro_compat_features = r.read_u32::<NetworkEndian>()?;
        r.read_exact(&mut attr.poolset_uuid)?;
        r.read_exact(&mut attr.uuid)?;
        r.read_exact(&mut attr.prev_uuid)?;
        r.read_exact(&mut attr.next_uuid)?;
        Ok(attr)
    }
}

/// Client request attributes common to create and open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqAttr {
    pub pool_desc: String,
    pub pool_size: u64,
    pub nlanes: u32,
    pub provider: Provider,
}

impl ReqAttr {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.pool_desc)?;
        w.write_u64::<NetworkEndian>(self.pool_size)?;
        w.write_u32::<NetworkEndian>(self.nlanes)?;
        w.write_u32::<NetworkEndian>(self.provider.to_u32())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<ReqAttr> {
        let pool_desc = read_string(r)?;
        let pool_size = r.read_u64::<NetworkEndian>()?;
        let nlanes = r.read_u32::<NetworkEndian>()?;
        let provider = Provider::from_u32(r.read_u32::<NetworkEndian>()?);
        Ok(ReqAttr { pool_desc, pool_size, nlanes, provider })
    }
}

/// The rendezvous tuple the daemon answers create and open with. It is all
/// the client needs to dial the data plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespAttr {
    pub port: u16,
    pub rkey: u64,
    pub raddr: u64,
    pub nlanes: u32,
    pub persist_method: PersistMethod,
}

impl Default for RespAttr {
    fn default() -> RespAttr {
        RespAttr { port: 0, rkey: 0, raddr: 0, nlanes: 0, persist_method: PersistMethod::Gpspm }
    }
}

impl RespAttr {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<NetworkEndian>(self.port)?;
        w.write_u64::<NetworkEndian>(self.rkey)?;
        w.write_u64::<NetworkEndian>(self.raddr)?;
        w.write_u32::<NetworkEndian>(self.nlanes)?;
        w.write_u32::<NetworkEndian>(self.persist_method.to_u32())?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<RespAttr> {
        let port = r.read_u16::<NetworkEndian>()?;
        let rkey = r.read_u64::<NetworkEndian>()?;
        let raddr = r.read_u64::<NetworkEndian>()?;
        let nlanes = r.read_u32::<NetworkEndian>()?;
        let method = r.read_u32::<NetworkEndian>()?;
        let persist_method = PersistMethod::from_u32(method).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown persist method {}", method),
            )
        })?;
        Ok(RespAttr { port, rkey, raddr, nlanes, persist_method })
    }
}

pub const KIND_CREATE: u32 = 1;
pub const KIND_OPEN: u32 = 2;
pub const KIND_CLOSE: u32 = 3;

/// A decoded control request, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create { req: ReqAttr, pool_attr: PoolAttr },
    Open { req: ReqAttr },
    Close,
}

/// Client-side request encoders. The kind word goes first so the daemon can
/// dispatch before touching the payload.
pub fn encode_create<W: Write>(w: &mut W, req: &ReqAttr, pool_attr: &PoolAttr) -> io::Result<()> {
    w.write_u32::<NetworkEndian>(KIND_CREATE)?;
    req.write_to(w)?;
    pool_attr.write_to(w)?;
    Ok(())
}

pub fn encode_open<W: Write>(w: &mut W, req: &ReqAttr) -> io::Result<()> {
    w.write_u32::<NetworkEndian>(KIND_OPEN)?;
    req.write_to(w)?;
    Ok(())
}

pub fn encode_close<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_u32::<NetworkEndian>(KIND_CLOSE)?;
    Ok(())
}

/// Decode the payload for a request kind that has already been read.
pub fn decode_request<R: Read>(kind: u32, r: &mut R) -> io::Result<Request> {
    match kind {
        KIND_CREATE => {
            let req = ReqAttr::read_from(r)?;
            let pool_attr = PoolAttr::read_from(r)?;
            Ok(Request::Create { req, pool_attr })
        }
        KIND_OPEN => {
            let req = ReqAttr::read_from(r)?;
            Ok(Request::Open { req })
        }
        KIND_CLOSE => Ok(Request::Close),
        kind => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown request kind {}", kind),
        )),
    }
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes does not fit a u16 length prefix", len),
        ));
    }
    w.write_u16::<NetworkEndian>(len as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u16::<NetworkEndian>()? as usize;
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("malformed string: {}", e)))
}

/// Render a 16-byte uuid in the conventional dashed form.
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in uuid.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn sample_pool_attr() -> PoolAttr {
        PoolAttr {
            signature: *b"PMEMPOOL",
            major: 1,
            compat_features: 0x2,
            incompat_features: 0x4,
            ro_compat_features: 0x8,
            poolset_uuid: [0x11; 16],
            uuid: [0x22; 16],
            prev_uuid: [0x33; 16],
            next_uuid: [0x44; 16],
        }
    }

    #[test]
    fn pool_attr_round_trip() {
        let attr = sample_pool_attr();
        let mut buf = Vec::new();
        attr.write_to(&mut buf).expect("encode to succeed");
        assert_eq!(buf.len(), POOL_ATTR_SIZE);

        let decoded =
            PoolAttr::read_from(&mut Cursor::new(buf)).expect("decode to succeed");
        assert_eq!(attr, decoded);
    }

    #[test]
    fn req_attr_round_trip() {
        let cases = vec![
            ReqAttr {
                pool_desc: String::from("pool0"),
                pool_size: 4 << 20,
                nlanes: 4,
                provider: Provider::Verbs,
            },
            // non-ASCII descriptors must survive the wire
            ReqAttr {
                pool_desc: String::from("pöol-\u{01f9c0}"),
                pool_size: 0,
                nlanes: 1,
                provider: Provider::Sockets,
            },
        ];

        for req in cases {
            let mut buf = Vec::new();
            req.write_to(&mut buf).expect("encode to succeed");
            let decoded =
                ReqAttr::read_from(&mut Cursor::new(buf)).expect("decode to succeed");
            assert_eq!(req, decoded);
        }
    }

    #[test]
    fn resp_attr_round_trip() {
        let resp = RespAttr {
            port: 7636,
            rkey: 0xdead_beef_cafe_f00d,
            raddr: 0x7f00_0000_1000,
            nlanes: 16,
            persist_method: PersistMethod::Apm,
        };
        let mut buf = Vec::new();
        resp.write_to(&mut buf).expect("encode to succeed");
        assert_eq!(buf.len(), RESP_ATTR_SIZE);

        let decoded =
            RespAttr::read_from(&mut Cursor::new(buf)).expect("decode to succeed");
        assert_eq!(resp, decoded);
    }

    #[test]
    fn status_round_trip() {
        let cases = vec![
            Status::Ok,
            Status::Exists,
            Status::NoAccess,
            Status::NoExist,
            Status::Busy,
            Status::BadSize,
            Status::Fatal,
            Status::FatalConn,
            Status::Errno(9999),
        ];
        for status in cases {
            assert_eq!(status, Status::from_u32(status.to_u32()));
        }
    }

    #[test]
    fn request_round_trip() {
        let req = ReqAttr {
            pool_desc: String::from("pool1"),
            pool_size: 1 << 20,
            nlanes: 8,
            provider: Provider::Verbs,
        };

        let mut buf = Vec::new();
        encode_create(&mut buf, &req, &sample_pool_attr()).expect("encode to succeed");
        let mut cur = Cursor::new(buf);
        let kind = cur.read_u32::<NetworkEndian>().expect("kind to parse");
        match decode_request(kind, &mut cur).expect("decode to succeed") {
            Request::Create { req: r, pool_attr } => {
                assert_eq!(r, req);
                assert_eq!(pool_attr, sample_pool_attr());
            }
            other => panic!("decoded the wrong request: {:?}", other),
        }

        let mut buf = Vec::new();
        encode_close(&mut buf).expect("encode to succeed");
        let mut cur = Cursor::new(buf);
        let kind = cur.read_u32::<NetworkEndian>().expect("kind to parse");
        assert_eq!(decode_request(kind, &mut cur).expect("decode to succeed"), Request::Close);
    }

    #[test]
    fn unknown_request_kind_is_an_error() {
        let err = decode_request(77, &mut Cursor::new(Vec::new()))
            .expect_err("decode to fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn uuid_formatting() {
        let uuid: [u8; 16] = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x12, 0x34, 0x56, 0x78, 0x9a,
            0xbc, 0xde, 0xf0,
        ];
        assert_eq!(uuid_to_string(&uuid), "12345678-9abc-def0-1234-56789abcdef0");
    }
}
