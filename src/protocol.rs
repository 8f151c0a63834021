//! Wire protocol.
//!
//! Every message is one frame: a fixed 16-byte header followed by the
//! payload, all integers little-endian, all structs packed.
//!
//! ```text
//! |                 8 byte                |
//! |-------------------|---------|---------|
//! |    magic (4b)     | cmd (2b)| 0x0 0x0 |
//! |-------------------|---------|---------|
//! |  send_time (4b)   |   length (4b)     |
//! |-------------------|-------------------|
//! |              payload (...)            |
//! ```
//!
//! Payload structs are [`PeerInfo`] (86 bytes) and [`Response`] (72 bytes);
//! replies that carry peers are a `Response` followed by `number` packed
//! `PeerInfo` records.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::clock;
use crate::error::{Error, Result};

/// Frame magic, `0x55 0x64 0x73 0x82` on the wire.
pub const FRAME_MAGIC: u32 = 0x5564_7382;
pub const HEADER_SIZE: usize = 16;

pub const UUID_SIZE: usize = 48;
pub const PEER_NAME_SIZE: usize = 32;
pub const MSG_SIZE: usize = 64;

/// Packed size of [`PeerInfo`].
pub const PEER_INFO_SIZE: usize = 4 + 2 + UUID_SIZE + PEER_NAME_SIZE;
/// Packed size of [`Response`].
pub const RESPONSE_SIZE: usize = 2 + 2 + MSG_SIZE + 4;

/// Command codes.
pub mod command {
    pub const SEND_PEER_INFO: u16 = 0x0101;
    pub const GET_PEER_INFO: u16 = 0x0102;
    pub const CONNECT_TO_PEER: u16 = 0x0103;
    pub const HEARTBEAT_DETECT: u16 = 0x0104;

    pub const R_SEND_PEER_INFO: u16 = 0x1001;
    pub const R_GET_PEER_INFO: u16 = 0x1002;
    pub const R_CONNECT_TO_PEER: u16 = 0x1003;
    pub const CONNECT_TO_ME: u16 = 0x1004;
    pub const R_HEARTBEAT_DETECT: u16 = 0x1005;
}

////////////////////////////////////////////////////////////////////////////////
// Status
////////////////////////////////////////////////////////////////////////////////

/// One table drives the [`Status`] enum, its reason strings and the
/// code→variant lookup, so the three can never drift apart.
macro_rules! status_table {
    ($($code:literal $name:ident $reason:literal,)+) => {
        /// Status codes carried in [`Response::status`], with their reason
        /// strings for the `msg` field.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum Status {
            $($name = $code,)+
        }

        impl Status {
            /// The reason string for the `msg` field.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Status::$name => $reason,)+
                }
            }

            /// Look a wire code back up; `None` for codes outside the
            /// table.
            pub fn from_u16(code: u16) -> Option<Status> {
                match code {
                    $($code => Some(Status::$name),)+
                    _ => None,
                }
            }
        }
    };
}

status_table! {
    100 Continue "Continue",
    101 SwitchingProtocols "Switching Protocols",
    102 Processing "Processing",
    200 Ok "OK",
    201 Created "Created",
    202 Accepted "Accepted",
    203 NonAuthoritativeInformation "Non-Authoritative Information",
    204 NoContent "No Content",
    205 ResetContent "Reset Content",
    206 PartialContent "Partial Content",
    207 MultiStatus "Multi-Status",
    208 AlreadyReported "Already Reported",
    226 ImUsed "IM Used",
    300 RedisServerError "Redis Server Error",
    301 MovedPermanently "Moved Permanently",
    302 Found "Found",
    303 SeeOther "See Other",
    304 NotModified "Not Modified",
    305 UseProxy "Use Proxy",
    307 TemporaryRedirect "Temporary Redirect",
    308 PermanentRedirect "Permanent Redirect",
    400 BadRequest "Bad Request",
    401 Unauthorized "Unauthorized",
    402 PaymentRequired "Payment Required",
    403 Forbidden "Forbidden",
    404 NotFound "Not Found",
    405 MethodNotAllowed "Method Not Allowed",
    406 NotAcceptable "Not Acceptable",
    407 ProxyAuthenticationRequired "Proxy Authentication Required",
    408 RequestTimeout "Request Timeout",
    409 Conflict "Conflict",
    410 Gone "Gone",
    411 LengthRequired "Length Required",
    412 PreconditionFailed "Precondition Failed",
    413 PayloadTooLarge "Payload Too Large",
    414 UriTooLong "URI Too Long",
    415 UnsupportedMediaType "Unsupported Media Type",
    416 RangeNotSatisfiable "Range Not Satisfiable",
    417 ExpectationFailed "Expectation Failed",
    421 MisdirectedRequest "Misdirected Request",
    422 UnprocessableEntity "Unprocessable Entity",
    423 Locked "Locked",
    424 FailedDependency "Failed Dependency",
    426 UpgradeRequired "Upgrade Required",
    428 PreconditionRequired "Precondition Required",
    429 TooManyRequests "Too Many Requests",
    431 RequestHeaderFieldsTooLarge "Request Header Fields Too Large",
    451 UnavailableForLegalReasons "Unavailable For Legal Reasons",
    500 InternalServerError "Internal Server Error",
    501 NotImplemented "Not Implemented",
    502 BadGateway "Bad Gateway",
    503 ServiceUnavailable "Service Unavailable",
    504 GatewayTimeout "Gateway Timeout",
    505 HttpVersionNotSupported "HTTP Version Not Supported",
    506 VariantAlsoNegotiates "Variant Also Negotiates",
    507 InsufficientStorage "Insufficient Storage",
    508 LoopDetected "Loop Detected",
    510 NotExtended "Not Extended",
    511 NetworkAuthenticationRequired "Network Authentication Required",
}

////////////////////////////////////////////////////////////////////////////////
// Frame
////////////////////////////////////////////////////////////////////////////////

/// A parsed frame borrowing its payload from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub cmd: u16,
    pub send_time: u32,
    pub payload: &'a [u8],
}

/// Build a frame around `payload`, stamping the current wall clock.
pub fn encode(cmd: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.write_u32::<LittleEndian>(FRAME_MAGIC).unwrap();
    buf.write_u16::<LittleEndian>(cmd).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(clock::realtime_secs() as u32)
        .unwrap();
    buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Split the 16-byte header off `buf`. Fails on short input, magic
/// mismatch, or a length field pointing past the buffer.
pub fn parse(buf: &[u8]) -> Result<Frame<'_>> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::FrameMalformed("short header"));
    }
    let mut rd = &buf[..HEADER_SIZE];
    let magic = rd.read_u32::<LittleEndian>().unwrap();
    if magic != FRAME_MAGIC {
        return Err(Error::FrameMalformed("bad magic"));
    }
    let cmd = rd.read_u16::<LittleEndian>().unwrap();
    let _reserved = rd.read_u16::<LittleEndian>().unwrap();
    let send_time = rd.read_u32::<LittleEndian>().unwrap();
    let length = rd.read_u32::<LittleEndian>().unwrap() as usize;
    if buf.len() - HEADER_SIZE < length {
        return Err(Error::FrameMalformed("truncated payload"));
    }
    Ok(Frame {
        cmd,
        send_time,
        payload: &buf[HEADER_SIZE..HEADER_SIZE + length],
    })
}

/// Parse just the header, returning `(cmd, send_time, payload length)`.
/// Used by stream readers that fetch the payload separately.
pub fn parse_header(buf: &[u8]) -> Result<(u16, u32, usize)> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::FrameMalformed("short header"));
    }
    let mut rd = &buf[..];
    let magic = rd.read_u32::<LittleEndian>().unwrap();
    if magic != FRAME_MAGIC {
        return Err(Error::FrameMalformed("bad magic"));
    }
    let cmd = rd.read_u16::<LittleEndian>().unwrap();
    let _reserved = rd.read_u16::<LittleEndian>().unwrap();
    let send_time = rd.read_u32::<LittleEndian>().unwrap();
    let length = rd.read_u32::<LittleEndian>().unwrap() as usize;
    Ok((cmd, send_time, length))
}

fn write_padded(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    // leave room for at least one NUL, like the C structs this mirrors
    let take = bytes.len().min(width - 1);
    buf.extend_from_slice(&bytes[..take]);
    buf.resize(buf.len() + width - take, 0);
}

fn read_padded(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

////////////////////////////////////////////////////////////////////////////////
// PeerInfo
////////////////////////////////////////////////////////////////////////////////

/// One peer entry as it travels on the wire.
///
/// `host_binary` and `port_binary` hold the peer's address in network byte
/// order (they are copied verbatim into `sockaddr_in` by clients); `uuid`
/// and `peer_name` are NUL-padded strings.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub host_binary: u32,
    pub port_binary: u16,
    pub uuid: String,
    pub peer_name: String,
}

impl PeerInfo {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<LittleEndian>(self.host_binary).unwrap();
        buf.write_u16::<LittleEndian>(self.port_binary).unwrap();
        write_padded(buf, &self.uuid, UUID_SIZE);
        write_padded(buf, &self.peer_name, PEER_NAME_SIZE);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PEER_INFO_SIZE);
        self.encode_to(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<PeerInfo> {
        if buf.len() < PEER_INFO_SIZE {
            return Err(Error::FrameMalformed("short PeerInfo"));
        }
        let mut rd = &buf[..6];
        let host_binary = rd.read_u32::<LittleEndian>().unwrap();
        let port_binary = rd.read_u16::<LittleEndian>().unwrap();
        let uuid = read_padded(&buf[6..6 + UUID_SIZE]);
        let peer_name = read_padded(&buf[6 + UUID_SIZE..6 + UUID_SIZE + PEER_NAME_SIZE]);
        Ok(PeerInfo {
            host_binary,
            port_binary,
            uuid,
            peer_name,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Response
////////////////////////////////////////////////////////////////////////////////

/// Server response header: the echoed reply command in `flag`, a status
/// code with its reason string, and the number of `PeerInfo` records that
/// follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub flag: u16,
    pub status: u16,
    pub msg: String,
    pub number: u32,
}

impl Response {
    /// An `OK` response for the given reply command.
    pub fn ok(flag: u16) -> Response {
        Response::with_status(flag, Status::Ok)
    }

    pub fn with_status(flag: u16, status: Status) -> Response {
        Response {
            flag,
            status: status as u16,
            msg: status.as_str().to_owned(),
            number: 0,
        }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.write_u16::<LittleEndian>(self.flag).unwrap();
        buf.write_u16::<LittleEndian>(self.status).unwrap();
        write_padded(buf, &self.msg, MSG_SIZE);
        buf.write_u32::<LittleEndian>(self.number).unwrap();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_SIZE);
        self.encode_to(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Response> {
        if buf.len() < RESPONSE_SIZE {
            return Err(Error::FrameMalformed("short Response"));
        }
        let mut rd = &buf[..4];
        let flag = rd.read_u16::<LittleEndian>().unwrap();
        let status = rd.read_u16::<LittleEndian>().unwrap();
        let msg = read_padded(&buf[4..4 + MSG_SIZE]);
        let number = (&buf[4 + MSG_SIZE..RESPONSE_SIZE])
            .read_u32::<LittleEndian>()
            .unwrap();
        Ok(Response {
            flag,
            status,
            msg,
            number,
        })
    }
}

/// Encode a reply frame: `Response` plus its trailing `PeerInfo` records.
/// Sets `number` from the slice length.
pub fn encode_reply(flag: u16, mut response: Response, peers: &[PeerInfo]) -> Vec<u8> {
    response.flag = flag;
    response.number = peers.len() as u32;
    let mut payload = Vec::with_capacity(RESPONSE_SIZE + peers.len() * PEER_INFO_SIZE);
    response.encode_to(&mut payload);
    for peer in peers {
        peer.encode_to(&mut payload);
    }
    encode(flag, &payload)
}

/// Decode a reply payload into the response and its peers.
pub fn decode_reply(payload: &[u8]) -> Result<(Response, Vec<PeerInfo>)> {
    let response = Response::decode(payload)?;
    let mut peers = Vec::with_capacity(response.number as usize);
    let mut at = RESPONSE_SIZE;
    for _ in 0..response.number {
        if payload.len() < at + PEER_INFO_SIZE {
            return Err(Error::FrameMalformed("truncated PeerInfo list"));
        }
        peers.push(PeerInfo::decode(&payload[at..at + PEER_INFO_SIZE])?);
        at += PEER_INFO_SIZE;
    }
    Ok((response, peers))
}
