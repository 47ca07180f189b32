use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub type LogicalId = u16;
pub type SessionId = u16;

/// Upper bound on a single frame accepted from a stream. Anything larger desynchronizes
/// the reader and is treated as fatal.
pub const MAX_FRAME_BYTES: u64 = 16 << 20; // 16 MiB

const MAX_SHORT_LEN: usize = 125;
const LEN_U16: u8 = 126;
const LEN_U64: u8 = 127;
const ID_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("truncated frame header")]
    Truncated,
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("bad length prefix {0}")]
    BadLengthPrefix(u8),
    #[error("length mismatch: declared {declared}, remaining {remaining}")]
    LengthMismatch { declared: u64, remaining: usize },
    #[error("frame too large: {0}")]
    TooLarge(u64),
    #[error("bad {0} payload length {1}")]
    BadPayload(FrameType, usize),
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("bad remote address {0:?}")]
    BadRemote(String),
}

impl FrameError {
    /// Whether a stream that produced this error can no longer be parsed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::TooLarge(_) | FrameError::BadLengthPrefix(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Open = 0x01,
    Data = 0x02,
    Close = 0x03,
    Error = 0x04,
    Alive = 0x05,
    GetId = 0x06,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Open => "open",
            FrameType::Data => "data",
            FrameType::Close => "close",
            FrameType::Error => "error",
            FrameType::Alive => "alive",
            FrameType::GetId => "get_id",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        match v {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Close),
            0x04 => Ok(FrameType::Error),
            0x05 => Ok(FrameType::Alive),
            0x06 => Ok(FrameType::GetId),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Udp,
}

impl StreamKind {
    pub fn scheme(self) -> &'static str {
        match self {
            StreamKind::Tcp => "tcp",
            StreamKind::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub id: LogicalId,
    /// `host:port` of the outbound destination.
    pub remote: String,
    pub kind: StreamKind,
}

impl OpenRequest {
    pub fn tcp(id: LogicalId, remote: impl Into<String>) -> Self {
        Self {
            id,
            remote: remote.into(),
            kind: StreamKind::Tcp,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.kind.scheme(), self.remote)
    }

    fn parse(id: LogicalId, raw: &str) -> Result<Self, FrameError> {
        let u = url::Url::parse(raw.trim()).map_err(|_| FrameError::BadRemote(raw.to_string()))?;
        let kind = match u.scheme() {
            "tcp" => StreamKind::Tcp,
            "udp" => StreamKind::Udp,
            other => return Err(FrameError::UnsupportedScheme(other.to_string())),
        };
        let host = u
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FrameError::BadRemote(raw.to_string()))?;
        let port = u.port().ok_or_else(|| FrameError::BadRemote(raw.to_string()))?;
        Ok(Self {
            id,
            remote: format!("{host}:{port}"),
            kind,
        })
    }
}

/// A decoded tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open(OpenRequest),
    Data { id: LogicalId, payload: Bytes },
    Close { id: LogicalId },
    Error { id: LogicalId, message: String },
    Alive,
    GetId { id: LogicalId },
}

impl Frame {
    pub fn kind(&self) -> FrameType {
        match self {
            Frame::Open(_) => FrameType::Open,
            Frame::Data { .. } => FrameType::Data,
            Frame::Close { .. } => FrameType::Close,
            Frame::Error { .. } => FrameType::Error,
            Frame::Alive => FrameType::Alive,
            Frame::GetId { .. } => FrameType::GetId,
        }
    }

    pub fn id(&self) -> Option<LogicalId> {
        match self {
            Frame::Open(req) => Some(req.id),
            Frame::Data { id, .. }
            | Frame::Close { id }
            | Frame::Error { id, .. }
            | Frame::GetId { id } => Some(*id),
            Frame::Alive => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Open(req) => encode(FrameType::Open, Some(req.id), req.url().as_bytes()),
            Frame::Data { id, payload } => encode(FrameType::Data, Some(*id), payload),
            Frame::Close { id } => encode(FrameType::Close, Some(*id), &[]),
            Frame::Error { id, message } => encode(FrameType::Error, Some(*id), message.as_bytes()),
            Frame::Alive => encode(FrameType::Alive, None, &[]),
            Frame::GetId { id } => encode(FrameType::GetId, Some(*id), &[]),
        }
    }
}

/// Encodes one frame: type byte, length prefix, optional big-endian id, payload.
pub fn encode(kind: FrameType, id: Option<LogicalId>, payload: &[u8]) -> Bytes {
    let body_len = payload.len() + if id.is_some() { ID_LEN } else { 0 };
    let mut out = BytesMut::with_capacity(1 + 9 + body_len);
    out.put_u8(kind as u8);
    if body_len <= MAX_SHORT_LEN {
        out.put_u8(body_len as u8);
    } else if let Ok(n) = u16::try_from(body_len) {
        out.put_u8(LEN_U16);
        out.put_u16(n);
    } else {
        out.put_u8(LEN_U64);
        out.put_u64(body_len as u64);
    }
    if let Some(id) = id {
        out.put_u16(id);
    }
    out.put_slice(payload);
    out.freeze()
}

/// Decodes a buffer holding exactly one frame.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    let (kind, declared, offset) = parse_header(buf)?.ok_or(FrameError::Truncated)?;
    let remaining = buf.len() - offset;
    if declared != remaining as u64 {
        return Err(FrameError::LengthMismatch {
            declared,
            remaining,
        });
    }
    decode_payload(kind, &buf[offset..])
}

/// Returns `(type byte, payload length, header length)`, or `None` when more bytes are needed.
fn parse_header(buf: &[u8]) -> Result<Option<(u8, u64, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let kind = buf[0];
    match buf[1] {
        n if n as usize <= MAX_SHORT_LEN => Ok(Some((kind, n as u64, 2))),
        LEN_U16 => {
            let Some(b) = buf.get(2..4) else {
                return Ok(None);
            };
            Ok(Some((kind, u16::from_be_bytes([b[0], b[1]]) as u64, 4)))
        }
        LEN_U64 => {
            let Some(b) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut n = [0u8; 8];
            n.copy_from_slice(b);
            Ok(Some((kind, u64::from_be_bytes(n), 10)))
        }
        other => Err(FrameError::BadLengthPrefix(other)),
    }
}

fn decode_payload(kind: u8, payload: &[u8]) -> Result<Frame, FrameError> {
    let kind = FrameType::try_from(kind)?;
    match kind {
        FrameType::Open => {
            let (id, rest) = split_id(kind, payload)?;
            let raw = String::from_utf8_lossy(rest);
            Ok(Frame::Open(OpenRequest::parse(id, &raw)?))
        }
        FrameType::Data => {
            let (id, rest) = split_id(kind, payload)?;
            Ok(Frame::Data {
                id,
                payload: Bytes::copy_from_slice(rest),
            })
        }
        FrameType::Close | FrameType::GetId => {
            if payload.len() != ID_LEN {
                return Err(FrameError::BadPayload(kind, payload.len()));
            }
            let (id, _) = split_id(kind, payload)?;
            if kind == FrameType::Close {
                Ok(Frame::Close { id })
            } else {
                Ok(Frame::GetId { id })
            }
        }
        FrameType::Error => {
            let (id, rest) = split_id(kind, payload)?;
            Ok(Frame::Error {
                id,
                message: String::from_utf8_lossy(rest).into_owned(),
            })
        }
        FrameType::Alive => {
            if !payload.is_empty() {
                return Err(FrameError::BadPayload(kind, payload.len()));
            }
            Ok(Frame::Alive)
        }
    }
}

fn split_id(kind: FrameType, payload: &[u8]) -> Result<(LogicalId, &[u8]), FrameError> {
    if payload.len() < ID_LEN {
        return Err(FrameError::BadPayload(kind, payload.len()));
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    Ok((id, &payload[ID_LEN..]))
}

/// Reassembles frames from a byte stream that may split or coalesce them.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pops the next complete frame.
    ///
    /// A malformed frame is consumed before its error is returned, so the caller may keep
    /// reading unless [`FrameError::is_fatal`] says otherwise.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some((kind, declared, offset)) = parse_header(&self.buf)? else {
            return Ok(None);
        };
        if declared > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(declared));
        }
        let total = offset + declared as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let raw = self.buf.split_to(total);
        decode_payload(kind, &raw[offset..]).map(Some)
    }
}
