//! Framed request/response protocol spoken over the daemon socket.
//!
//! Every message is one frame: a fixed 14-byte big-endian header followed by
//! a type-specific payload.
//!
//! ```text
//! [type:u16][request_id:u64][payload_len:u32][payload ...]
//! ```
//!
//! A frame whose declared `payload_len` exceeds the configured ceiling is a
//! protocol violation; the reader refuses it before allocating anything.
//!
//! Payload layouts:
//!
//! ```text
//! APPEND           [target_kind:u8][durability:u8][target_len:u16][target][data ...]
//!                  target_kind 0 = UTF-8 absolute path, 1 = handle (u64 BE)
//! APPEND_QUEUED    (empty)
//! APPEND_ACK       [outcome:u8][bytes_written:u64][reason UTF-8 ...]
//! OPEN_TARGET      UTF-8 absolute path
//! OPEN_TARGET_ACK  [0][handle:u64] | [1][reason UTF-8 ...]
//! CLOSE_TARGET     [handle:u64]
//! PING / PONG      opaque bytes, echoed
//! STATUS           (empty)
//! STATUS_ACK       JSON document
//! SHUTDOWN         (empty)
//! ERROR            UTF-8 reason
//! ```

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::ProtocolError;
use crate::types::{Durability, Outcome, TargetId};

/// Header size on the wire: type(2) + request_id(8) + payload_len(4).
pub const HEADER_LEN: usize = 14;

/// Where the daemon listens unless configured otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/offlog.sock";

/// Default ceiling for a frame payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: u32 = 1024 * 1024;

/// Fixed part of an `APPEND` payload before the target bytes.
pub const APPEND_PREAMBLE_LEN: usize = 4;

const TARGET_KIND_PATH: u8 = 0;
const TARGET_KIND_HANDLE: u8 = 1;

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Append,
    AppendQueued,
    AppendAck,
    OpenTarget,
    OpenTargetAck,
    CloseTarget,
    Ping,
    Pong,
    Status,
    StatusAck,
    Shutdown,
    Error,
}

impl MessageType {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Append => 1,
            Self::AppendQueued => 2,
            Self::AppendAck => 3,
            Self::OpenTarget => 4,
            Self::OpenTargetAck => 5,
            Self::CloseTarget => 6,
            Self::Ping => 7,
            Self::Pong => 8,
            Self::Status => 9,
            Self::StatusAck => 10,
            Self::Shutdown => 11,
            Self::Error => 12,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => Self::Append,
            2 => Self::AppendQueued,
            3 => Self::AppendAck,
            4 => Self::OpenTarget,
            5 => Self::OpenTargetAck,
            6 => Self::CloseTarget,
            7 => Self::Ping,
            8 => Self::Pong,
            9 => Self::Status,
            10 => Self::StatusAck,
            11 => Self::Shutdown,
            12 => Self::Error,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Append => "APPEND",
            Self::AppendQueued => "APPEND_QUEUED",
            Self::AppendAck => "APPEND_ACK",
            Self::OpenTarget => "OPEN_TARGET",
            Self::OpenTargetAck => "OPEN_TARGET_ACK",
            Self::CloseTarget => "CLOSE_TARGET",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Status => "STATUS",
            Self::StatusAck => "STATUS_ACK",
            Self::Shutdown => "SHUTDOWN",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageType,
    pub request_id: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.kind.to_u16().to_be_bytes());
        buf[2..10].copy_from_slice(&self.request_id.to_be_bytes());
        buf[10..14].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Decode and validate a header. The length check happens here so that
    /// callers never allocate for an oversize frame.
    pub fn decode(buf: &[u8; HEADER_LEN], max_payload: u32) -> Result<Self, ProtocolError> {
        let kind = MessageType::from_u16(u16::from_be_bytes([buf[0], buf[1]]))?;
        let request_id = u64::from_be_bytes(array_at(buf, 2));
        let payload_len = u32::from_be_bytes(array_at(buf, 10));
        if payload_len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: u64::from(payload_len),
                max: max_payload,
            });
        }
        Ok(Self {
            kind,
            request_id,
            payload_len,
        })
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageType, request_id: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            request_id,
            payload,
        }
    }

    pub fn empty(kind: MessageType, request_id: u64) -> Self {
        Self::new(kind, request_id, Vec::new())
    }

    /// Header plus payload as one buffer, so a frame goes out in a single write.
    ///
    /// Payloads longer than `u32::MAX` cannot be expressed; callers enforce the
    /// much smaller configured ceiling before building frames.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        let header = FrameHeader {
            kind: self.kind,
            request_id: self.request_id,
            payload_len,
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode one complete frame from the front of `bytes`.
    ///
    /// Returns the frame and the number of bytes consumed, or `Ok(None)` when
    /// `bytes` does not yet hold a whole frame.
    pub fn decode(bytes: &[u8], max_payload: u32) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some(head) = bytes.get(..HEADER_LEN) else {
            return Ok(None);
        };
        let header = FrameHeader::decode(&array_at(head, 0), max_payload)?;
        let total = HEADER_LEN + header.payload_len as usize;
        let Some(payload) = bytes.get(HEADER_LEN..total) else {
            return Ok(None);
        };
        Ok(Some((
            Self::new(header.kind, header.request_id, payload.to_vec()),
            total,
        )))
    }

    pub fn append(request_id: u64, append: &AppendPayload) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Append, request_id, append.encode()?))
    }

    pub fn append_ack(request_id: u64, ack: &AppendAck) -> Self {
        Self::new(MessageType::AppendAck, request_id, ack.encode())
    }

    pub fn open_target(request_id: u64, path: &Path) -> Result<Self, ProtocolError> {
        let path = validate_target_path(path)?;
        Ok(Self::new(
            MessageType::OpenTarget,
            request_id,
            path.as_bytes().to_vec(),
        ))
    }

    pub fn open_target_ack(request_id: u64, ack: &OpenTargetAck) -> Self {
        Self::new(MessageType::OpenTargetAck, request_id, ack.encode())
    }

    pub fn close_target(request_id: u64, handle: u64) -> Self {
        Self::new(
            MessageType::CloseTarget,
            request_id,
            handle.to_be_bytes().to_vec(),
        )
    }

    pub fn error(request_id: u64, reason: &str) -> Self {
        Self::new(MessageType::Error, request_id, reason.as_bytes().to_vec())
    }

    /// Payload interpreted as UTF-8 text (OPEN_TARGET, ERROR).
    pub fn text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8("frame text"))
    }

    /// Payload of a CLOSE_TARGET frame.
    pub fn handle(&self) -> Result<u64, ProtocolError> {
        let bytes = self
            .payload
            .get(..8)
            .ok_or(ProtocolError::Truncated {
                what: "CLOSE_TARGET",
                expected: 8,
                actual: self.payload.len(),
            })?;
        Ok(u64::from_be_bytes(array_at(bytes, 0)))
    }
}

/// Read one frame from a blocking stream.
///
/// `Ok(None)` means the peer closed the stream cleanly on a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: u32) -> Result<Option<Frame>, ProtocolError> {
    let mut head = [0u8; HEADER_LEN];
    let read = read_full(reader, &mut head)?;
    if read == 0 {
        return Ok(None);
    }
    if read < HEADER_LEN {
        return Err(ProtocolError::TruncatedFrame {
            read,
            expected: HEADER_LEN,
        });
    }
    let header = FrameHeader::decode(&head, max_payload)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    let read = read_full(reader, &mut payload)?;
    if read < payload.len() {
        return Err(ProtocolError::TruncatedFrame {
            read: HEADER_LEN + read,
            expected: HEADER_LEN + payload.len(),
        });
    }
    Ok(Some(Frame::new(header.kind, header.request_id, payload)))
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    writer.write_all(&frame.encode())?;
    writer.flush()?;
    Ok(())
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// APPEND
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendPayload {
    pub target: TargetId,
    pub durability: Durability,
    pub data: Vec<u8>,
}

impl AppendPayload {
    /// Size of the encoded payload without building it.
    pub fn encoded_len(target: &TargetId, data_len: usize) -> usize {
        let target_len = match target {
            TargetId::Path(path) => path.as_os_str().len(),
            TargetId::Handle(_) => 8,
        };
        APPEND_PREAMBLE_LEN + target_len + data_len
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (kind, target): (u8, Vec<u8>) = match &self.target {
            TargetId::Path(path) => (
                TARGET_KIND_PATH,
                validate_target_path(path)?.as_bytes().to_vec(),
            ),
            TargetId::Handle(handle) => (TARGET_KIND_HANDLE, handle.to_be_bytes().to_vec()),
        };
        let target_len = u16::try_from(target.len()).map_err(|_| {
            ProtocolError::InvalidPath(format!("path of {} bytes is too long", target.len()))
        })?;

        let mut buf = Vec::with_capacity(APPEND_PREAMBLE_LEN + target.len() + self.data.len());
        buf.push(kind);
        buf.push(self.durability.code());
        buf.extend_from_slice(&target_len.to_be_bytes());
        buf.extend_from_slice(&target);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let preamble = payload
            .get(..APPEND_PREAMBLE_LEN)
            .ok_or(ProtocolError::Truncated {
                what: "APPEND",
                expected: APPEND_PREAMBLE_LEN,
                actual: payload.len(),
            })?;
        let kind = preamble[0];
        let durability = Durability::from_code(preamble[1])?;
        let target_len = u16::from_be_bytes([preamble[2], preamble[3]]) as usize;
        let target_end = APPEND_PREAMBLE_LEN + target_len;
        let target_bytes =
            payload
                .get(APPEND_PREAMBLE_LEN..target_end)
                .ok_or(ProtocolError::Truncated {
                    what: "APPEND",
                    expected: target_end,
                    actual: payload.len(),
                })?;

        let target = match kind {
            TARGET_KIND_PATH => {
                let path = std::str::from_utf8(target_bytes)
                    .map_err(|_| ProtocolError::InvalidUtf8("target path"))?;
                let path = PathBuf::from(path);
                validate_target_path(&path)?;
                TargetId::Path(path)
            }
            TARGET_KIND_HANDLE => {
                if target_bytes.len() != 8 {
                    return Err(ProtocolError::Truncated {
                        what: "APPEND handle",
                        expected: 8,
                        actual: target_bytes.len(),
                    });
                }
                TargetId::Handle(u64::from_be_bytes(array_at(target_bytes, 0)))
            }
            other => return Err(ProtocolError::UnknownTargetKind(other)),
        };

        Ok(Self {
            target,
            durability,
            data: payload[target_end..].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// APPEND_ACK
// ---------------------------------------------------------------------------

const APPEND_ACK_FIXED_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendAck {
    pub outcome: Outcome,
    pub bytes_written: u64,
}

impl AppendAck {
    pub fn busy() -> Self {
        Self {
            outcome: Outcome::Busy,
            bytes_written: 0,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::FatalError(reason.into()),
            bytes_written: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let reason = self.outcome.reason().unwrap_or_default();
        let mut buf = Vec::with_capacity(APPEND_ACK_FIXED_LEN + reason.len());
        buf.push(self.outcome.code());
        buf.extend_from_slice(&self.bytes_written.to_be_bytes());
        buf.extend_from_slice(reason.as_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < APPEND_ACK_FIXED_LEN {
            return Err(ProtocolError::Truncated {
                what: "APPEND_ACK",
                expected: APPEND_ACK_FIXED_LEN,
                actual: payload.len(),
            });
        }
        let bytes_written = u64::from_be_bytes(array_at(payload, 1));
        let reason = String::from_utf8(payload[APPEND_ACK_FIXED_LEN..].to_vec())
            .map_err(|_| ProtocolError::InvalidUtf8("APPEND_ACK reason"))?;
        Ok(Self {
            outcome: Outcome::from_code(payload[0], reason)?,
            bytes_written,
        })
    }
}

// ---------------------------------------------------------------------------
// OPEN_TARGET_ACK
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTargetAck {
    Opened(u64),
    Denied(String),
}

impl OpenTargetAck {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            OpenTargetAck::Opened(handle) => {
                let mut buf = vec![0u8];
                buf.extend_from_slice(&handle.to_be_bytes());
                buf
            }
            OpenTargetAck::Denied(reason) => {
                let mut buf = vec![1u8];
                buf.extend_from_slice(reason.as_bytes());
                buf
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.first() {
            Some(0) => {
                let bytes = payload.get(1..9).ok_or(ProtocolError::Truncated {
                    what: "OPEN_TARGET_ACK",
                    expected: 9,
                    actual: payload.len(),
                })?;
                Ok(OpenTargetAck::Opened(u64::from_be_bytes(array_at(bytes, 0))))
            }
            Some(1) => String::from_utf8(payload[1..].to_vec())
                .map(OpenTargetAck::Denied)
                .map_err(|_| ProtocolError::InvalidUtf8("OPEN_TARGET_ACK reason")),
            Some(other) => Err(ProtocolError::UnknownOpenStatus(*other)),
            None => Err(ProtocolError::Truncated {
                what: "OPEN_TARGET_ACK",
                expected: 1,
                actual: 0,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Paths on the wire must be absolute UTF-8 without NUL bytes.
pub fn validate_target_path(path: &Path) -> Result<&str, ProtocolError> {
    let text = path
        .to_str()
        .ok_or_else(|| ProtocolError::InvalidPath(format!("{} is not UTF-8", path.display())))?;
    if text.contains('\0') {
        return Err(ProtocolError::InvalidPath(
            "embedded null byte in path".to_string(),
        ));
    }
    if !path.is_absolute() {
        return Err(ProtocolError::InvalidPath(format!("{text} is not absolute")));
    }
    if text.len() > u16::MAX as usize {
        return Err(ProtocolError::InvalidPath(format!(
            "path of {} bytes is too long",
            text.len()
        )));
    }
    Ok(text)
}

fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}
