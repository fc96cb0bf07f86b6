//! Error types for offlog-core.

use thiserror::Error;

/// Everything that can go wrong while framing or decoding protocol messages.
///
/// Any of these on the daemon side is a protocol violation and closes the
/// offending connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer hung up part way through a frame.
    #[error("connection closed mid-frame ({read} of {expected} bytes)")]
    TruncatedFrame { read: usize, expected: usize },

    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// Declared payload length exceeds the configured ceiling.
    #[error("frame payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: u64, max: u32 },

    /// A payload is shorter than its fixed layout requires.
    #[error("{what} payload truncated: need {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("unknown target kind {0}")]
    UnknownTargetKind(u8),

    #[error("unknown durability flag {0}")]
    UnknownDurability(u8),

    #[error("unknown outcome code {0}")]
    UnknownOutcome(u8),

    #[error("unknown open-target status {0}")]
    UnknownOpenStatus(u8),

    /// Target path is not absolute, contains NUL, or is too long to encode.
    #[error("invalid target path: {0}")]
    InvalidPath(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A request id was reused while the earlier request is still outstanding.
    #[error("request id {0} is already outstanding")]
    DuplicateRequestId(u64),

    /// A well-formed frame arrived in a context where it is not allowed.
    #[error("unexpected {0} frame")]
    Unexpected(crate::wire::MessageType),
}
