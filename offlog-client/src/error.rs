use std::io;
use std::path::PathBuf;
use std::time::Duration;

use offlog_core::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Nothing is listening on the socket. Callers decide whether to retry or
    /// fall back to local writes.
    #[error("offlog daemon is not reachable at {socket}: {source}")]
    DaemonUnavailable {
        socket: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on daemon connection: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection to the daemon was lost")]
    ConnectionLost,

    #[error("no reply from the daemon within {0:?}")]
    Timeout(Duration),

    /// The daemon could not open the target; `reason` is `Kind: message`.
    #[error("daemon could not open {path}: {reason}")]
    OpenDenied { path: PathBuf, reason: String },

    /// The daemon closed the connection with an ERROR frame.
    #[error("daemon rejected the connection: {0}")]
    Rejected(String),

    #[error("invalid status document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a submission was not accepted. Nothing was queued in any of these cases.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The target's queue or the daemon's byte budget is full. Retry later.
    #[error("target is busy")]
    Busy,

    #[error("connection to the daemon was lost")]
    ConnectionLost,

    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { len: usize, max: u32 },

    #[error("invalid target: {0}")]
    InvalidTarget(#[from] ProtocolError),
}

impl From<SubmitError> for io::Error {
    fn from(err: SubmitError) -> Self {
        let kind = match &err {
            SubmitError::Busy => io::ErrorKind::WouldBlock,
            SubmitError::ConnectionLost => io::ErrorKind::BrokenPipe,
            SubmitError::PayloadTooLarge { .. } | SubmitError::InvalidTarget(_) => {
                io::ErrorKind::InvalidInput
            }
        };
        io::Error::new(kind, err)
    }
}
