//! Domain types shared by the daemon and the client library.
//!
//! Wire codes for every enum live next to the enum so that the daemon and
//! client can never disagree on them.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

/// Per-request choice between OS-buffered write and fsync-confirmed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// Write only; rely on OS buffering (and the daemon's batched flush policy).
    #[default]
    NoSync,
    /// fsync before the completion is reported.
    Sync,
}

impl Durability {
    pub const fn code(self) -> u8 {
        match self {
            Durability::NoSync => 0,
            Durability::Sync => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Durability::NoSync),
            1 => Ok(Durability::Sync),
            other => Err(ProtocolError::UnknownDurability(other)),
        }
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Durability::NoSync => write!(f, "no-sync"),
            Durability::Sync => write!(f, "sync"),
        }
    }
}

// ---------------------------------------------------------------------------
// TargetId
// ---------------------------------------------------------------------------

/// How an `APPEND` names its destination file.
///
/// Two ids naming the same underlying file are routed to the same worker by
/// the daemon; equality here is purely syntactic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    /// Absolute path, re-resolved by the daemon on every append.
    Path(PathBuf),
    /// Connection-scoped handle negotiated with `OPEN_TARGET`.
    Handle(u64),
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Path(path) => write!(f, "{}", path.display()),
            TargetId::Handle(handle) => write!(f, "handle:{handle}"),
        }
    }
}

impl From<PathBuf> for TargetId {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Final verdict the daemon reports for one `APPEND`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    /// Rejected at admission; never queued, no completion follows.
    Busy,
    /// Retries exhausted on a transient condition; the worker carries on.
    TransientError(String),
    /// The target is unusable; the worker is closed.
    FatalError(String),
}

impl Outcome {
    pub const fn code(&self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Busy => 1,
            Outcome::TransientError(_) => 2,
            Outcome::FatalError(_) => 3,
        }
    }

    pub fn from_code(code: u8, reason: String) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Outcome::Success),
            1 => Ok(Outcome::Busy),
            2 => Ok(Outcome::TransientError(reason)),
            3 => Ok(Outcome::FatalError(reason)),
            other => Err(ProtocolError::UnknownOutcome(other)),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::TransientError(reason) | Outcome::FatalError(reason) => Some(reason),
            Outcome::Success | Outcome::Busy => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Busy => write!(f, "busy"),
            Outcome::TransientError(reason) => write!(f, "transient-error: {reason}"),
            Outcome::FatalError(reason) => write!(f, "fatal-error: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CompletionRecord
// ---------------------------------------------------------------------------

/// Produced exactly once per accepted append, in per-target acceptance order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub request_id: u64,
    pub target: TargetId,
    pub outcome: Outcome,
    pub bytes_written: u64,
}
