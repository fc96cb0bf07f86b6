//! Admission control: per-target queue bounds and the optional daemon-wide
//! byte budget.
//!
//! A request either fits (and is charged against both bounds until its
//! completion is produced) or is refused with `busy` and leaves no trace.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub max_entries: usize,
    pub max_bytes: u64,
}

/// Current charge of one target's queue (waiting + in flight).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueGauge {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    QueueEntries,
    QueueBytes,
    TotalBytes,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::QueueEntries => write!(f, "target queue entry limit reached"),
            Rejection::QueueBytes => write!(f, "target queue byte limit reached"),
            Rejection::TotalBytes => write!(f, "daemon byte budget exhausted"),
        }
    }
}

impl QueueLimits {
    /// Whether a request of `len` bytes fits. An empty queue accepts one
    /// request of any size, otherwise an oversize request could never land.
    pub fn check(&self, gauge: &QueueGauge, len: u64) -> Result<(), Rejection> {
        if gauge.entries >= self.max_entries {
            return Err(Rejection::QueueEntries);
        }
        if gauge.entries > 0 && gauge.bytes.saturating_add(len) > self.max_bytes {
            return Err(Rejection::QueueBytes);
        }
        Ok(())
    }
}

/// Byte budget shared by every worker. A limit of 0 means unlimited.
#[derive(Debug, Clone)]
pub struct ByteBudget {
    limit: u64,
    used: Arc<AtomicU64>,
}

impl ByteBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Charge `len` bytes. Like [`QueueLimits::check`], an idle budget admits
    /// one request of any size.
    pub fn try_reserve(&self, len: u64) -> bool {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(len);
            if self.limit != 0 && current > 0 && next > self.limit {
                return false;
            }
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, len: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(len))
            });
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}
