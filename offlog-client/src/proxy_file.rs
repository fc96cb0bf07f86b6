//! `std::io::Write` over a daemon-opened target.

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use offlog_core::Durability;

use crate::client::{AppendHandle, AppendOutcome, Client, TargetHandle};
use crate::error::ClientError;

/// Appends every `write` to one target through the daemon.
///
/// `write` never blocks on disk I/O: a full queue surfaces as
/// [`io::ErrorKind::WouldBlock`] and a dropped daemon connection as
/// [`io::ErrorKind::BrokenPipe`]. `flush` waits for every write issued so far
/// and reports the first failure among them.
pub struct ProxyFile<'c> {
    client: &'c Client,
    target: Option<TargetHandle>,
    durability: Durability,
    pending: Vec<AppendHandle>,
}

impl<'c> ProxyFile<'c> {
    pub fn open(client: &'c Client, path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let target = client.open_target(path)?;
        Ok(Self {
            client,
            target: Some(target),
            durability: Durability::NoSync,
            pending: Vec::new(),
        })
    }

    /// Request an fsync before each write is confirmed.
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.target.as_ref().map(TargetHandle::path)
    }

    /// Writes submitted but not yet confirmed.
    pub fn pending(&self) -> usize {
        self.pending.iter().filter(|handle| handle.poll().is_none()).count()
    }

    /// Flush, then release the daemon-side handle. Idempotent.
    pub fn close(&mut self) -> io::Result<()> {
        let flushed = self.flush();
        if let Some(target) = self.target.take() {
            self.client
                .close_target(target)
                .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))?;
        }
        flushed
    }

    fn target(&self) -> io::Result<&TargetHandle> {
        self.target
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "proxy file is closed"))
    }

    /// Drop handles that already resolved, surfacing the first failure.
    fn reap(&mut self) -> io::Result<()> {
        let mut failure = None;
        self.pending.retain(|handle| match handle.poll() {
            None => true,
            Some(outcome) => {
                if failure.is_none() {
                    failure = outcome_error(outcome);
                }
                false
            }
        });
        failure.map_or(Ok(()), Err)
    }
}

impl Write for ProxyFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reap()?;
        let handle = self.client.submit_to(self.target()?, buf, self.durability)?;
        self.pending.push(handle);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let timeout: Duration = self.client.config().request_timeout;
        let mut failure = None;
        for handle in self.pending.drain(..) {
            let err = match handle.wait(timeout) {
                Ok(outcome) => outcome_error(outcome),
                Err(err) => Some(io::Error::new(io::ErrorKind::TimedOut, err)),
            };
            if failure.is_none() {
                failure = err;
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

impl Drop for ProxyFile<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(error = %err, "proxy file closed with unconfirmed writes");
        }
    }
}

fn outcome_error(outcome: AppendOutcome) -> Option<io::Error> {
    let kind = match &outcome {
        AppendOutcome::Success { .. } => return None,
        AppendOutcome::Busy => io::ErrorKind::WouldBlock,
        AppendOutcome::ConnectionLost => io::ErrorKind::BrokenPipe,
        AppendOutcome::TransientError { .. } | AppendOutcome::FatalError { .. } => {
            io::ErrorKind::Other
        }
    };
    Some(io::Error::new(kind, outcome.to_string()))
}
