//! Size-based rotation of the daemon's own log file.
//!
//! `offlogd.log` is renamed to `offlogd.log.1` once it crosses the size
//! limit; older copies shift up by one and the oldest falls off. The writer
//! reopens the file for every event, so it follows the rename without help.
//!
//! Target files are never rotated by the daemon.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    /// 10 MiB per file, five rotated copies.
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log` if it has reached `max_bytes`. Returns whether it did.
    /// A missing log is not an error.
    pub fn rotate_if_needed(&self, log: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes || self.keep == 0 {
            return Ok(false);
        }

        remove_if_present(&rotated_path(log, self.keep))?;
        for n in (1..self.keep).rev() {
            let from = rotated_path(log, n);
            if from.exists() {
                fs::rename(&from, rotated_path(log, n + 1))?;
            }
        }
        fs::rename(log, rotated_path(log, 1))?;
        Ok(true)
    }
}

/// One rotation pass over the daemon log in `log_dir`, run from the
/// periodic rotation task. Failures are logged, never propagated.
pub fn rotate_daemon_log(log_dir: &Path, policy: RotationPolicy) {
    let log = crate::paths::daemon_log_path(log_dir);
    match policy.rotate_if_needed(&log) {
        Ok(true) => tracing::info!(path = %log.display(), "daemon log rotated"),
        Ok(false) => {}
        Err(err) => tracing::warn!(path = %log.display(), error = %err, "daemon log rotation failed"),
    }
}

/// `offlogd.log` → `offlogd.log.<n>`.
pub fn rotated_path(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
