//! Static daemon configuration, read once at startup.
//!
//! Every option has a default so an empty (or absent) YAML file is valid:
//!
//! ```yaml
//! socket_path: /tmp/offlog.sock
//! max_queue_entries: 1024
//! max_queue_bytes: 16777216
//! idle_timeout_ms: 5000
//! log_dir: /var/log/offlog
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use offlog_core::wire::{APPEND_PREAMBLE_LEN, DEFAULT_MAX_PAYLOAD_BYTES};

use crate::error::{io_err, DaemonError};
use crate::paths::{DEFAULT_SOCKET_MODE, DEFAULT_SOCKET_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after bind.
    pub socket_mode: u32,
    /// Ceiling on a single frame's payload; larger frames close the connection.
    pub max_payload_bytes: u32,
    /// Per-target queue bound (entries, waiting + in flight).
    pub max_queue_entries: usize,
    /// Per-target queue bound (payload bytes, waiting + in flight).
    pub max_queue_bytes: u64,
    /// Daemon-wide byte budget across all targets; 0 disables it.
    pub max_total_bytes: u64,
    pub idle_timeout_ms: u64,
    /// Attempts per write or fsync before giving up on a request.
    pub retry_attempts: usize,
    pub retry_backoff_ms: u64,
    /// Cap on a single backoff step.
    pub retry_max_backoff_ms: u64,
    /// Consecutive transient-error completions after which a target is closed.
    pub max_consecutive_failures: u32,
    pub sync_interval_ms: u64,
    pub sync_bytes: u64,
    pub shutdown_grace_ms: u64,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: DEFAULT_SOCKET_MODE,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_queue_entries: 1024,
            max_queue_bytes: 16 * 1024 * 1024,
            max_total_bytes: 0,
            idle_timeout_ms: 5_000,
            retry_attempts: 5,
            retry_backoff_ms: 10,
            retry_max_backoff_ms: 1_000,
            max_consecutive_failures: 16,
            sync_interval_ms: 1_000,
            sync_bytes: 4 * 1024 * 1024,
            shutdown_grace_ms: 5_000,
            log_dir: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl DaemonConfig {
    /// Load from a YAML file and validate. A missing file is an error; use
    /// [`DaemonConfig::load_or_default`] for optional config.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let text = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let config: DaemonConfig = if text.trim().is_empty() {
            DaemonConfig::default()
        } else {
            serde_yaml::from_str(&text).map_err(|source| DaemonError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Result<Self, DaemonError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        let invalid = |msg: &str| Err(DaemonError::InvalidConfig(msg.to_string()));
        if self.max_queue_entries == 0 {
            return invalid("max_queue_entries must be at least 1");
        }
        if self.max_queue_bytes == 0 {
            return invalid("max_queue_bytes must be at least 1");
        }
        if self.retry_attempts == 0 {
            return invalid("retry_attempts must be at least 1");
        }
        if self.retry_max_backoff_ms < self.retry_backoff_ms {
            return invalid("retry_max_backoff_ms must not be below retry_backoff_ms");
        }
        if self.max_consecutive_failures == 0 {
            return invalid("max_consecutive_failures must be at least 1");
        }
        if (self.max_payload_bytes as usize) <= APPEND_PREAMBLE_LEN {
            return invalid("max_payload_bytes is too small to carry an APPEND");
        }
        if self.socket_path.as_os_str().is_empty() {
            return invalid("socket_path must not be empty");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
