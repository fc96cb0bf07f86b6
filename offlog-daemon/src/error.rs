use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, configuration, and connections.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("daemon socket already in use: {socket}")]
    SocketInUse { socket: PathBuf },

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("{task} task failed: {reason}")]
    Task { task: &'static str, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
