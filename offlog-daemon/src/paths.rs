use std::path::{Path, PathBuf};
use std::time::Duration;

pub use offlog_core::wire::DEFAULT_SOCKET_PATH;
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

pub const DAEMON_LOG: &str = "offlogd.log";
pub const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(5);

pub fn offlog_root(home: &Path) -> PathBuf {
    home.join(".offlog")
}

pub fn default_log_dir(home: &Path) -> PathBuf {
    offlog_root(home).join("logs")
}

pub fn default_config_path(home: &Path) -> PathBuf {
    offlog_root(home).join("config.yaml")
}

pub fn daemon_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(DAEMON_LOG)
}
