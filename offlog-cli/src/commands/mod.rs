pub mod append;
pub mod daemon;
pub mod ping;

use std::path::PathBuf;

use clap::Args;
use offlog_client::ClientConfig;
use offlog_daemon::paths::DEFAULT_SOCKET_PATH;

/// Where to find the daemon; shared by every client-side command.
#[derive(Args, Debug, Clone)]
pub struct SocketArgs {
    /// Daemon socket path.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,
}

impl SocketArgs {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.socket)
    }
}
