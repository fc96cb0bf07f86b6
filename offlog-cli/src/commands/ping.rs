use anyhow::{Context, Result};
use clap::Args;
use offlog_client::Client;

use super::SocketArgs;

#[derive(Args, Debug)]
pub struct PingArgs {
    #[command(flatten)]
    pub socket: SocketArgs,
}

impl PingArgs {
    pub fn run(self) -> Result<()> {
        let config = self.socket.client_config();
        let timeout = config.request_timeout;
        let client = Client::connect(config).context("failed to connect to offlog daemon")?;
        let rtt = client.ping(timeout).context("daemon did not answer")?;
        println!(
            "pong from {} in {:.3} ms",
            self.socket.socket.display(),
            rtt.as_secs_f64() * 1_000.0
        );
        Ok(())
    }
}
