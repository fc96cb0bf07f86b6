//! `offlog append`: one line through the daemon.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use offlog_client::{AppendOutcome, Client, Durability};

use super::SocketArgs;

#[derive(Args, Debug)]
pub struct AppendArgs {
    /// File to append to; created if missing.
    pub path: PathBuf,

    /// Words of the line; joined with spaces and terminated by a newline.
    #[arg(required = true)]
    pub text: Vec<String>,

    /// Wait for the data to be fsynced before returning.
    #[arg(long)]
    pub sync: bool,

    #[command(flatten)]
    pub socket: SocketArgs,
}

impl AppendArgs {
    pub fn run(self) -> Result<()> {
        let config = self.socket.client_config();
        let timeout = config.request_timeout;
        let client = Client::connect(config).context("failed to connect to offlog daemon")?;

        let line = format!("{}\n", self.text.join(" "));
        let durability = if self.sync {
            Durability::Sync
        } else {
            Durability::NoSync
        };
        let handle = client
            .submit(&self.path, line.as_bytes(), durability)
            .with_context(|| format!("append to {} was not accepted", self.path.display()))?;
        let outcome = handle
            .wait(timeout)
            .context("no verdict from the daemon")?;
        client.close(timeout).context("failed to close daemon connection")?;

        match outcome {
            AppendOutcome::Success { bytes_written } => {
                println!("appended {bytes_written} bytes to {}", self.path.display());
                Ok(())
            }
            other => bail!("append to {} failed: {other}", self.path.display()),
        }
    }
}
