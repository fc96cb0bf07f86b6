//! offlog: hand append writes to a local daemon.
//!
//! # Usage
//!
//! ```text
//! offlog daemon start [--config <file>] [--socket <path>] [--log-dir <dir>]
//! offlog daemon stop|status [--socket <path>] [--json]
//! offlog daemon logs [--log-dir <dir>] [--lines <n>]
//! offlog append <path> <text>... [--sync] [--socket <path>]
//! offlog ping [--socket <path>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{append::AppendArgs, daemon::DaemonCommand, ping::PingArgs};

#[derive(Parser, Debug)]
#[command(
    name = "offlog",
    version,
    about = "Offload append-only file writes to a local daemon",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, stop or inspect the offlog daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Append a line to a file through the daemon.
    Append(AppendArgs),

    /// Check that the daemon is answering.
    Ping(PingArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Append(args) => args.run(),
        Commands::Ping(args) => args.run(),
    }
}
