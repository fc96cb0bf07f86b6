//! `offlog daemon`: run the daemon in the foreground and talk to it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use offlog_client::{Client, ClientError};
use offlog_daemon::paths::{daemon_log_path, default_config_path, default_log_dir};
use offlog_daemon::{start_blocking, DaemonConfig};

use super::SocketArgs;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground until stopped.
    Start(DaemonStartArgs),
    /// Ask a running daemon to drain its queues and exit.
    Stop(SocketArgs),
    /// Show daemon status and per-target workers.
    Status(DaemonStatusArgs),
    /// Print recent daemon log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    /// YAML config file. Defaults to ~/.offlog/config.yaml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the configured socket path.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Write daemon logs to <dir>/offlogd.log instead of stderr.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DaemonStatusArgs {
    /// Emit the raw status document as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub socket: SocketArgs,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Daemon log directory. Defaults to ~/.offlog/logs.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Start(args) => {
            let config = load_config(&args)?;
            start_blocking(config).context("daemon exited with error")?;
        }
        DaemonCommand::Stop(socket) => match Client::connect(socket.client_config()) {
            Ok(client) => {
                client.shutdown().context("failed to stop daemon")?;
                println!("daemon stop requested");
            }
            Err(ClientError::DaemonUnavailable { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status(args) => {
            let status = match Client::connect(args.socket.client_config()) {
                Ok(client) => client.status().context("failed to query daemon status")?,
                Err(ClientError::DaemonUnavailable { .. }) => serde_json::json!({
                    "running": false,
                    "socket": args.socket.socket.display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            } else {
                print_status(&status)?;
            }
        }
        DaemonCommand::Logs(args) => {
            let log_dir = match args.log_dir {
                Some(dir) => dir,
                None => default_log_dir(&home_dir()?),
            };
            print_tail(&daemon_log_path(&log_dir), args.lines)
                .context("failed to read daemon log")?;
        }
    }

    Ok(())
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

fn load_config(args: &DaemonStartArgs) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            let path = default_config_path(&home_dir()?);
            DaemonConfig::load_or_default(&path)
                .with_context(|| format!("failed to load config {}", path.display()))?
        }
    };
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = Some(log_dir.clone());
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Status rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WorkerStatus {
    path: String,
    state: String,
    queued_entries: u64,
    queued_bytes: u64,
    appended: u64,
    failed: u64,
    bytes_written: u64,
    syncs: u64,
    last_error: Option<String>,
}

#[derive(Tabled)]
struct WorkerRow {
    #[tabled(rename = "target")]
    target: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "queued")]
    queued: String,
    #[tabled(rename = "appended")]
    appended: u64,
    #[tabled(rename = "failed")]
    failed: u64,
    #[tabled(rename = "written")]
    written: String,
    #[tabled(rename = "syncs")]
    syncs: u64,
    #[tabled(rename = "last error")]
    last_error: String,
}

fn print_status(status: &Value) -> Result<()> {
    if !status["running"].as_bool().unwrap_or(false) {
        println!(
            "daemon is not running at {}",
            status["socket"].as_str().unwrap_or("?")
        );
        return Ok(());
    }

    let workers: Vec<WorkerStatus> = serde_json::from_value(status["workers"].clone())
        .context("daemon status has an unexpected worker list")?;
    let started = status["started_at_unix"]
        .as_i64()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let stopping = if status["stopping"].as_bool().unwrap_or(false) {
        " | stopping".yellow().bold().to_string()
    } else {
        String::new()
    };

    println!(
        "offlog v{} | pid {} | started {} | {} connections | {} targets{}",
        status["version"].as_str().unwrap_or(env!("CARGO_PKG_VERSION")),
        status["pid"],
        started,
        status["connections"],
        workers.len(),
        stopping,
    );
    println!(
        "buffered {} of {}",
        format_bytes(status["total_bytes_queued"].as_u64().unwrap_or(0)),
        match status["total_bytes_limit"].as_u64() {
            Some(0) | None => "unlimited".to_string(),
            Some(limit) => format_bytes(limit),
        }
    );

    if workers.is_empty() {
        println!("No active targets.");
        return Ok(());
    }

    let rows: Vec<WorkerRow> = workers
        .into_iter()
        .map(|worker| WorkerRow {
            target: worker.path,
            state: state_label(&worker.state),
            queued: format!(
                "{} ({})",
                worker.queued_entries,
                format_bytes(worker.queued_bytes)
            ),
            appended: worker.appended,
            failed: worker.failed,
            written: format_bytes(worker.bytes_written),
            syncs: worker.syncs,
            last_error: worker.last_error.unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn state_label(state: &str) -> String {
    let label = state.to_uppercase();
    match state {
        "idle" => label.green().bold().to_string(),
        "draining" => label.cyan().bold().to_string(),
        "closed" => label.red().bold().to_string(),
        _ => label.bright_black().to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in reader.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.0 MiB");
    }

    #[test]
    fn flags_override_loaded_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "socket_path: /tmp/from-file.sock\nmax_queue_entries: 8\n").unwrap();

        let config = load_config(&DaemonStartArgs {
            config: Some(path),
            socket: Some(PathBuf::from("/tmp/from-flag.sock")),
            log_dir: Some(dir.path().join("logs")),
        })
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/from-flag.sock"));
        assert_eq!(config.max_queue_entries, 8);
        assert_eq!(config.log_dir, Some(dir.path().join("logs")));
    }
}
