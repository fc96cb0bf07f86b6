//! Leveled line logger that sends file records through the daemon.
//!
//! Records at or above the file level go to the target file. Records at or
//! above the stderr level go to stderr; otherwise records at or above the
//! stdout level go to stdout. Any destination can be disabled.

use std::error::Error as StdError;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Local, NaiveDateTime};
use offlog_core::Durability;
use parking_lot::Mutex;

use crate::client::{Client, ClientConfig, TargetHandle};
use crate::error::ClientError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARNING" | "WARN" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Stdout,
    Stderr,
}

enum Sink {
    Local { file: Mutex<File>, path: PathBuf },
    Daemon { client: Client, target: TargetHandle },
}

pub struct LoggerBuilder {
    name: String,
    path: Option<PathBuf>,
    file_level: Option<Level>,
    stdout_level: Option<Level>,
    stderr_level: Option<Level>,
    local_file: bool,
    client: ClientConfig,
}

impl LoggerBuilder {
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn file_level(mut self, level: Option<Level>) -> Self {
        self.file_level = level;
        self
    }

    /// `None` sends nothing to stdout.
    pub fn stdout_level(mut self, level: Option<Level>) -> Self {
        self.stdout_level = level;
        self
    }

    pub fn stderr_level(mut self, level: Option<Level>) -> Self {
        self.stderr_level = level;
        self
    }

    /// Append to the file directly instead of through the daemon.
    pub fn local_file(mut self, local: bool) -> Self {
        self.local_file = local;
        self
    }

    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client = config;
        self
    }

    /// Opens the file, or connects and negotiates a handle with the daemon.
    pub fn build(self) -> Result<Logger, ClientError> {
        let sink = match (&self.path, self.file_level) {
            (Some(path), Some(_)) if self.local_file => Some(Sink::Local {
                file: Mutex::new(OpenOptions::new().create(true).append(true).open(path)?),
                path: path.clone(),
            }),
            (Some(path), Some(_)) => {
                let client = Client::connect(self.client.clone())?;
                let target = client.open_target(path)?;
                Some(Sink::Daemon { client, target })
            }
            _ => None,
        };
        Ok(Logger {
            name: self.name,
            sink,
            file_level: self.file_level,
            stdout_level: self.stdout_level,
            stderr_level: self.stderr_level,
        })
    }
}

pub struct Logger {
    name: String,
    sink: Option<Sink>,
    file_level: Option<Level>,
    stdout_level: Option<Level>,
    stderr_level: Option<Level>,
}

impl Logger {
    /// Defaults: file at DEBUG, stdout from INFO, stderr from WARNING, no file.
    pub fn builder(name: impl Into<String>) -> LoggerBuilder {
        LoggerBuilder {
            name: name.into(),
            path: None,
            file_level: Some(Level::Debug),
            stdout_level: Some(Level::Info),
            stderr_level: Some(Level::Warning),
            local_file: false,
            client: ClientConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        match self.sink.as_ref()? {
            Sink::Daemon { target, .. } => Some(target.path()),
            Sink::Local { path, .. } => Some(path.as_path()),
        }
    }

    pub fn format(&self, level: Level, msg: &str) -> String {
        self.format_at(Local::now().naive_local(), level, msg)
    }

    fn format_at(&self, at: NaiveDateTime, level: Level, msg: &str) -> String {
        format!("[{} {} {}] {}\n", at.format(TIMESTAMP_FORMAT), self.name, level, msg)
    }

    fn min_level(&self) -> Option<Level> {
        let file = self.sink.as_ref().and(self.file_level);
        [file, self.stdout_level, self.stderr_level]
            .into_iter()
            .flatten()
            .min()
    }

    fn to_file(&self, level: Level) -> bool {
        self.sink.is_some() && self.file_level.is_some_and(|min| level >= min)
    }

    fn terminal(&self, level: Level) -> Option<Terminal> {
        if self.stderr_level.is_some_and(|min| level >= min) {
            Some(Terminal::Stderr)
        } else if self.stdout_level.is_some_and(|min| level >= min) {
            Some(Terminal::Stdout)
        } else {
            None
        }
    }

    /// Emit one record. A daemon that is busy or gone surfaces as the
    /// matching `io::Error`; terminal output is still attempted.
    pub fn log(&self, level: Level, msg: &str) -> io::Result<()> {
        if self.min_level().map_or(true, |min| level < min) {
            return Ok(());
        }
        let line = self.format(level, msg);
        let file = if self.to_file(level) {
            self.write_file(line.as_bytes())
        } else {
            Ok(())
        };
        match self.terminal(level) {
            Some(Terminal::Stderr) => {
                let mut err = io::stderr().lock();
                err.write_all(line.as_bytes())?;
                err.flush()?;
            }
            Some(Terminal::Stdout) => {
                let mut out = io::stdout().lock();
                out.write_all(line.as_bytes())?;
                out.flush()?;
            }
            None => {}
        }
        file
    }

    fn write_file(&self, line: &[u8]) -> io::Result<()> {
        match &self.sink {
            Some(Sink::Local { file, .. }) => {
                let mut file = file.lock();
                file.write_all(line)?;
                file.flush()
            }
            // The handle is dropped: the verdict is not awaited.
            Some(Sink::Daemon { client, target }) => {
                client.submit_to(target, line, Durability::NoSync)?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn debug(&self, msg: &str) -> io::Result<()> {
        self.log(Level::Debug, msg)
    }

    pub fn info(&self, msg: &str) -> io::Result<()> {
        self.log(Level::Info, msg)
    }

    pub fn warning(&self, msg: &str) -> io::Result<()> {
        self.log(Level::Warning, msg)
    }

    pub fn error(&self, msg: &str) -> io::Result<()> {
        self.log(Level::Error, msg)
    }

    pub fn critical(&self, msg: &str) -> io::Result<()> {
        self.log(Level::Critical, msg)
    }

    /// ERROR record followed by the error and its source chain.
    pub fn exception(&self, msg: &str, err: &dyn StdError) -> io::Result<()> {
        let mut text = format!("{msg}\n{err}");
        let mut source = err.source();
        while let Some(cause) = source {
            text.push_str(&format!("\n  caused by: {cause}"));
            source = cause.source();
        }
        self.log(Level::Error, &text)
    }

    /// Wait for records already sent to the daemon, then disconnect.
    /// Idempotent.
    pub fn close(&mut self) -> Result<(), ClientError> {
        match self.sink.take() {
            Some(Sink::Daemon { client, target }) => {
                let timeout = client.config().request_timeout;
                client.close_target(target)?;
                client.close(timeout)
            }
            Some(Sink::Local { file, .. }) => Ok(file.into_inner().flush()?),
            None => Ok(()),
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(logger = %self.name, error = %err, "logger closed with unconfirmed records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rstest::rstest;
    use tempfile::TempDir;

    fn terminal_only(stdout: Option<Level>, stderr: Option<Level>) -> Logger {
        Logger::builder("app")
            .stdout_level(stdout)
            .stderr_level(stderr)
            .build()
            .unwrap()
    }

    #[test]
    fn line_format_has_millisecond_timestamp() {
        let logger = terminal_only(None, None);
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(7, 5, 3, 42)
            .unwrap();
        assert_eq!(
            logger.format_at(at, Level::Warning, "disk almost full"),
            "[2024-03-09 07:05:03.042 app WARNING] disk almost full\n"
        );
    }

    #[rstest]
    #[case(Level::Debug, None)]
    #[case(Level::Info, Some(Terminal::Stdout))]
    #[case(Level::Warning, Some(Terminal::Stderr))]
    #[case(Level::Critical, Some(Terminal::Stderr))]
    fn default_terminal_routing(#[case] level: Level, #[case] expected: Option<Terminal>) {
        let logger = terminal_only(Some(Level::Info), Some(Level::Warning));
        assert_eq!(logger.terminal(level), expected);
    }

    #[test]
    fn stdout_has_no_upper_bound_without_stderr() {
        let logger = terminal_only(Some(Level::Info), None);
        assert_eq!(logger.terminal(Level::Critical), Some(Terminal::Stdout));
    }

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("Critical".parse::<Level>().unwrap(), Level::Critical);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn local_file_mode_appends_at_file_level() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let mut logger = Logger::builder("app")
            .file(&path)
            .file_level(Some(Level::Info))
            .stdout_level(None)
            .stderr_level(None)
            .local_file(true)
            .build()
            .unwrap();
        assert_eq!(logger.path(), Some(path.as_path()));

        logger.debug("skipped").unwrap();
        logger.info("kept").unwrap();
        logger
            .exception("failed", &io::Error::new(io::ErrorKind::Other, "boom"))
            .unwrap();
        logger.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" app INFO] kept"));
        assert!(lines[1].ends_with(" app ERROR] failed"));
        assert_eq!(lines[2], "boom");
    }

    #[test]
    fn terminal_only_logger_has_no_path() {
        assert_eq!(terminal_only(Some(Level::Info), None).path(), None);
    }

    #[test]
    fn daemon_mode_without_daemon_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let result = Logger::builder("app")
            .file(dir.path().join("app.log"))
            .client_config(ClientConfig::new(dir.path().join("missing.sock")))
            .build();
        assert!(matches!(result, Err(ClientError::DaemonUnavailable { .. })));
    }
}
