//! Target files: identity, opening, and error classification.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use serde::Serialize;

/// Mode for files the daemon creates.
pub const TARGET_FILE_MODE: u32 = 0o644;

/// Identity of a target file. Two paths name the same target only when they
/// reach the same inode on the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TargetKey {
    pub dev: u64,
    pub ino: u64,
}

impl TargetKey {
    pub fn of_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// The write surface an Append Worker needs from its descriptor.
pub trait TargetFile: Send + Sync + 'static {
    /// One `write(2)`; may be short.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Flush written data and metadata to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl TargetFile for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Open (creating if needed) a file for appending. The daemon never seeks.
pub fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(TARGET_FILE_MODE)
        .open(path)
}

/// Open a target and report its key from the descriptor itself, so a rename
/// between `stat` and `open` cannot mislabel it.
pub fn open_target(path: &Path) -> io::Result<(File, TargetKey)> {
    let file = open_append(path)?;
    let key = TargetKey::of_metadata(&file.metadata()?);
    Ok((file, key))
}

/// Key of whatever currently lives at `path`.
pub fn stat_key(path: &Path) -> io::Result<TargetKey> {
    std::fs::metadata(path).map(|meta| TargetKey::of_metadata(&meta))
}

/// Reason string reported to clients when a target cannot be opened.
pub fn open_failure_reason(err: &io::Error) -> String {
    format!("{:?}: {}", err.kind(), err)
}

/// How an I/O failure on a target should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry; on exhaustion fail only the request in hand.
    Transient,
    /// Retry; on exhaustion the target is closed.
    Exhaustion,
    /// Close the target immediately.
    Fatal,
}

pub fn classify(err: &io::Error) -> ErrorClass {
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::ENOSPC | libc::EDQUOT => return ErrorClass::Exhaustion,
            libc::EBADF | libc::EROFS | libc::EIO | libc::EFBIG | libc::EACCES | libc::EPERM => {
                return ErrorClass::Fatal
            }
            _ => {}
        }
    }
    match err.kind() {
        ErrorKind::PermissionDenied => ErrorClass::Fatal,
        _ => ErrorClass::Transient,
    }
}
