//! Client library for the offlog append daemon.
//!
//! - [`Client`]: one socket connection; `submit` returns an [`AppendHandle`]
//!   once the daemon has admitted the write
//! - [`ProxyFile`]: `std::io::Write` over a daemon-opened target
//! - [`Logger`]: leveled line logger writing its file records through the daemon

pub mod client;
pub mod error;
pub mod logger;
pub mod proxy_file;

pub use client::{AppendHandle, AppendOutcome, Client, ClientConfig, TargetHandle};
pub use error::{ClientError, SubmitError};
pub use logger::{Level, Logger};
pub use offlog_core::Durability;
pub use proxy_file::ProxyFile;
