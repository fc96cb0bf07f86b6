//! offlog daemon: accepts append requests over a Unix socket and performs
//! the writes on behalf of latency-sensitive clients.

pub mod backpressure;
pub mod config;
mod connection;
mod error;
pub mod log_rotation;
pub mod paths;
pub mod registry;
pub mod retry;
mod runtime;
pub mod target;
pub mod worker;

pub use config::{DaemonConfig, LogFormat};
pub use connection::{CompletionSink, Outbound};
pub use error::DaemonError;
pub use runtime::{start_blocking, Daemon, ShutdownHandle};
