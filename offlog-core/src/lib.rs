//! offlog core library: domain types, wire protocol, errors.
//!
//! Public API surface:
//! - [`types`]: durability flags, target identifiers, outcomes, completion records
//! - [`wire`]: frame header and payload codecs shared by daemon and client
//! - [`error`]: [`ProtocolError`]

pub mod error;
pub mod types;
pub mod wire;

pub use error::ProtocolError;
pub use types::{CompletionRecord, Durability, Outcome, TargetId};
pub use wire::{Frame, MessageType};
