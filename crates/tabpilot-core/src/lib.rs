//! # tabpilot-core
//!
//! Shared vocabulary for the tabpilot workspace: the error type, the relay
//! wire frames, and the command/result pair that crosses the driver boundary.

pub mod command;
pub mod error;
pub mod protocol;

pub use command::{Command, CommandResult};
pub use error::{PilotError, Result};
pub use protocol::{CHUNK_ENCODING, Frame, Inbound, Reply, TransferMeta};
