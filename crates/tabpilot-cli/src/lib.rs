//! # tabpilot-cli
//!
//! Command-line interface for the tabpilot driver.
//!
//! ## Commands
//!
//! - `tabpilot agent`: Connect to the relay and run flows on command
//! - `tabpilot run`: Run one flow once against the matching tab
//! - `tabpilot send`: Relay a file through the chunked transport
//! - `tabpilot serve`: Run the relay hub (receiver + command console)
//! - `tabpilot config`: Show the effective configuration

pub mod commands;
pub mod console;

pub use commands::Cli;
