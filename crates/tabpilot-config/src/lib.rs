//! # tabpilot-config
//!
//! Configuration for the tabpilot driver and relay. Reads from `tabpilot.toml`,
//! then environment variables, then CLI overrides, in that precedence order.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, DeviceConfig, EngineConfig, LoggingConfig, ReceiverConfig, RelayConfig,
    TabpilotConfig, WarningSeverity,
};
