//! Browser backend for the step engine.
//!
//! [`CdpClient`] speaks the Chrome DevTools Protocol; [`CdpPage`] wraps one
//! tab and implements the engine's `Locator` and `Actuator` capabilities.

pub mod cdp;
pub mod page;

pub use cdp::{CdpClient, TabInfo};
pub use page::CdpPage;
