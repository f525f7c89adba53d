//! # tabpilot-relay
//!
//! Chunked, acknowledged transfer of large text payloads over a single
//! reconnecting WebSocket, plus the hub that receives them.
//!
//! - [`RelayTransport`] is the sending side: content-derived ids, `begin_ack`
//!   handshake, dedup ledger, one resend on `missing_chunks`.
//! - [`Assembler`] and [`RelayHub`] are the receiving side.

pub mod assembler;
pub mod chunk;
pub mod hub;
pub mod ledger;
pub mod memory;
pub mod socket;
pub mod transport;

pub use assembler::{Assembler, AssemblerSettings, PendingWrite, Verdict};
pub use chunk::{Chunk, stable_id};
pub use hub::RelayHub;
pub use ledger::DedupLedger;
pub use memory::{MemoryConnector, MemoryPeer};
pub use socket::{Connector, Socket, WsConnector};
pub use transport::{
    RelaySettings, RelayTransport, SendStatus, TransferHandle, TransferOutcome, TransferState,
};
