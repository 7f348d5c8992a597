//! # Covalent Sync
//!
//! Sync protocol for converging CoValue replicas between peers.
//!
//! ## Overview
//!
//! Peers exchange what they know (`load`, `known`) and what the other side
//! lacks (`content`). Each side keeps an optimistic view of what every peer
//! holds and only sends the difference. When that view turns out to be
//! wrong, the receiver answers with a correcting `known` and the sender
//! recomputes from the corrected state.
//!
//! ## Key Properties
//!
//! - **Dependencies first**: owner groups, parent groups and branch sources
//!   are queued before the values that need them
//! - **No duplicate transfer**: content already sent to a peer is not sent
//!   again, so shared groups travel once per peer pair
//! - **Isolated failures**: bad content marks one value errored for one peer;
//!   further content for that value from that peer is dropped until the
//!   peer is forgotten
//! - **Sans-IO**: [`SyncManager`] only queues messages; transports are driven
//!   by the caller
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!   |-------- load {id, sessions} ---->|
//!   |<------- content (owner group) ---|
//!   |<------- content {id, after..} ---|
//!   |-------- known (ack) ------------>|
//!   |-------- content (local edit) --->|
//!   |<------- known {isCorrection} ----|   server had less than assumed
//!   |-------- content (from actual) -->|
//! ```

pub mod error;
pub mod ingest;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod transport;

pub use error::{Result, SyncError};
pub use ingest::{ingest_content, IngestOutcome};
pub use manager::SyncManager;
pub use messages::{KnownMessage, SyncMessage};
pub use peer::{Outbox, PeerRole, PeerState};
pub use transport::{memory::connected_pair, memory::MemoryTransport, Transport};
