//! # Covalent Core
//!
//! Verified CoValue logs: headers, hash-chained session logs, known states
//! and content messages.
//!
//! This crate does no I/O. It verifies and stores transactions in memory and
//! computes what another party is missing.
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] - Immutable header; its hash is the CoValue's id
//! - [`SessionLog`] - One agent session's hash-chained, signed log
//! - [`VerifiedState`] - Header plus verified session logs
//! - [`CoValueCore`] - A CoValue as held by a node, with loading state and subscribers
//! - [`KnownState`] - How much of a CoValue a party has
//! - [`NewContentMessage`] - A verifiable piece of content
//!
//! ## Encoding
//!
//! Identifiers and cryptographic values serialize as prefixed lowercase hex
//! strings (`co_…`, `signer_…`, `keySecret_…`). See [`crypto`] and [`ids`].

mod encoding;

pub mod batch;
pub mod co_value;
pub mod content_message;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod registry;
pub mod session_log;
pub mod transaction;
pub mod verified;

pub use batch::UpdateBatch;
pub use content_message::{NewContentMessage, Priority, SessionNewContent};
pub use co_value::{CoValueCore, Listener, LoadingState, PeerLoadState, Privacy, Unsubscribe};
pub use crypto::{
    AgentId, AgentSecret, Encrypted, Hash, KeyId, KeySecret, Sealed, SealerId, Signature, SignerId,
};
pub use error::{CoValueCoreError, CoreError};
pub use header::{now_millis, CoValueHeader, CoValueType, Ruleset};
pub use ids::{CoValueId, PeerId, SessionId, TransactionId};
pub use known_state::KnownState;
pub use registry::Registry;
pub use session_log::{SessionHead, SessionLog, MAX_RECOMMENDED_TX_SIZE};
pub use transaction::{parse_changes, PrivateTransaction, Transaction, TrustingTransaction};
pub use verified::{Checkpoint, VerifiedState};
