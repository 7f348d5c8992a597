//! # Covalent
//!
//! A local-first collaborative data engine: signed, hash-chained values that
//! replicate between peers and enforce their own permissions.
//!
//! ## Overview
//!
//! A [`LocalNode`] holds one agent's replica of every CoValue it has
//! touched. It provides:
//!
//! - **CoValues**: Maps, lists, streams and binary streams built from
//!   per-session transaction logs
//! - **Groups**: Membership, roles and read-key rotation, expressed as
//!   transactions in a group value
//! - **Sync**: Known-state exchange with peers over any [`sync::Transport`],
//!   with correction when a peer's view turns out to be wrong
//! - **Storage**: An optional [`store::Storage`] consulted before peers
//!   and written to after every change
//!
//! ## Key Concepts
//!
//! - **Session**: One writer's append-only log. Each transaction is signed
//!   over the chained hash of everything before it.
//! - **Group**: Decides who may read and write the values it owns.
//! - **Known state**: Per-session transaction counts; peers only ever send
//!   what the other side lacks.
//! - **Branch**: A fork of a value that can be merged back into its source.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalent::{LocalNode, NodeConfig};
//! use covalent::core::AgentSecret;
//! use serde_json::json;
//!
//! async fn example() -> covalent::Result<()> {
//!     let node = LocalNode::new(AgentSecret::generate(), NodeConfig::default(), None);
//!
//!     let group = node.create_group()?;
//!     let map = node.create_map(&group)?;
//!     node.map_set(&map, "title", json!("notes"))?;
//!
//!     assert_eq!(node.map(&map)?.to_json(), json!({"title": "notes"}));
//!     node.shutdown().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `covalent::core` - Identifiers, headers, hash-chained sessions, crypto
//! - `covalent::perms` - Groups, roles, keys and invites
//! - `covalent::store` - Storage contract, memory and SQLite backends
//! - `covalent::sync` - Sync messages, peer state and transports

mod branches;
pub mod config;
pub mod content;
pub mod error;
pub mod load;
mod membership;
mod node;
mod peer;
pub mod subscription;

// Re-export component crates
pub use covalent_core as core;
pub use covalent_perms as perms;
pub use covalent_store as store;
pub use covalent_sync as sync;

// Re-export main types for convenience
pub use config::{NodeConfig, RetryPolicy, SyncConfig};
pub use content::{
    BinaryInfo, BinaryStream, CoList, CoMap, CoStream, Content, FieldKind, FieldSpec, OpId,
    SchemaDescriptor, TypedMap,
};
pub use error::{NodeError, Result};
pub use load::{LoadOptions, LoadOutcome};
pub use node::{LocalNode, BINARY_CHUNK_BYTES};
pub use subscription::{AutoloadState, AutoloadSubscription, Subscription};

// Re-export commonly used component types
pub use covalent_core::{AgentId, AgentSecret, CoValueId, CoValueType, PeerId, SessionId};
pub use covalent_perms::{Invite, ParentLink, Principal, Role};
pub use covalent_sync::PeerRole;
