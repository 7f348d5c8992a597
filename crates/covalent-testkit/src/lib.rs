//! # Covalent Testkit
//!
//! Testing utilities for Covalent.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Nodes with short timeouts, deterministic agents and
//!   helpers that wire nodes together over in-memory transports
//! - **Generators**: Proptest strategies for changes and map edits
//! - **Recording transport**: A [`Transport`](covalent_sync::Transport)
//!   wrapper that logs every message it sends
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use covalent_testkit::fixtures::{connect, test_node};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let server = test_node();
//!     let client = test_node();
//!     connect(&client, &server)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covalent_testkit::generators::map_ops;
//!
//! proptest! {
//!     #[test]
//!     fn replicas_converge(ops in map_ops(20)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod transport;

pub use fixtures::{
    agent, connect, connect_peers, eventually, init_tracing, multi_party_nodes, test_config, test_node,
    test_node_with_storage,
};
pub use generators::{change, changes, map_ops, MapOp};
pub use transport::{MessageLog, RecordingTransport};
