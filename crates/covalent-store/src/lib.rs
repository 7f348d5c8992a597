//! # Covalent Store
//!
//! Storage contract for Covalent. Provides a trait-based interface for
//! persisting verified CoValue content, with SQLite and in-memory
//! implementations.
//!
//! ## Overview
//!
//! A store keeps one verified state per CoValue and speaks the same CONTENT
//! messages as peers do. The node treats it as a pseudo-peer: content goes
//! in through [`Storage::store`] and comes back, dependencies first, through
//! [`Storage::load`].
//!
//! ## Key Types
//!
//! - [`Storage`] - The async trait for all storage operations
//! - [`SqliteStorage`] - SQLite-based persistent storage
//! - [`MemoryStorage`] - In-memory storage for tests
//! - [`Applied`] - Outcome of applying one content message
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalent_store::{SqliteStorage, Storage};
//! use covalent_core::CoValueId;
//!
//! async fn example(id: CoValueId) -> covalent_store::Result<()> {
//!     let storage = SqliteStorage::open("covalent.db")?;
//!     if let Some(pieces) = storage.load_all(&id).await? {
//!         println!("{} pieces", pieces.len());
//!     }
//!     storage.close().await
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Corrections**: content that assumes more than the store holds triggers
//!   one correction round through the caller's callback
//! - **All or nothing**: a failed store rolls the held state back to its
//!   checkpoint and leaves the known state untouched
//! - **Incremental stores**: a store appends to the verified state the
//!   backend already holds. SQLite replays a value from disk, re-verifying
//!   hashes and signatures, only when it is not in its state cache

mod content;

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use content::{apply_content, Applied};
pub use error::{Result, StoreError};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use traits::Storage;
