//! # Covalent Permissions
//!
//! Groups, roles and read keys, computed from the logs themselves.
//!
//! ## Overview
//!
//! A group is a CoValue whose valid transactions form an access-control map.
//! Nothing here is stored separately: every query replays the group's log
//! (see [`GroupState`]) and resolves inheritance and keys through the
//! registry (see [`Engine`]).
//!
//! ## Key Concepts
//!
//! - **Role**: what a principal may do (`admin`, `writer`, `reader`,
//!   `writeOnly`, invite roles, `revoked`)
//! - **Extension**: a group may inherit members from parent groups
//! - **Read key**: symmetric key for private transactions, rotated on removal
//! - **Revelation**: a copy of a key sealed to an agent, in plaintext for
//!   everyone, or encrypted with another key
//!
//! ## Failure model
//!
//! Unauthorized writes are not errors. They stay in the log and are left out
//! of [`Engine::valid_transactions`]. A missing key makes single transactions
//! unavailable rather than failing the whole value.

pub mod editor;
pub mod engine;
pub mod error;
pub mod fields;
pub mod group;
pub mod invite;
pub mod role;

pub use editor::{Extension, Rotation};
pub use engine::{DecryptedTransaction, Engine, MissingRevelations, UnavailableTransaction, ValidTransactions};
pub use error::{PermsError, Result};
pub use fields::{GroupField, ParentLink, Principal, RevealedTo, EVERYONE, ME, READ_KEY};
pub use group::{GroupEntry, GroupState};
pub use invite::Invite;
pub use role::Role;
