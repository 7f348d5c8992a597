//! Error types for the node.

use covalent_core::{CoValueCoreError, CoValueId, CoValueType, CoreError};
use covalent_perms::PermsError;
use covalent_store::StoreError;
use covalent_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Encoding or crypto error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// A transaction could not be appended.
    #[error("log error: {0}")]
    CoValue(#[from] CoValueCoreError),

    /// Permission error.
    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The value is not available locally.
    #[error("{0} is unavailable")]
    Unavailable(CoValueId),

    /// The local agent lacks the role the operation needs.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The value is of a different kind than the operation expects.
    #[error("{id} is a {actual:?}, expected {expected:?}")]
    WrongType {
        id: CoValueId,
        expected: CoValueType,
        actual: CoValueType,
    },

    /// A field value does not match its schema.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    /// An operation did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
