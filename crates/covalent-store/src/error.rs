//! Error types for the store module.

use thiserror::Error;

use covalent_core::{CoValueCoreError, CoValueId};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Header or transaction (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The message assumed more than the store holds.
    #[error("correction requested for {0}")]
    CorrectionRequested(CoValueId),

    /// Content sent after a correction still did not line up.
    #[error("double correction requested for {0}")]
    DoubleCorrectionRequested(CoValueId),

    /// The correction callback had nothing to resend.
    #[error("no correction available for {0}")]
    CorrectionUnavailable(CoValueId),

    /// Content failed hash or signature verification.
    #[error("invalid content: {0}")]
    InvalidContent(#[from] CoValueCoreError),

    /// `wait_for_sync` gave up.
    #[error("timed out waiting for {0} to be stored")]
    Timeout(CoValueId),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
