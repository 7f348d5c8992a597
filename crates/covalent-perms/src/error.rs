//! Error types for the permission engine.

use thiserror::Error;

use covalent_core::{CoValueCoreError, CoValueId, CoreError, KeyId};

/// Errors that can occur while resolving roles and keys or editing groups.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The acting agent lacks the role required for the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A key could not be resolved from the revelations visible to the agent.
    #[error("key {key} unavailable in {group}")]
    KeyUnavailable { group: CoValueId, key: KeyId },

    /// The group has no current read key.
    #[error("group {0} has no read key")]
    NoReadKey(CoValueId),

    /// The CoValue is not a group or account.
    #[error("{0} is not a group")]
    NotAGroup(CoValueId),

    /// The group's header is not locally available.
    #[error("group {0} is not available")]
    GroupUnavailable(CoValueId),

    /// A role cannot be assigned in this position.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Extending would create a cycle or link a group to itself.
    #[error("invalid extension: {0}")]
    InvalidExtension(String),

    /// An invite string could not be parsed or has already been used.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// Crypto or encoding error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Log error while writing group changes.
    #[error(transparent)]
    CoValue(#[from] CoValueCoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
