//! Error types for core operations.

use thiserror::Error;

use crate::crypto::Hash;
use crate::ids::{CoValueId, SessionId};

/// Errors from encoding, parsing and cryptographic primitives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A string did not have the expected prefix or hex body.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Public key bytes are not a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// Symmetric or sealed encryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Decryption failed (wrong key, wrong nonce material or tampered data).
    #[error("decryption error: {0}")]
    Decryption(String),

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors raised while appending to or constructing a [`CoValueCore`](crate::CoValueCore).
///
/// Cloneable so the same error can be recorded as a per-peer state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoValueCoreError {
    /// The submitted hash disagrees with the recomputed streaming hash.
    #[error("invalid hash in session {session}: expected {expected}, computed {actual}")]
    InvalidHash {
        session: SessionId,
        expected: Hash,
        actual: Hash,
    },

    /// The signature does not verify against the session agent's signer.
    #[error("invalid signature in session {session}")]
    InvalidSignature { session: SessionId },

    /// Transactions arrived before the header was known.
    #[error("tried to add transactions to {0} without verified state")]
    TriedToAddTransactionsWithoutVerifiedState(CoValueId),

    /// A header was provided whose id does not match the CoValue.
    #[error("header does not hash to {expected}, got {actual}")]
    HeaderMismatch { expected: CoValueId, actual: CoValueId },

    /// A local agent tried to write into a session owned by another agent.
    #[error("session {0} does not belong to the signing agent")]
    SessionAgentMismatch(SessionId),

    /// Changes could not be encoded or encrypted.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
