//! Error types for the sync module.

use thiserror::Error;

use covalent_core::PeerId;

/// Errors that can occur while exchanging sync messages.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message could not be decoded or is malformed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
