//! Transport abstraction for the sync protocol.
//!
//! A transport is one bidirectional, ordered message channel to a single
//! peer. Implementations may use WebSockets or any other framing; the
//! in-memory pair below is used by tests and by nodes in the same process.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::SyncMessage;

/// Transport trait for sending and receiving sync messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the peer.
    async fn send(&self, message: SyncMessage) -> Result<()>;

    /// Receive the next message. `Ok(None)` once the peer has closed.
    async fn recv(&self) -> Result<Option<SyncMessage>>;

    /// Close the sending half. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate message passing between two nodes.
pub mod memory {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::error::SyncError;

    /// Messages buffered per direction before `send` waits.
    pub const CHANNEL_CAPACITY: usize = 1000;

    /// One end of an in-memory connection.
    pub struct MemoryTransport {
        sender: Mutex<Option<mpsc::Sender<SyncMessage>>>,
        receiver: tokio::sync::Mutex<mpsc::Receiver<SyncMessage>>,
    }

    /// Two transports wired to each other.
    pub fn connected_pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (MemoryTransport::new(a_tx, a_rx), MemoryTransport::new(b_tx, b_rx))
    }

    impl MemoryTransport {
        fn new(sender: mpsc::Sender<SyncMessage>, receiver: mpsc::Receiver<SyncMessage>) -> Self {
            Self {
                sender: Mutex::new(Some(sender)),
                receiver: tokio::sync::Mutex::new(receiver),
            }
        }

        fn sender(&self) -> Option<mpsc::Sender<SyncMessage>> {
            self.sender
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, message: SyncMessage) -> Result<()> {
            let sender = self.sender().ok_or(SyncError::Closed)?;
            sender
                .send(message)
                .await
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<Option<SyncMessage>> {
            Ok(self.receiver.lock().await.recv().await)
        }

        async fn close(&self) -> Result<()> {
            self.sender
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            Ok(())
        }
    }
}
