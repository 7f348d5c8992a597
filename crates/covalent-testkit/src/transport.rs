//! A transport wrapper that records what it sends.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use covalent_core::CoValueId;
use covalent_sync::{Result, SyncMessage, Transport};

/// Messages sent through a [`RecordingTransport`], in order.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    sent: Arc<Mutex<Vec<SyncMessage>>>,
}

impl MessageLog {
    fn push(&self, msg: SyncMessage) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(msg);
    }

    pub fn messages(&self) -> Vec<SyncMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ids of content messages, in send order, with repeats.
    pub fn content_ids(&self) -> Vec<CoValueId> {
        self.messages()
            .iter()
            .filter(|msg| msg.is_content())
            .map(SyncMessage::id)
            .collect()
    }

    /// Transactions sent for `id` across all content messages.
    pub fn transactions_sent(&self, id: &CoValueId) -> usize {
        self.messages()
            .iter()
            .filter_map(|msg| match msg {
                SyncMessage::Content(content) if content.id == *id => Some(content.transaction_count()),
                _ => None,
            })
            .sum()
    }

    /// Content messages sent for `id`.
    pub fn content_pieces(&self, id: &CoValueId) -> usize {
        self.messages()
            .iter()
            .filter(|msg| msg.is_content() && msg.id() == *id)
            .count()
    }
}

/// Wraps a transport and logs every message sent through it.
pub struct RecordingTransport<T> {
    inner: T,
    log: MessageLog,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T) -> (Self, MessageLog) {
        let log = MessageLog::default();
        (Self { inner, log: log.clone() }, log)
    }
}

#[async_trait]
impl<T: Transport> Transport for RecordingTransport<T> {
    async fn send(&self, message: SyncMessage) -> Result<()> {
        self.log.push(message.clone());
        self.inner.send(message).await
    }

    async fn recv(&self) -> Result<Option<SyncMessage>> {
        self.inner.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_sync::connected_pair;

    #[tokio::test]
    async fn test_records_sent_messages() {
        let (a, b) = connected_pair();
        let (a, log) = RecordingTransport::new(a);
        let id = CoValueId([7; 20]);

        a.send(SyncMessage::Done { id }).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(SyncMessage::Done { id }));
        assert_eq!(log.messages(), vec![SyncMessage::Done { id }]);
        assert!(log.content_ids().is_empty());
        assert_eq!(log.transactions_sent(&id), 0);
    }
}
