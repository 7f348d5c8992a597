//! Peer and storage drivers.
//!
//! Each connected peer gets one task that drains the peer's outbox into its
//! transport and feeds whatever arrives into the sync manager. The storage
//! pseudo-peer gets a task that drains its outbox into [`Storage::store`].
//! Drivers sleep on a [`Notify`] that every node update pokes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use covalent_core::{KnownState, PeerId};
use covalent_store::Storage;
use covalent_sync::{PeerRole, SyncError, SyncMessage, Transport};

use crate::config::SyncConfig;
use crate::error::{NodeError, Result};
use crate::node::{LocalNode, NodeInner};

pub(crate) struct PeerHandle {
    pub(crate) notify: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerHandle {
    async fn stop(self, id: &PeerId) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(peer = %id, error = %e, "peer task failed");
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        let peers = self.peers.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        for handle in peers.values() {
            handle.cancel.cancel();
        }
    }
}

impl LocalNode {
    /// Connect a peer over `transport`. Server and storage peers are sent
    /// everything already available; clients only what they ask for.
    pub fn add_peer(&self, id: PeerId, role: PeerRole, transport: impl Transport + 'static) -> Result<()> {
        if role == PeerRole::Storage || id.is_storage() {
            return Err(NodeError::InvalidOperation("storage is attached when the node is created".into()));
        }
        let mut peers = self.inner.lock_peers();
        if peers.contains_key(&id) {
            return Err(NodeError::InvalidOperation(format!("peer {id} is already connected")));
        }
        {
            let mut guard = self.inner.lock_state();
            let state = &mut *guard;
            state.sync.add_peer(&state.registry, id.clone(), role);
        }

        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive_peer(
            Arc::downgrade(&self.inner),
            id.clone(),
            Box::new(transport),
            notify.clone(),
            cancel.clone(),
            self.inner.config.sync,
        ));
        debug!(peer = %id, ?role, "peer added");
        peers.insert(id, PeerHandle { notify, cancel, task });
        Ok(())
    }

    /// Disconnect a peer, flushing what is queued for it first.
    pub async fn close_peer(&self, id: &PeerId) -> Result<()> {
        if id.is_storage() {
            return Err(NodeError::InvalidOperation("storage is closed by shutdown".into()));
        }
        let handle = self
            .inner
            .lock_peers()
            .remove(id)
            .ok_or_else(|| SyncError::PeerNotConnected(id.clone()))?;
        handle.stop(id).await;
        Ok(())
    }

    /// Connected peers and their roles, storage excluded.
    pub fn peers(&self) -> Vec<(PeerId, PeerRole)> {
        let state = self.inner.lock_state();
        state
            .sync
            .peer_ids()
            .filter(|id| !id.is_storage())
            .filter_map(|id| state.sync.peer(id).map(|peer| (id.clone(), peer.role())))
            .collect()
    }

    /// Stop every driver, flushing outboxes and storage, then close storage.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<(PeerId, PeerHandle)> = self.inner.lock_peers().drain().collect();
        for (id, handle) in handles {
            handle.stop(&id).await;
        }
        if let Some(storage) = &self.inner.storage {
            storage.close().await?;
        }
        debug!(agent = %self.agent_id(), "node shut down");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer driver
// ─────────────────────────────────────────────────────────────────────────────

async fn drive_peer(
    node: Weak<NodeInner>,
    peer: PeerId,
    transport: Box<dyn Transport>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    config: SyncConfig,
) {
    loop {
        let Some(inner) = node.upgrade() else {
            break;
        };
        if let Err(e) = flush(&inner, &peer, transport.as_ref(), config.send_timeout).await {
            warn!(peer = %peer, error = %e, "send failed; disconnecting");
            break;
        }
        drop(inner);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!(peer = %peer, "peer driver cancelled");
                break;
            }
            incoming = transport.recv() => match incoming {
                Ok(Some(msg)) => {
                    let Some(inner) = node.upgrade() else {
                        break;
                    };
                    let handled = inner.update(|_, state, batch| {
                        state.sync.handle_message(&mut state.registry, &peer, msg, batch);
                        Ok(())
                    });
                    if let Err(e) = handled {
                        warn!(peer = %peer, error = %e, "failed to handle message");
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer, "peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "receive failed; disconnecting");
                    break;
                }
            },
            _ = notify.notified() => {}
        }
    }

    if let Some(inner) = node.upgrade() {
        match timeout(config.flush_timeout, flush(&inner, &peer, transport.as_ref(), config.send_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "final flush failed"),
            Err(_) => debug!(peer = %peer, "final flush timed out"),
        }
        forget_peer(&inner, &peer, &notify);
    }
    if let Err(e) = transport.close().await {
        debug!(peer = %peer, error = %e, "transport close failed");
    }
}

/// Send everything queued for `peer`.
async fn flush(inner: &NodeInner, peer: &PeerId, transport: &dyn Transport, send_timeout: Duration) -> Result<()> {
    loop {
        let next = inner.lock_state().sync.pop_outgoing(peer);
        let Some(msg) = next else {
            return Ok(());
        };
        timeout(send_timeout, transport.send(msg))
            .await
            .map_err(|_| NodeError::Timeout(format!("send to {peer}")))??;
    }
}

fn forget_peer(inner: &NodeInner, peer: &PeerId, notify: &Arc<Notify>) {
    {
        let mut peers = inner.lock_peers();
        // A peer re-added under the same id has its own notify.
        if peers.get(peer).is_some_and(|handle| Arc::ptr_eq(&handle.notify, notify)) {
            peers.remove(peer);
        }
    }
    let removed = inner.update(|_, state, _| {
        state.sync.remove_peer(&mut state.registry, peer);
        Ok(())
    });
    if let Err(e) = removed {
        warn!(peer = %peer, error = %e, "failed to remove peer");
    }
    debug!(peer = %peer, "peer removed");
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage driver
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn spawn_storage_driver(inner: &Arc<NodeInner>, storage: Arc<dyn Storage>) {
    let notify = Arc::new(Notify::new());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(drive_storage(
        Arc::downgrade(inner),
        storage,
        notify.clone(),
        cancel.clone(),
    ));
    inner
        .lock_peers()
        .insert(PeerId::storage(), PeerHandle { notify, cancel, task });
}

async fn drive_storage(node: Weak<NodeInner>, storage: Arc<dyn Storage>, notify: Arc<Notify>, cancel: CancellationToken) {
    let peer = PeerId::storage();
    loop {
        match node.upgrade() {
            Some(inner) => store_outgoing(&inner, storage.as_ref(), &peer).await,
            None => return,
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = notify.notified() => {}
        }
    }
    if let Some(inner) = node.upgrade() {
        store_outgoing(&inner, storage.as_ref(), &peer).await;
    }
    trace!("storage driver stopped");
}

/// Persist everything queued for the storage peer. A store the storage
/// refuses resets our view of it to what it actually holds.
async fn store_outgoing(inner: &NodeInner, storage: &dyn Storage, peer: &PeerId) {
    loop {
        let next = inner.lock_state().sync.pop_outgoing(peer);
        let Some(msg) = next else {
            return;
        };
        let SyncMessage::Content(content) = msg else {
            continue;
        };
        let id = content.id;
        let mut correct = |actual: &KnownState| {
            debug!(id = %id, "storage requested a correction");
            let state = inner.lock_state();
            state.registry.get(&id).and_then(|core| core.new_content_since(Some(actual)))
        };
        let stored = match storage.store(content, &mut correct).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(id = %id, error = %e, "store failed");
                false
            }
        };
        if stored {
            continue;
        }
        match storage.known_state(&id).await {
            Ok(actual) => inner.lock_state().sync.reset_known(peer, (*actual).clone()),
            Err(e) => warn!(id = %id, error = %e, "cannot read stored state after a failed store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::load::LoadOutcome;
    use covalent_core::AgentSecret;
    use covalent_perms::{Principal, Role};
    use covalent_sync::connected_pair;
    use serde_json::json;

    fn node() -> LocalNode {
        LocalNode::new(AgentSecret::generate(), NodeConfig::default(), None)
    }

    #[tokio::test]
    async fn test_client_loads_from_server() {
        let server = node();
        let client = node();
        let (to_client, to_server) = connected_pair();
        server.add_peer(PeerId::new("client"), PeerRole::Client, to_client).unwrap();
        client.add_peer(PeerId::new("server"), PeerRole::Server, to_server).unwrap();

        let group = server.create_group().unwrap();
        server
            .add_member(&group, Principal::Agent(client.agent_id()), Role::Writer)
            .unwrap();
        let map = server.create_map(&group).unwrap();
        server.map_set(&map, "greeting", json!("hi")).unwrap();

        assert_eq!(client.load(&map).await.unwrap(), LoadOutcome::Available);
        assert_eq!(client.map(&map).unwrap().to_json(), json!({"greeting": "hi"}));

        client.map_set(&map, "reply", json!("hello")).unwrap();
        client.wait_for_sync(&map).await.unwrap();
        assert_eq!(server.map(&map).unwrap().to_json(), json!({"greeting": "hi", "reply": "hello"}));
    }

    #[tokio::test]
    async fn test_duplicate_and_storage_peers_are_rejected() {
        let node = node();
        let (a, _b) = connected_pair();
        node.add_peer(PeerId::new("x"), PeerRole::Server, a).unwrap();
        let (c, _d) = connected_pair();
        assert!(node.add_peer(PeerId::new("x"), PeerRole::Server, c).is_err());
        let (e, _f) = connected_pair();
        assert!(node.add_peer(PeerId::new("s"), PeerRole::Storage, e).is_err());
    }

    #[tokio::test]
    async fn test_close_peer_removes_it() {
        let a = node();
        let b = node();
        let (ta, tb) = connected_pair();
        a.add_peer(PeerId::new("b"), PeerRole::Server, ta).unwrap();
        b.add_peer(PeerId::new("a"), PeerRole::Server, tb).unwrap();
        assert_eq!(a.peers().len(), 1);

        a.close_peer(&PeerId::new("b")).await.unwrap();
        assert!(a.peers().is_empty());
        assert!(a.close_peer(&PeerId::new("b")).await.is_err());
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
