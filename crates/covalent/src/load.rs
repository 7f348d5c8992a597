//! Loading values from storage and peers, and waiting for them to persist.

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use covalent_core::{CoValueId, PeerId, UpdateBatch};
use covalent_store::StoreError;
use covalent_sync::{PeerRole, SyncMessage};

use crate::error::{NodeError, Result};
use crate::node::{LocalNode, NodeState};

/// Options for [`LocalNode::load_with`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Make a single attempt regardless of the retry policy.
    pub skip_retry: bool,
    /// Abandon the load when cancelled.
    pub cancel: Option<CancellationToken>,
}

/// How a load ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Available,
    /// Storage and every server peer came back without the value.
    Unavailable,
    Cancelled,
}

pub(crate) enum Wait {
    Ready,
    TimedOut,
    Cancelled,
}

impl LocalNode {
    /// Load `id` from storage, then from server peers, retrying per the
    /// node's [`RetryPolicy`](crate::RetryPolicy).
    pub async fn load(&self, id: &CoValueId) -> Result<LoadOutcome> {
        self.load_with(id, LoadOptions::default()).await
    }

    pub async fn load_with(&self, id: &CoValueId, options: LoadOptions) -> Result<LoadOutcome> {
        let cancel = options.cancel.unwrap_or_default();
        let retry = self.inner.config.retry;
        let attempts = if options.skip_retry { 1 } else { retry.attempts() };

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Ok(LoadOutcome::Cancelled);
            }
            if self.is_available(id) {
                return Ok(LoadOutcome::Available);
            }
            if attempt > 0 {
                debug!(id = %id, attempt, "retrying load");
                self.inner.lock_state().storage_misses.remove(id);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(LoadOutcome::Cancelled),
                    _ = sleep(retry.retry_delay) => {}
                }
            }
            match self.load_once(id, &cancel).await? {
                LoadOutcome::Unavailable => continue,
                outcome => return Ok(outcome),
            }
        }
        Ok(LoadOutcome::Unavailable)
    }

    async fn load_once(&self, id: &CoValueId, cancel: &CancellationToken) -> Result<LoadOutcome> {
        self.load_from_storage(id).await?;
        if self.is_available(id) {
            return Ok(LoadOutcome::Available);
        }

        let servers = self.inner.update(|_, state, _| {
            let servers = state.sync.peers_with_role(PeerRole::Server);
            for server in &servers {
                state.sync.request_load(&mut state.registry, server, *id);
            }
            Ok(servers)
        })?;
        if servers.is_empty() {
            return Ok(LoadOutcome::Unavailable);
        }

        let deadline = Instant::now() + self.inner.config.load_timeout;
        let answered = |state: &NodeState| match state.registry.get(id) {
            Some(core) => core.is_available() || !servers.iter().any(|server| core.is_pending_in(server)),
            None => true,
        };
        match self.wait_until(cancel, deadline, answered).await {
            Wait::Cancelled => return Ok(LoadOutcome::Cancelled),
            Wait::TimedOut => {
                debug!(id = %id, "load timed out");
                self.inner.update(|_, state, _| {
                    if let Some(core) = state.registry.get_mut(id) {
                        for server in &servers {
                            if core.is_pending_in(server) {
                                core.mark_not_found_in_peer(server);
                            }
                        }
                    }
                    Ok(())
                })?;
            }
            Wait::Ready => {}
        }

        Ok(if self.is_available(id) {
            LoadOutcome::Available
        } else {
            LoadOutcome::Unavailable
        })
    }

    /// Feed whatever storage holds for `id` (dependencies first) through the
    /// sync manager as if the storage peer had sent it.
    async fn load_from_storage(&self, id: &CoValueId) -> Result<()> {
        let Some(storage) = self.inner.storage.clone() else {
            return Ok(());
        };
        let storage_peer = PeerId::storage();
        let skip = {
            let mut state = self.inner.lock_state();
            let skip = state.storage_misses.contains(id) || state.registry.is_available(id);
            if !skip {
                state.registry.get_or_insert_empty(*id).mark_pending(&storage_peer);
            }
            skip
        };
        if skip {
            return Ok(());
        }

        let pieces = storage.load_all(id).await?;
        self.inner.update(|_, state, batch| {
            match pieces {
                Some(pieces) => {
                    trace!(id = %id, pieces = pieces.len(), "loaded from storage");
                    for piece in pieces {
                        feed(state, &storage_peer, SyncMessage::Content(piece), batch);
                    }
                }
                None => {
                    state.storage_misses.insert(*id);
                }
            }
            feed(state, &storage_peer, SyncMessage::Done { id: *id }, batch);
            Ok(())
        })
    }

    /// Resolve once storage and every connected server peer have confirmed
    /// the current local state of `id`.
    pub async fn wait_for_sync(&self, id: &CoValueId) -> Result<()> {
        self.wait_for_sync_within(id, self.inner.config.wait_for_sync_timeout).await
    }

    pub async fn wait_for_sync_within(&self, id: &CoValueId, timeout: Duration) -> Result<()> {
        let target = self.known_state(id).ok_or(NodeError::Unavailable(*id))?;
        let deadline = Instant::now() + timeout;

        if let Some(storage) = &self.inner.storage {
            match storage.wait_for_sync(&target, timeout).await {
                Ok(()) => {}
                Err(StoreError::Timeout(_)) => {
                    return Err(NodeError::Timeout(format!("{id} was not stored in time")))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let servers = self.inner.lock_state().sync.peers_with_role(PeerRole::Server);
        let confirmed = |state: &NodeState| {
            servers.iter().all(|server| {
                state
                    .sync
                    .peer(server)
                    .map_or(true, |peer| peer.confirmed(id).is_some_and(|known| known.contains(&target)))
            })
        };
        match self.wait_until(&CancellationToken::new(), deadline, confirmed).await {
            Wait::Ready => Ok(()),
            Wait::TimedOut => Err(NodeError::Timeout(format!("{id} not confirmed by every server"))),
            Wait::Cancelled => Err(NodeError::Cancelled),
        }
    }

    /// Wait for every available value to be synced.
    pub async fn wait_for_all_to_sync(&self) -> Result<()> {
        let ids = self.inner.lock_state().registry.available_ids_in_dependency_order();
        for id in ids {
            self.wait_for_sync(&id).await?;
        }
        Ok(())
    }

    /// Re-check `ready` after every node update until it holds.
    pub(crate) async fn wait_until(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        mut ready: impl FnMut(&NodeState) -> bool,
    ) -> Wait {
        let mut updates = self.inner.updates.subscribe();
        loop {
            let done = {
                let state = self.inner.lock_state();
                ready(&state)
            };
            if done {
                return Wait::Ready;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Wait::Cancelled,
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Wait::TimedOut;
                    }
                }
                _ = sleep_until(deadline) => return Wait::TimedOut,
            }
        }
    }
}

fn feed(state: &mut NodeState, from: &PeerId, msg: SyncMessage, batch: &mut UpdateBatch) {
    state.sync.handle_message(&mut state.registry, from, msg, batch);
}
