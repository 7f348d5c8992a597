//! In-memory implementation of the Storage trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use covalent_core::{CoValueId, KnownState, NewContentMessage, VerifiedState};

use crate::content::{dependency_order, store_with_correction};
use crate::error::{Result, StoreError};
use crate::traits::Storage;

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStorage {
    inner: RwLock<MemoryStorageInner>,
    changes: watch::Sender<u64>,
    closed: AtomicBool,
}

#[derive(Default)]
struct MemoryStorageInner {
    values: HashMap<CoValueId, VerifiedState>,
    known: HashMap<CoValueId, Arc<KnownState>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: RwLock::new(MemoryStorageInner::default()),
            changes,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn known_state(&self, id: &CoValueId) -> Result<Arc<KnownState>> {
        self.ensure_open()?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(known) = inner.known.get(id) {
            return Ok(known.clone());
        }
        let known = Arc::new(
            inner
                .values
                .get(id)
                .map_or_else(|| KnownState::empty(*id), VerifiedState::known_state),
        );
        inner.known.insert(*id, known.clone());
        Ok(known)
    }

    async fn load(
        &self,
        id: &CoValueId,
        on_content: &mut (dyn FnMut(NewContentMessage) + Send),
        on_done: &mut (dyn FnMut(bool) + Send),
    ) -> Result<()> {
        self.ensure_open()?;
        let pieces = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if !inner.values.contains_key(id) {
                None
            } else {
                let order = dependency_order(*id, |dep| {
                    Ok(inner.values.get(dep).map(VerifiedState::dependencies))
                })?;
                let mut pieces = Vec::new();
                for dep in order {
                    if let Some(state) = inner.values.get(&dep) {
                        let priority = state.header().priority();
                        pieces.extend(state.new_content_since(None, priority).unwrap_or_default());
                    }
                }
                Some(pieces)
            }
        };

        match pieces {
            Some(pieces) => {
                debug!(id = %id, pieces = pieces.len(), "loaded from memory");
                for piece in pieces {
                    on_content(piece);
                }
                on_done(true);
            }
            None => on_done(false),
        }
        Ok(())
    }

    async fn store(
        &self,
        msg: NewContentMessage,
        on_correction: &mut (dyn for<'k> FnMut(&'k KnownState) -> Option<Vec<NewContentMessage>> + Send),
    ) -> Result<bool> {
        self.ensure_open()?;
        let id = msg.id;
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let mut state = inner.values.remove(&id);
            let before = state.as_ref().map(VerifiedState::known_state);
            let stored = store_with_correction(&mut state, &msg, on_correction);
            let after = state.as_ref().map(VerifiedState::known_state);
            if let Some(state) = state {
                inner.values.insert(id, state);
            }
            if !stored? {
                return Ok(false);
            }
            if before == after {
                return Ok(true);
            }
            if let Some(after) = after {
                inner.known.insert(id, Arc::new(after));
            }
        }
        self.changes.send_modify(|version| *version += 1);
        Ok(true)
    }

    async fn wait_for_sync(&self, target: &KnownState, timeout: Duration) -> Result<()> {
        let mut changes = self.changes.subscribe();
        let wait = async {
            loop {
                if self.known_state(&target.id).await?.contains(target) {
                    return Ok::<(), StoreError>(());
                }
                if changes.changed().await.is_err() {
                    return Err(StoreError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StoreError::Timeout(target.id))?
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, CoValueHeader, CoValueType, Priority, SessionId, Transaction};
    use serde_json::json;

    fn append(state: &mut VerifiedState, agent: &AgentSecret, session: &SessionId, made_at: u64) {
        let txs = vec![Transaction::trusting(made_at, &[json!({"op": "set", "key": "k", "value": made_at})]).unwrap()];
        let hash = state.expected_new_hash(session, &txs);
        state.try_add_transactions(session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
    }

    fn no_correction() -> impl FnMut(&KnownState) -> Option<Vec<NewContentMessage>> + Send {
        |_: &KnownState| None
    }

    async fn store_all(storage: &MemoryStorage, state: &VerifiedState) {
        for piece in state.new_content_since(None, Priority::Medium).unwrap() {
            assert!(storage.store(piece, &mut no_correction()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let storage = MemoryStorage::new();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, 1);
        store_all(&storage, &state).await;

        let pieces = storage.load_all(&state.id()).await.unwrap().unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].implied_known_state(), state.known_state());

        let missing = CoValueId([7; 20]);
        assert!(storage.load_all(&missing).await.unwrap().is_none());
        assert!(storage.known_state(&missing).await.unwrap().sessions.is_empty());
    }

    #[tokio::test]
    async fn test_known_state_identity_is_stable_until_mutated() {
        let storage = MemoryStorage::new();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, 1);
        store_all(&storage, &state).await;

        let first = storage.known_state(&state.id()).await.unwrap();
        let second = storage.known_state(&state.id()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Storing content that adds nothing keeps the cached instance.
        store_all(&storage, &state).await;
        assert!(Arc::ptr_eq(&first, &storage.known_state(&state.id()).await.unwrap()));

        let before = state.known_state();
        append(&mut state, &agent, &session, 2);
        let piece = state.new_content_since(Some(&before), Priority::Medium).unwrap().remove(0);
        assert!(storage.store(piece, &mut no_correction()).await.unwrap());
        let third = storage.known_state(&state.id()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(*third, state.known_state());
    }

    #[tokio::test]
    async fn test_failed_correction_leaves_state_unchanged() {
        let storage = MemoryStorage::new();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, 1);
        store_all(&storage, &state).await;
        let stored = storage.known_state(&state.id()).await.unwrap();

        let assumed = state.known_state();
        append(&mut state, &agent, &session, 2);
        append(&mut state, &agent, &session, 3);
        let mut ahead = assumed.clone();
        ahead.sessions.insert(session.clone(), 2);
        let stale = state.new_content_since(Some(&ahead), Priority::Medium).unwrap().remove(0);

        let again = stale.clone();
        let ok = storage
            .store(stale, &mut move |_: &KnownState| Some(vec![again.clone()]))
            .await
            .unwrap();
        assert!(!ok);
        assert!(Arc::ptr_eq(&stored, &storage.known_state(&state.id()).await.unwrap()));
    }

    #[tokio::test]
    async fn test_streamed_pieces_append_to_held_state() {
        let storage = MemoryStorage::new();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for i in 0..200 {
            let txs = vec![Transaction::trusting(i, &[json!({"op": "set", "key": "k", "value": "x".repeat(1024)})]).unwrap()];
            let hash = state.expected_new_hash(&session, &txs);
            state.try_add_transactions(&session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
        }

        let pieces = state.new_content_since(None, Priority::Medium).unwrap();
        assert_eq!(pieces.len(), 3);
        let mut seen = Vec::new();
        for piece in pieces {
            assert!(storage.store(piece, &mut no_correction()).await.unwrap());
            seen.push(storage.known_state(&state.id()).await.unwrap().session_count(&session));
        }
        assert_eq!(seen, vec![97, 194, 200]);

        let loaded = storage.load_all(&state.id()).await.unwrap().unwrap();
        let ends: Vec<u64> = loaded.iter().map(|p| p.implied_known_state().session_count(&session)).collect();
        assert_eq!(ends, vec![97, 194, 200]);
    }

    #[tokio::test]
    async fn test_wait_for_sync() {
        let storage = Arc::new(MemoryStorage::new());
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, 1);

        let target = state.known_state();
        let err = storage.wait_for_sync(&target, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));

        let waiter = {
            let storage = storage.clone();
            let target = target.clone();
            tokio::spawn(async move { storage.wait_for_sync(&target, Duration::from_secs(5)).await })
        };
        store_all(&storage, &state).await;
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.known_state(&CoValueId([1; 20])).await,
            Err(StoreError::Closed)
        ));
    }
}
