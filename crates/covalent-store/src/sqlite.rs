//! SQLite implementation of the Storage trait.
//!
//! This is the durable backend. It uses rusqlite with bundled SQLite. Reads
//! run under `spawn_blocking`. `store` stays on the caller's task because the
//! correction callback borrows from the caller.
//!
//! Recently stored values keep their [`VerifiedState`] in a bounded cache, so
//! a store appends to the held state and writes only the delta. A miss
//! replays the value from disk once.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::debug;

use covalent_core::{
    now_millis, CoValueHeader, CoValueId, KnownState, NewContentMessage, SessionId, Signature,
    Transaction, VerifiedState,
};

use crate::content::{dependency_order, store_with_correction};
use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::Storage;

/// Number of verified states kept between stores.
const STATE_CACHE_CAPACITY: usize = 256;

/// Verified states of recently stored values, least recently used first.
#[derive(Default)]
struct StateCache {
    states: HashMap<CoValueId, VerifiedState>,
    order: VecDeque<CoValueId>,
}

impl StateCache {
    fn get(&self, id: &CoValueId) -> Option<&VerifiedState> {
        self.states.get(id)
    }

    fn take(&mut self, id: &CoValueId) -> Option<VerifiedState> {
        let state = self.states.remove(id)?;
        self.order.retain(|cached| cached != id);
        Some(state)
    }

    fn put(&mut self, state: VerifiedState) {
        let id = state.id();
        self.order.retain(|cached| *cached != id);
        self.order.push_back(id);
        self.states.insert(id, state);
        while self.order.len() > STATE_CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.states.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.states.clear();
        self.order.clear();
    }
}

/// SQLite-based storage.
///
/// Thread-safe via internal Mutex. `close` drops the connection; later calls
/// fail with [`StoreError::Closed`]. Locks are taken connection first, then
/// the state cache.
pub struct SqliteStorage {
    /// The SQLite connection, protected by a mutex. `None` once closed.
    conn: Arc<Mutex<Option<Connection>>>,
    states: Arc<Mutex<StateCache>>,
    known: Mutex<HashMap<CoValueId, Arc<KnownState>>>,
    changes: watch::Sender<u64>,
}

impl SqliteStorage {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            states: Arc::new(Mutex::new(StateCache::default())),
            known: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Run a read on a blocking thread with the connection and state cache.
    async fn read_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &StateCache) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let states = self.states.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(poisoned)?;
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            let states = states.lock().unwrap_or_else(PoisonError::into_inner);
            f(conn, &states)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Execute a blocking operation that needs mutable access.
    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.conn.lock().map_err(poisoned)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    fn cached_known(&self, id: &CoValueId) -> Option<Arc<KnownState>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    fn cache_known(&self, known: Arc<KnownState>) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(known.id, known);
    }

    /// Cache a known state read from disk unless a store got there first.
    fn cache_read_known(&self, known: KnownState) -> Arc<KnownState> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(known.id)
            .or_insert_with(|| Arc::new(known))
            .clone()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
        Some(format!("mutex poisoned: {e}")),
    ))
}

fn serialization<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn encode_tx(tx: &Transaction) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(tx, &mut buf).map_err(serialization)?;
    Ok(buf)
}

fn decode_tx(bytes: &[u8]) -> Result<Transaction> {
    ciborium::from_reader(bytes).map_err(serialization)
}

/// Session heads without transactions: enough for a known state.
fn read_known_state(conn: &Connection, id: &CoValueId) -> Result<KnownState> {
    let key = id.to_string();
    let mut known = KnownState::empty(*id);
    known.header = conn
        .query_row("SELECT 1 FROM co_values WHERE id = ?1", params![key], |_| Ok(()))
        .optional()?
        .is_some();

    let mut stmt = conn.prepare_cached("SELECT session_id, tx_count FROM sessions WHERE co_value = ?1")?;
    let rows = stmt.query_map(params![key], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (session, count) = row?;
        known.sessions.insert(session.parse().map_err(serialization)?, count as u64);
    }
    Ok(known)
}

/// Rebuild the verified state of `id` by replaying its stored sessions.
///
/// Each session is replayed in chunks ending at its in-between signatures,
/// which re-verifies every signature and reproduces the same chunk layout.
fn read_state(conn: &Connection, id: &CoValueId) -> Result<Option<VerifiedState>> {
    let key = id.to_string();
    let header: Option<String> = conn
        .query_row("SELECT header FROM co_values WHERE id = ?1", params![key], |row| row.get(0))
        .optional()?;
    let Some(header) = header else {
        return Ok(None);
    };
    let header: CoValueHeader = serde_json::from_str(&header).map_err(serialization)?;
    let mut state = VerifiedState::new(header);

    let sessions: Vec<(String, String)> = conn
        .prepare_cached("SELECT session_id, last_signature FROM sessions WHERE co_value = ?1 ORDER BY session_id")?
        .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    for (session_key, last_signature) in sessions {
        let session: SessionId = session_key.parse().map_err(serialization)?;
        let last_signature: Signature = last_signature.parse().map_err(serialization)?;

        let transactions = conn
            .prepare_cached("SELECT tx FROM transactions WHERE co_value = ?1 AND session_id = ?2 ORDER BY idx")?
            .query_map(params![key, session_key], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .iter()
            .map(|bytes| decode_tx(bytes))
            .collect::<Result<Vec<_>>>()?;

        let signatures: Vec<(i64, String)> = conn
            .prepare_cached(
                "SELECT idx, signature FROM signature_after WHERE co_value = ?1 AND session_id = ?2 ORDER BY idx",
            )?
            .query_map(params![key, session_key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut start = 0usize;
        for (idx, signature) in signatures {
            let end = idx as usize + 1;
            if end <= start || end > transactions.len() {
                continue;
            }
            let signature: Signature = signature.parse().map_err(serialization)?;
            state.try_add_transactions(&session, transactions[start..end].to_vec(), None, &signature)?;
            start = end;
        }
        if start < transactions.len() {
            state.try_add_transactions(&session, transactions[start..].to_vec(), None, &last_signature)?;
        }
    }

    Ok(Some(state))
}

/// Write everything in `state` beyond `before`.
fn write_state(conn: &Connection, before: Option<&KnownState>, state: &VerifiedState) -> Result<()> {
    let key = state.id().to_string();

    if !before.map_or(false, |known| known.header) {
        let header = serde_json::to_string(state.header()).map_err(serialization)?;
        conn.execute(
            "INSERT OR IGNORE INTO co_values (id, header, stored_at) VALUES (?1, ?2, ?3)",
            params![key, header, now_millis() as i64],
        )?;
    }

    for (session, log) in state.sessions() {
        let held = before.map_or(0, |known| known.session_count(session)) as usize;
        let Some(last_signature) = log.last_signature() else {
            continue;
        };
        if log.len() <= held {
            continue;
        }
        let session_key = session.to_string();

        let mut insert_tx = conn.prepare_cached(
            "INSERT OR REPLACE INTO transactions (co_value, session_id, idx, tx) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (idx, tx) in log.transactions().iter().enumerate().skip(held) {
            insert_tx.execute(params![key, session_key, idx as i64, encode_tx(tx)?])?;
        }

        let mut insert_signature = conn.prepare_cached(
            "INSERT OR REPLACE INTO signature_after (co_value, session_id, idx, signature) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (idx, signature) in log.signatures_after().range(held..) {
            insert_signature.execute(params![key, session_key, *idx as i64, signature.to_string()])?;
        }

        conn.execute(
            "INSERT INTO sessions (co_value, session_id, tx_count, last_signature) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (co_value, session_id)
             DO UPDATE SET tx_count = excluded.tx_count, last_signature = excluded.last_signature",
            params![key, session_key, log.len() as i64, last_signature.to_string()],
        )?;
    }

    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn known_state(&self, id: &CoValueId) -> Result<Arc<KnownState>> {
        if let Some(known) = self.cached_known(id) {
            return Ok(known);
        }
        let key = *id;
        let known = self.read_blocking(move |conn, _| read_known_state(conn, &key)).await?;
        Ok(self.cache_read_known(known))
    }

    async fn load(
        &self,
        id: &CoValueId,
        on_content: &mut (dyn FnMut(NewContentMessage) + Send),
        on_done: &mut (dyn FnMut(bool) + Send),
    ) -> Result<()> {
        let root = *id;
        let pieces = self
            .read_blocking(move |conn, cache| {
                let mut read = HashMap::new();
                if cache.get(&root).is_none() {
                    let Some(state) = read_state(conn, &root)? else {
                        return Ok(None);
                    };
                    read.insert(root, state);
                }
                let order = dependency_order(root, |dep| {
                    if cache.get(dep).is_none() && !read.contains_key(dep) {
                        if let Some(state) = read_state(conn, dep)? {
                            read.insert(*dep, state);
                        }
                    }
                    Ok(cache.get(dep).or_else(|| read.get(dep)).map(VerifiedState::dependencies))
                })?;

                let mut pieces = Vec::new();
                for dep in order {
                    if let Some(state) = cache.get(&dep).or_else(|| read.get(&dep)) {
                        let priority = state.header().priority();
                        pieces.extend(state.new_content_since(None, priority).unwrap_or_default());
                    }
                }
                Ok(Some(pieces))
            })
            .await?;

        match pieces {
            Some(pieces) => {
                debug!(id = %id, pieces = pieces.len(), "loaded from sqlite");
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
        let id = msg.id;
        let changed = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut cache = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let mut state = match cache.take(&id) {
                Some(state) => Some(state),
                None => read_state(&tx, &id)?,
            };
            let before = state.as_ref().map(VerifiedState::known_state);

            let outcome = store_with_correction(&mut state, &msg, on_correction);
            let after = state.as_ref().map(VerifiedState::known_state);
            if !matches!(outcome, Ok(true)) || before == after {
                if let Some(state) = state {
                    cache.put(state);
                }
                return outcome.map(|stored| stored.then_some(None));
            }
            let (Some(state), Some(after)) = (state, after) else {
                return Ok(None);
            };

            // A failed write drops the state; the next store replays from disk.
            write_state(&tx, before.as_ref(), &state)?;
            tx.commit()?;
            cache.put(state);
            Ok(Some(Some(after)))
        })?;

        match changed {
            None => Ok(false),
            Some(None) => Ok(true),
            Some(Some(after)) => {
                self.cache_known(Arc::new(after));
                self.changes.send_modify(|version| *version += 1);
                Ok(true)
            }
        }
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
        let conn = self.conn.lock().map_err(poisoned)?.take();
        self.states.lock().unwrap_or_else(PoisonError::into_inner).clear();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StoreError::Database(e))?;
            debug!("sqlite storage closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, CoValueType, Priority};
    use serde_json::json;

    fn append(state: &mut VerifiedState, agent: &AgentSecret, session: &SessionId, value: serde_json::Value) {
        let txs = vec![Transaction::trusting(1, &[json!({"op": "set", "key": "k", "value": value})]).unwrap()];
        let hash = state.expected_new_hash(session, &txs);
        state.try_add_transactions(session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
    }

    async fn store_all(storage: &SqliteStorage, state: &VerifiedState) {
        for piece in state.new_content_since(None, Priority::Medium).unwrap() {
            assert!(storage.store(piece, &mut |_: &KnownState| None).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covalent.db");

        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, json!("a"));
        append(&mut state, &agent, &session, json!("b"));

        {
            let storage = SqliteStorage::open(&path).unwrap();
            store_all(&storage, &state).await;
            storage.close().await.unwrap();
            storage.close().await.unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(*storage.known_state(&state.id()).await.unwrap(), state.known_state());
        let pieces = storage.load_all(&state.id()).await.unwrap().unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].header.as_ref(), Some(state.header()));
        assert_eq!(pieces[0].new[&session].new_transactions, state.session(&session).unwrap().transactions());
    }

    #[tokio::test]
    async fn test_streamed_value_keeps_signature_layout() {
        let storage = SqliteStorage::open_memory().unwrap();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for _ in 0..200 {
            append(&mut state, &agent, &session, json!("x".repeat(1024)));
        }
        store_all(&storage, &state).await;

        let pieces = storage.load_all(&state.id()).await.unwrap().unwrap();
        let ends: Vec<u64> = pieces
            .iter()
            .map(|piece| piece.implied_known_state().session_count(&session))
            .collect();
        assert_eq!(ends, vec![97, 194, 200]);
    }

    #[tokio::test]
    async fn test_piecewise_stores_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covalent.db");
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for _ in 0..200 {
            append(&mut state, &agent, &session, json!("x".repeat(1024)));
        }
        let pieces = state.new_content_since(None, Priority::Medium).unwrap();

        {
            let storage = SqliteStorage::open(&path).unwrap();
            for piece in &pieces[..2] {
                assert!(storage.store(piece.clone(), &mut |_: &KnownState| None).await.unwrap());
            }
            assert_eq!(storage.known_state(&state.id()).await.unwrap().session_count(&session), 194);
            storage.close().await.unwrap();
        }

        // Nothing cached after reopening: the last piece appends to the
        // replayed state.
        let storage = SqliteStorage::open(&path).unwrap();
        assert!(storage.store(pieces[2].clone(), &mut |_: &KnownState| None).await.unwrap());
        assert_eq!(*storage.known_state(&state.id()).await.unwrap(), state.known_state());

        let before = state.known_state();
        append(&mut state, &agent, &session, json!("tail"));
        let tail = state.new_content_since(Some(&before), Priority::Medium).unwrap().remove(0);
        assert!(storage.store(tail, &mut |_: &KnownState| None).await.unwrap());
        storage.close().await.unwrap();

        let storage = SqliteStorage::open(&path).unwrap();
        let loaded = storage.load_all(&state.id()).await.unwrap().unwrap();
        let ends: Vec<u64> = loaded
            .iter()
            .map(|piece| piece.implied_known_state().session_count(&session))
            .collect();
        assert_eq!(ends, vec![97, 194, 201]);
    }

    #[tokio::test]
    async fn test_rejected_store_keeps_cached_state() {
        let storage = SqliteStorage::open_memory().unwrap();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, json!(1));
        store_all(&storage, &state).await;

        let held = state.known_state();
        append(&mut state, &agent, &session, json!(2));
        append(&mut state, &agent, &session, json!(3));
        let mut ahead = held.clone();
        ahead.sessions.insert(session.clone(), 2);
        let stale = state.new_content_since(Some(&ahead), Priority::Medium).unwrap().remove(0);
        let again = stale.clone();
        assert!(!storage.store(stale, &mut |_: &KnownState| Some(vec![again.clone()])).await.unwrap());
        assert_eq!(*storage.known_state(&state.id()).await.unwrap(), held);

        let fill = state.new_content_since(Some(&held), Priority::Medium).unwrap().remove(0);
        assert!(storage.store(fill, &mut |_: &KnownState| None).await.unwrap());
        assert_eq!(*storage.known_state(&state.id()).await.unwrap(), state.known_state());
    }

    #[test]
    fn test_state_cache_evicts_least_recent() {
        let mut cache = StateCache::default();
        let first = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        let first_id = first.id();
        cache.put(first);
        let mut ids = Vec::new();
        for _ in 0..STATE_CACHE_CAPACITY {
            let state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
            ids.push(state.id());
            cache.put(state);
        }
        assert!(cache.get(&first_id).is_none());
        assert_eq!(cache.states.len(), STATE_CACHE_CAPACITY);
        assert!(cache.take(&ids[0]).is_some());
        assert!(cache.get(&ids[0]).is_none());
    }

    #[tokio::test]
    async fn test_dependencies_load_first() {
        let storage = SqliteStorage::open_memory().unwrap();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());

        let group = VerifiedState::new(CoValueHeader::group(agent.id()));
        let mut map = VerifiedState::new(CoValueHeader::owned_by(CoValueType::Map, group.id(), None));
        append(&mut map, &agent, &session, json!(1));

        store_all(&storage, &map).await;
        store_all(&storage, &group).await;

        let ids: Vec<CoValueId> = storage
            .load_all(&map.id())
            .await
            .unwrap()
            .unwrap()
            .iter()
            .map(|piece| piece.id)
            .collect();
        assert_eq!(ids, vec![group.id(), map.id()]);
    }

    #[tokio::test]
    async fn test_rejected_store_writes_nothing() {
        let storage = SqliteStorage::open_memory().unwrap();
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        append(&mut state, &agent, &session, json!(1));
        append(&mut state, &agent, &session, json!(2));

        let mut partial = state.known_state();
        partial.sessions.insert(session.clone(), 1);
        let stale = state.new_content_since(Some(&partial), Priority::Medium).unwrap().remove(0);

        assert!(!storage.store(stale, &mut |_: &KnownState| None).await.unwrap());
        assert!(!storage.known_state(&state.id()).await.unwrap().header);
        assert!(storage.load_all(&state.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_storage_errors() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.load_all(&CoValueId([3; 20])).await,
            Err(StoreError::Closed)
        ));
    }
}
