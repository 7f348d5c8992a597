//! The LocalNode: one agent's replica of every CoValue it has touched.
//!
//! The node owns an arena [`Registry`], the sans-IO [`SyncManager`] and the
//! drivers that move messages between them and the outside world. All state
//! sits behind one mutex that is never held across an await; drivers are
//! woken after every mutation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use covalent_core::{
    now_millis, AgentId, AgentSecret, CoValueHeader, CoValueId, CoValueType, KnownState,
    LoadingState, PeerId, Privacy, Registry, Ruleset, SessionId, TransactionId, UpdateBatch,
};
use covalent_perms::{editor, Engine, Principal, Role, ValidTransactions};
use covalent_store::Storage;
use covalent_sync::{PeerRole, SyncManager};

use crate::config::NodeConfig;
use crate::content::list::{append_op, delete_op, prepend_op};
use crate::content::map::{del_op, set_op};
use crate::content::schema::SCHEMA_META_KEY;
use crate::content::stream::{binary_chunk, binary_end, binary_start, push_op};
use crate::content::{
    BinaryStream, CoList, CoMap, CoStream, Content, OpId, SchemaDescriptor, SchemaRegistry, TypedMap,
};
use crate::error::{NodeError, Result};
use crate::peer::PeerHandle;

/// Bytes of payload per binary stream chunk.
pub const BINARY_CHUNK_BYTES: usize = 64 * 1024;

/// Mutable node state. Guarded by [`NodeInner::lock_state`].
#[derive(Default)]
pub(crate) struct NodeState {
    pub(crate) registry: Registry,
    pub(crate) sync: SyncManager,
    /// Ids storage did not have; skipped until a retry clears them.
    pub(crate) storage_misses: HashSet<CoValueId>,
    /// Groups whose revelations to a parent key could not be written yet.
    pub(crate) pending_heals: HashSet<CoValueId>,
    /// Sessions used for writes to branches, one per branch.
    branch_sessions: HashMap<CoValueId, SessionId>,
    last_made_at: u64,
}

impl NodeState {
    /// A timestamp after every earlier local write and not before `floor`.
    pub(crate) fn next_made_at(&mut self, floor: u64) -> u64 {
        let made_at = now_millis().max(self.last_made_at + 1).max(floor);
        self.last_made_at = made_at;
        made_at
    }
}

pub(crate) struct NodeInner {
    pub(crate) agent: AgentSecret,
    pub(crate) session: SessionId,
    pub(crate) config: NodeConfig,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    state: Mutex<NodeState>,
    pub(crate) peers: Mutex<HashMap<PeerId, PeerHandle>>,
    pub(crate) updates: watch::Sender<u64>,
    schemas: RwLock<SchemaRegistry>,
}

/// A local node. Cheap to clone; clones share the same replica.
#[derive(Clone)]
pub struct LocalNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("agent", &self.inner.agent.id())
            .field("session", &self.inner.session)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal state access
// ─────────────────────────────────────────────────────────────────────────────

impl NodeInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_peers(&self) -> MutexGuard<'_, HashMap<PeerId, PeerHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the state, then heal affected groups, notify
    /// subscribers once per touched value and wake the drivers.
    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&Self, &mut NodeState, &mut UpdateBatch) -> Result<R>,
    ) -> Result<R> {
        let result = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let mut batch = UpdateBatch::new();
            let result = f(self, state, &mut batch);
            let changed: Vec<CoValueId> = batch.ids().copied().collect();
            self.maintain_groups(state, &changed, &mut batch);
            batch.close(&state.registry);
            result
        };
        self.wake();
        result
    }

    /// Wake every driver and every waiter.
    pub(crate) fn wake(&self) {
        for handle in self.lock_peers().values() {
            handle.notify.notify_one();
        }
        self.updates.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub(crate) fn available_header(state: &NodeState, id: &CoValueId) -> Result<CoValueHeader> {
        state
            .registry
            .get(id)
            .and_then(|core| core.header())
            .cloned()
            .ok_or(NodeError::Unavailable(*id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writing
    // ─────────────────────────────────────────────────────────────────────────

    /// Write group changes, one transaction each, as `writer` (the node's own
    /// agent by default).
    pub(crate) fn write_group_changes(
        &self,
        state: &mut NodeState,
        batch: &mut UpdateBatch,
        group: &CoValueId,
        changes: Vec<Value>,
        writer: Option<(&AgentSecret, &SessionId)>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let (agent, session) = writer.unwrap_or((&self.agent, &self.session));
        for change in changes {
            let floor = state.registry.get(group).map_or(0, latest_made_at) + 1;
            let made_at = state.next_made_at(floor);
            let core = state.registry.get_mut(group).ok_or(NodeError::Unavailable(*group))?;
            core.make_transaction(&[change], Privacy::Trusting, agent, session, made_at, batch)?;
        }
        batch.mark_with_dependents(*group, &state.registry);
        state.sync.sync_value(&state.registry, *group);
        Ok(())
    }

    /// Write content changes to a map, list or stream as one transaction.
    ///
    /// Group-owned values are encrypted with the writer's write key; writers
    /// without a writing role are refused before anything is appended.
    pub(crate) fn write_content(
        &self,
        state: &mut NodeState,
        batch: &mut UpdateBatch,
        id: &CoValueId,
        changes: Vec<Value>,
    ) -> Result<TransactionId> {
        let header = Self::available_header(state, id)?;
        let key = match &header.ruleset {
            Ruleset::OwnedByGroup { group } => {
                let engine = Engine::new(&state.registry);
                let role = engine.role_of(group, &Principal::Agent(self.agent.id()), None);
                if !role.is_some_and(|role| role.can_write()) {
                    return Err(NodeError::Unauthorized(format!(
                        "{} cannot write to {id}",
                        self.agent.id()
                    )));
                }
                Some(engine.write_key(group, &self.agent)?)
            }
            Ruleset::UnsafeAllowAll => None,
            Ruleset::Group { .. } => {
                return Err(NodeError::InvalidOperation(format!(
                    "{id} is a group; use the membership operations"
                )))
            }
        };

        // A branch shares op ids with its source; its own writes need a
        // session the source never used.
        let session = if header.branch_source().is_some() {
            state
                .branch_sessions
                .entry(*id)
                .or_insert_with(|| SessionId::new_random(self.agent.id()))
                .clone()
        } else {
            self.session.clone()
        };
        let made_at = state.next_made_at(0);
        let privacy = match &key {
            Some((key_id, key)) => Privacy::Private { key_id: *key_id, key },
            None => Privacy::Trusting,
        };
        let core = state.registry.get_mut(id).ok_or(NodeError::Unavailable(*id))?;
        let tx_id = core.make_transaction(&changes, privacy, &self.agent, &session, made_at, batch)?;
        state.sync.sync_value(&state.registry, *id);
        Ok(tx_id)
    }

    pub(crate) fn insert_value(&self, state: &mut NodeState, header: CoValueHeader) -> CoValueId {
        let id = header.id();
        state.registry.insert_header(header);
        state.sync.sync_value(&state.registry, id);
        id
    }

    pub(crate) fn require_writer(&self, state: &NodeState, group: &CoValueId) -> Result<()> {
        let engine = Engine::new(&state.registry);
        engine.require_group(group)?;
        let role = engine.role_of(group, &Principal::Agent(self.agent.id()), None);
        if role.is_some_and(|role| role.can_write()) {
            Ok(())
        } else {
            Err(NodeError::Unauthorized(format!(
                "{} cannot create values in {group}",
                self.agent.id()
            )))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Valid transactions of `id` decoded for this node's agent. A branch
    /// also sees its source's transactions up to the fork point.
    pub(crate) fn valid_transactions_in(&self, state: &NodeState, id: &CoValueId) -> Result<ValidTransactions> {
        let header = Self::available_header(state, id)?;
        let engine = Engine::new(&state.registry);
        let mut txs = engine.valid_transactions(id, &self.agent);

        if let (Some(source), Some(forked_at)) = (header.branch_source(), header.branch_forked_at()) {
            let before_fork = |tx_id: &TransactionId| {
                tx_id.tx_index < forked_at.get(&tx_id.session_id).copied().unwrap_or(0)
            };
            let base = engine.valid_transactions(&source, &self.agent);
            txs.transactions
                .extend(base.transactions.into_iter().filter(|tx| before_fork(&tx.tx_id)));
            txs.unavailable
                .extend(base.unavailable.into_iter().filter(|tx| before_fork(&tx.tx_id)));
            txs.transactions
                .sort_by(|a, b| (a.made_at, &a.tx_id).cmp(&(b.made_at, &b.tx_id)));
        }
        Ok(txs)
    }

    pub(crate) fn content_in(&self, state: &NodeState, id: &CoValueId) -> Result<Content> {
        let header = Self::available_header(state, id)?;
        let txs = self.valid_transactions_in(state, id)?;
        Ok(Content::project(*id, header.kind, &txs))
    }

    fn expect_kind(state: &NodeState, id: &CoValueId, expected: CoValueType) -> Result<CoValueHeader> {
        let header = Self::available_header(state, id)?;
        if header.kind != expected {
            return Err(NodeError::WrongType {
                id: *id,
                expected,
                actual: header.kind,
            });
        }
        Ok(header)
    }

    fn list_in(&self, state: &NodeState, id: &CoValueId) -> Result<CoList> {
        Self::expect_kind(state, id, CoValueType::List)?;
        Ok(CoList::from_transactions(*id, &self.valid_transactions_in(state, id)?))
    }

    fn schema_for(&self, header: &CoValueHeader) -> Option<Arc<SchemaDescriptor>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .for_header(header)
    }
}

/// Latest `made_at` in a value's log.
pub(crate) fn latest_made_at(core: &covalent_core::CoValueCore) -> u64 {
    core.verified()
        .and_then(|verified| verified.transactions().map(|(_, tx)| tx.made_at()).max())
        .unwrap_or(0)
}

impl LocalNode {
    /// Create a node for `agent`. With `storage`, a storage driver task is
    /// spawned, so this must be called from within a Tokio runtime.
    pub fn new(agent: AgentSecret, config: NodeConfig, storage: Option<Arc<dyn Storage>>) -> Self {
        let session = SessionId::new_random(agent.id());
        let mut state = NodeState::default();
        if storage.is_some() {
            state.sync.add_peer(&state.registry, PeerId::storage(), PeerRole::Storage);
        }
        let (updates, _) = watch::channel(0);
        let inner = Arc::new(NodeInner {
            agent,
            session,
            config,
            storage,
            state: Mutex::new(state),
            peers: Mutex::new(HashMap::new()),
            updates,
            schemas: RwLock::new(SchemaRegistry::new()),
        });
        if let Some(storage) = inner.storage.clone() {
            crate::peer::spawn_storage_driver(&inner, storage);
        }
        debug!(agent = %inner.agent.id(), session = %inner.session, "node started");
        Self { inner }
    }

    pub fn agent_id(&self) -> AgentId {
        self.inner.agent.id()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Register a schema for [`LocalNode::create_map_with_schema`] and [`LocalNode::typed_map`].
    pub fn register_schema(&self, schema: SchemaDescriptor) {
        self.inner
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(schema);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating values
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group administered by this node's agent.
    pub fn create_group(&self) -> Result<CoValueId> {
        self.inner.update(|inner, state, batch| {
            let id = inner.insert_value(state, CoValueHeader::group(inner.agent.id()));
            let changes = editor::initial_group_changes(&inner.agent, &id)?;
            inner.write_group_changes(state, batch, &id, changes, None)?;
            debug!(group = %id, "created group");
            Ok(id)
        })
    }

    /// Create this agent's account. Accounts are deterministic per agent, so
    /// an existing account is returned as is.
    pub fn create_account(&self) -> Result<CoValueId> {
        self.inner.update(|inner, state, batch| {
            let header = CoValueHeader::account(inner.agent.id());
            let id = header.id();
            if state.registry.is_available(&id) {
                return Ok(id);
            }
            inner.insert_value(state, header);
            let changes = editor::initial_group_changes(&inner.agent, &id)?;
            inner.write_group_changes(state, batch, &id, changes, None)?;
            Ok(id)
        })
    }

    /// Create an empty value of `kind` owned by `group`.
    pub fn create_value(&self, kind: CoValueType, group: &CoValueId, meta: Option<Value>) -> Result<CoValueId> {
        if kind.is_group_like() {
            return Err(NodeError::InvalidOperation(format!("{kind:?} values are created with create_group")));
        }
        self.inner.update(|inner, state, _| {
            inner.require_writer(state, group)?;
            Ok(inner.insert_value(state, CoValueHeader::owned_by(kind, *group, meta)))
        })
    }

    pub fn create_map(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_value(CoValueType::Map, group, None)
    }

    pub fn create_list(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_value(CoValueType::List, group, None)
    }

    pub fn create_stream(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_value(CoValueType::Stream, group, None)
    }

    pub fn create_binary_stream(&self, group: &CoValueId) -> Result<CoValueId> {
        self.create_value(CoValueType::BinaryStream, group, None)
    }

    /// Create a map typed by a registered schema, with its initial fields.
    pub fn create_map_with_schema(
        &self,
        group: &CoValueId,
        schema: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<CoValueId> {
        let descriptor = self
            .inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(schema)
            .ok_or_else(|| NodeError::InvalidOperation(format!("unknown schema {schema}")))?;
        descriptor.validate_all(&fields)?;
        let mut meta = serde_json::Map::new();
        meta.insert(SCHEMA_META_KEY.to_string(), Value::from(schema));
        let meta = Value::Object(meta);
        self.inner.update(|inner, state, batch| {
            inner.require_writer(state, group)?;
            let id = inner.insert_value(state, CoValueHeader::owned_by(CoValueType::Map, *group, Some(meta)));
            if !fields.is_empty() {
                let changes = fields.into_iter().map(|(key, value)| set_op(&key, value)).collect();
                inner.write_content(state, batch, &id, changes)?;
            }
            Ok(id)
        })
    }

    /// Create a value without access control: every signed write is valid
    /// and nothing is encrypted.
    pub fn create_unsafe(&self, kind: CoValueType, meta: Option<Value>) -> Result<CoValueId> {
        if kind.is_group_like() {
            return Err(NodeError::InvalidOperation("groups cannot be unsafe".into()));
        }
        self.inner
            .update(|inner, state, _| Ok(inner.insert_value(state, CoValueHeader::unsafe_allow_all(kind, meta))))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutating content
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a raw transaction to a content value.
    pub fn transact(&self, id: &CoValueId, changes: Vec<Value>) -> Result<TransactionId> {
        self.inner
            .update(|inner, state, batch| inner.write_content(state, batch, id, changes))
    }

    /// Set a map key. Maps with a schema check the value first.
    pub fn map_set(&self, id: &CoValueId, key: &str, value: Value) -> Result<TransactionId> {
        self.inner.update(|inner, state, batch| {
            let header = NodeInner::expect_kind(state, id, CoValueType::Map)?;
            if let Some(schema) = inner.schema_for(&header) {
                schema.validate(key, &value)?;
            }
            inner.write_content(state, batch, id, vec![set_op(key, value)])
        })
    }

    pub fn map_delete(&self, id: &CoValueId, key: &str) -> Result<TransactionId> {
        self.inner.update(|inner, state, batch| {
            let header = NodeInner::expect_kind(state, id, CoValueType::Map)?;
            if let Some(spec) = inner.schema_for(&header).and_then(|schema| schema.spec(key).copied()) {
                if !spec.optional {
                    return Err(NodeError::InvalidField {
                        field: key.to_string(),
                        reason: "required fields cannot be deleted".into(),
                    });
                }
            }
            inner.write_content(state, batch, id, vec![del_op(key)])
        })
    }

    /// Append after the last item.
    pub fn list_append(&self, id: &CoValueId, value: Value) -> Result<OpId> {
        self.inner.update(|inner, state, batch| {
            let list = inner.list_in(state, id)?;
            let after = list.len().checked_sub(1).and_then(|last| list.op_at(last));
            let tx = inner.write_content(state, batch, id, vec![append_op(value, after)])?;
            Ok(OpId { tx, change: 0 })
        })
    }

    /// Insert before the first item.
    pub fn list_prepend(&self, id: &CoValueId, value: Value) -> Result<OpId> {
        self.inner.update(|inner, state, batch| {
            let list = inner.list_in(state, id)?;
            let tx = inner.write_content(state, batch, id, vec![prepend_op(value, list.op_at(0))])?;
            Ok(OpId { tx, change: 0 })
        })
    }

    /// Insert so the new item ends up at `index`; `index == len` appends.
    pub fn list_insert(&self, id: &CoValueId, index: usize, value: Value) -> Result<OpId> {
        self.inner.update(|inner, state, batch| {
            let list = inner.list_in(state, id)?;
            let change = if index == list.len() {
                let after = index.checked_sub(1).and_then(|last| list.op_at(last));
                append_op(value, after)
            } else {
                let before = list.op_at(index).ok_or_else(|| {
                    NodeError::InvalidOperation(format!("index {index} out of bounds for length {}", list.len()))
                })?;
                prepend_op(value, Some(before))
            };
            let tx = inner.write_content(state, batch, id, vec![change])?;
            Ok(OpId { tx, change: 0 })
        })
    }

    /// Delete the item at `index`.
    pub fn list_delete(&self, id: &CoValueId, index: usize) -> Result<()> {
        self.inner.update(|inner, state, batch| {
            let list = inner.list_in(state, id)?;
            let target = list.op_at(index).cloned().ok_or_else(|| {
                NodeError::InvalidOperation(format!("index {index} out of bounds for length {}", list.len()))
            })?;
            inner.write_content(state, batch, id, vec![delete_op(&target)])?;
            Ok(())
        })
    }

    /// Push an item to this session's feed.
    pub fn stream_push(&self, id: &CoValueId, item: Value) -> Result<TransactionId> {
        self.inner.update(|inner, state, batch| {
            NodeInner::expect_kind(state, id, CoValueType::Stream)?;
            inner.write_content(state, batch, id, vec![push_op(item)])
        })
    }

    /// Write a whole binary payload: a `start` record, chunks and `end`,
    /// one transaction each.
    pub fn write_binary(&self, id: &CoValueId, mime_type: &str, data: &[u8], file_name: Option<&str>) -> Result<()> {
        self.inner.update(|inner, state, batch| {
            NodeInner::expect_kind(state, id, CoValueType::BinaryStream)?;
            inner.write_content(state, batch, id, vec![push_op(binary_start(mime_type, data.len(), file_name))])?;
            for chunk in data.chunks(BINARY_CHUNK_BYTES) {
                inner.write_content(state, batch, id, vec![push_op(binary_chunk(chunk))])?;
            }
            inner.write_content(state, batch, id, vec![push_op(binary_end())])?;
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    pub fn known_state(&self, id: &CoValueId) -> Option<KnownState> {
        let state = self.inner.lock_state();
        state.registry.get(id).filter(|core| core.is_available()).map(|core| core.known_state())
    }

    pub fn header(&self, id: &CoValueId) -> Option<CoValueHeader> {
        NodeInner::available_header(&self.inner.lock_state(), id).ok()
    }

    pub fn is_available(&self, id: &CoValueId) -> bool {
        self.inner.lock_state().registry.is_available(id)
    }

    pub fn loading_state(&self, id: &CoValueId) -> LoadingState {
        self.inner
            .lock_state()
            .registry
            .get(id)
            .map_or(LoadingState::Unknown, |core| core.loading_state())
    }

    /// True if the value and all of its dependencies are present and none
    /// of them is still streaming.
    pub fn is_completely_downloaded(&self, id: &CoValueId) -> bool {
        self.inner.lock_state().registry.is_completely_downloaded(id)
    }

    pub fn valid_transactions(&self, id: &CoValueId) -> Result<ValidTransactions> {
        self.inner.valid_transactions_in(&self.inner.lock_state(), id)
    }

    pub fn content(&self, id: &CoValueId) -> Result<Content> {
        self.inner.content_in(&self.inner.lock_state(), id)
    }

    pub fn map(&self, id: &CoValueId) -> Result<CoMap> {
        let state = self.inner.lock_state();
        NodeInner::expect_kind(&state, id, CoValueType::Map)?;
        Ok(CoMap::from_transactions(*id, &self.inner.valid_transactions_in(&state, id)?))
    }

    pub fn list(&self, id: &CoValueId) -> Result<CoList> {
        self.inner.list_in(&self.inner.lock_state(), id)
    }

    pub fn stream(&self, id: &CoValueId) -> Result<CoStream> {
        let state = self.inner.lock_state();
        NodeInner::expect_kind(&state, id, CoValueType::Stream)?;
        Ok(CoStream::from_transactions(*id, &self.inner.valid_transactions_in(&state, id)?))
    }

    pub fn binary(&self, id: &CoValueId) -> Result<BinaryStream> {
        let state = self.inner.lock_state();
        NodeInner::expect_kind(&state, id, CoValueType::BinaryStream)?;
        let txs = self.inner.valid_transactions_in(&state, id)?;
        Ok(BinaryStream::from_stream(&CoStream::from_transactions(*id, &txs)))
    }

    /// A map read through the schema named in its header.
    pub fn typed_map(&self, id: &CoValueId) -> Result<TypedMap> {
        let state = self.inner.lock_state();
        let header = NodeInner::expect_kind(&state, id, CoValueType::Map)?;
        let schema = self
            .inner
            .schema_for(&header)
            .ok_or_else(|| NodeError::InvalidOperation(format!("{id} has no registered schema")))?;
        let map = CoMap::from_transactions(*id, &self.inner.valid_transactions_in(&state, id)?);
        Ok(TypedMap::new(schema, map))
    }

    /// Effective role of `principal` in `group`, inheritance included.
    pub fn role_of(&self, group: &CoValueId, principal: &Principal) -> Option<Role> {
        let state = self.inner.lock_state();
        Engine::new(&state.registry).role_of(group, principal, None)
    }

    /// This node's own effective role in `group`.
    pub fn my_role(&self, group: &CoValueId) -> Option<Role> {
        self.role_of(group, &Principal::Agent(self.agent_id()))
    }

    /// Like [`LocalNode::role_of`], for a principal given as text. `me`
    /// names this node's agent.
    pub fn role_of_named(&self, group: &CoValueId, principal: &str) -> Result<Option<Role>> {
        let principal = Principal::parse_for(principal, self.agent_id())?;
        Ok(self.role_of(group, &principal))
    }

    /// Direct members of `group`.
    pub fn members(&self, group: &CoValueId) -> Result<Vec<(Principal, Role)>> {
        let state = self.inner.lock_state();
        Ok(Engine::new(&state.registry).members(group)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> LocalNode {
        LocalNode::new(AgentSecret::generate(), NodeConfig::default(), None)
    }

    #[tokio::test]
    async fn test_my_role_follows_membership() {
        let other = node();
        let foreign = other.create_group().unwrap();
        let node = node();
        let group = node.create_group().unwrap();
        assert_eq!(node.my_role(&group), Some(Role::Admin));
        assert_eq!(node.role_of_named(&group, "me").unwrap(), Some(Role::Admin));

        assert_eq!(node.my_role(&foreign), None);
        assert_eq!(node.role_of_named(&group, "everyone").unwrap(), None);
        assert!(node.role_of_named(&group, "someone").is_err());
    }

    #[tokio::test]
    async fn test_group_owned_map_round_trip() {
        let node = node();
        let group = node.create_group().unwrap();
        let map = node.create_map(&group).unwrap();
        node.map_set(&map, "title", json!("groceries")).unwrap();
        node.map_set(&map, "count", json!(2)).unwrap();
        node.map_delete(&map, "count").unwrap();

        let content = node.map(&map).unwrap();
        assert_eq!(content.to_json(), json!({"title": "groceries"}));
        assert_eq!(node.role_of(&group, &Principal::Agent(node.agent_id())), Some(Role::Admin));

        let txs = node.valid_transactions(&map).unwrap();
        assert_eq!(txs.transactions.len(), 3);
        assert!(txs.unavailable.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_kind_is_rejected() {
        let node = node();
        let group = node.create_group().unwrap();
        let list = node.create_list(&group).unwrap();
        assert!(matches!(
            node.map_set(&list, "k", json!(1)),
            Err(NodeError::WrongType { expected: CoValueType::Map, .. })
        ));
        assert!(matches!(node.transact(&group, vec![json!({})]), Err(NodeError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_non_members_cannot_write() {
        let owner = node();
        let group = owner.create_group().unwrap();
        let stranger = node();
        assert!(matches!(stranger.create_map(&group), Err(NodeError::Perms(_))));
    }

    #[tokio::test]
    async fn test_list_operations() {
        let node = node();
        let group = node.create_group().unwrap();
        let list = node.create_list(&group).unwrap();
        node.list_append(&list, json!("b")).unwrap();
        node.list_append(&list, json!("d")).unwrap();
        node.list_prepend(&list, json!("a")).unwrap();
        node.list_insert(&list, 2, json!("c")).unwrap();
        node.list_insert(&list, 4, json!("e")).unwrap();
        assert_eq!(
            node.list(&list).unwrap().values(),
            vec![json!("a"), json!("b"), json!("c"), json!("d"), json!("e")]
        );
        node.list_delete(&list, 0).unwrap();
        assert_eq!(node.list(&list).unwrap().len(), 4);
        assert!(node.list_delete(&list, 10).is_err());
    }

    #[tokio::test]
    async fn test_binary_stream_round_trip() {
        let node = node();
        let group = node.create_group().unwrap();
        let id = node.create_binary_stream(&group).unwrap();
        let data: Vec<u8> = (0..(BINARY_CHUNK_BYTES * 2 + 10)).map(|i| (i % 251) as u8).collect();
        node.write_binary(&id, "application/octet-stream", &data, Some("blob.bin")).unwrap();
        let binary = node.binary(&id).unwrap();
        assert_eq!(binary.chunk_count(), 3);
        assert_eq!(binary.bytes().unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_schema_validation_on_write() {
        let node = node();
        node.register_schema(
            SchemaDescriptor::new("Note")
                .field("text", crate::content::FieldKind::String)
                .optional("pinned", crate::content::FieldKind::Boolean),
        );
        let group = node.create_group().unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("text".to_string(), json!("hello"));
        let id = node.create_map_with_schema(&group, "Note", fields).unwrap();

        assert!(matches!(node.map_set(&id, "pinned", json!("yes")), Err(NodeError::InvalidField { .. })));
        node.map_set(&id, "pinned", json!(true)).unwrap();
        assert!(node.map_delete(&id, "text").is_err());

        let typed = node.typed_map(&id).unwrap();
        assert_eq!(typed.string("text").unwrap(), Some("hello".into()));
        assert_eq!(typed.boolean("pinned").unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_account_is_deterministic() {
        let agent = AgentSecret::generate();
        let node = LocalNode::new(agent.clone(), NodeConfig::default(), None);
        let first = node.create_account().unwrap();
        assert_eq!(node.create_account().unwrap(), first);
        assert_eq!(first, CoValueHeader::account(agent.id()).id());
    }

    #[tokio::test]
    async fn test_unsafe_values_are_plain() {
        let node = node();
        let id = node.create_unsafe(CoValueType::Stream, None).unwrap();
        node.stream_push(&id, json!({"n": 1})).unwrap();
        let stream = node.stream(&id).unwrap();
        assert_eq!(stream.last_item_by(&node.agent_id()).map(|i| i.value.clone()), Some(json!({"n": 1})));
    }
}
