//! `CoValueCore`: one CoValue's verified log plus its loading and streaming
//! bookkeeping and its subscribers.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::batch::UpdateBatch;
use crate::content_message::{NewContentMessage, Priority};
use crate::crypto::{AgentSecret, Hash, KeyId, KeySecret, Signature};
use crate::error::CoValueCoreError;
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, PeerId, SessionId, TransactionId};
use crate::known_state::KnownState;
use crate::registry::Registry;
use crate::transaction::Transaction;
use crate::verified::VerifiedState;

/// A subscriber callback. Invoked synchronously after accepted mutations.
pub type Listener = Arc<dyn Fn(&CoValueCore) + Send + Sync>;

/// Load state of a CoValue with respect to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLoadState {
    /// A LOAD was sent and no answer has arrived yet.
    Pending,
    /// The peer provided the header.
    Available,
    /// The peer reported that it does not have the value.
    NotFound,
    /// The peer sent content that failed verification.
    Errored(CoValueCoreError),
}

/// Overall loading state derived from the per-peer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Unknown,
    Loading,
    Available,
    Unavailable,
    Errored,
}

/// How a new transaction is written.
#[derive(Debug, Clone, Copy)]
pub enum Privacy<'a> {
    Trusting,
    Private { key_id: KeyId, key: &'a KeySecret },
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

/// Handle returned by [`CoValueCore::subscribe`].
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe() to remove it"]
pub struct Unsubscribe {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl Unsubscribe {
    /// Remove the listener. Safe to call from inside the listener itself.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unsubscribe({})", self.id)
    }
}

fn lock(listeners: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One CoValue as held by a node.
///
/// Starts either empty (only the id is known) or with a header. Transactions
/// can only be added once the header is known.
pub struct CoValueCore {
    id: CoValueId,
    verified: Option<VerifiedState>,
    peer_states: HashMap<PeerId, PeerLoadState>,
    streaming_target: Option<BTreeMap<SessionId, u64>>,
    listeners: Arc<Mutex<Listeners>>,
    version: u64,
}

impl std::fmt::Debug for CoValueCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoValueCore")
            .field("id", &self.id)
            .field("available", &self.verified.is_some())
            .field("version", &self.version)
            .finish()
    }
}

impl CoValueCore {
    /// A CoValue known only by id.
    pub fn new_empty(id: CoValueId) -> Self {
        Self {
            id,
            verified: None,
            peer_states: HashMap::new(),
            streaming_target: None,
            listeners: Arc::default(),
            version: 0,
        }
    }

    /// A CoValue created from a header.
    pub fn from_header(header: CoValueHeader) -> Self {
        let verified = VerifiedState::new(header);
        let mut core = Self::new_empty(verified.id());
        core.verified = Some(verified);
        core
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    pub fn header(&self) -> Option<&CoValueHeader> {
        self.verified.as_ref().map(VerifiedState::header)
    }

    pub fn verified(&self) -> Option<&VerifiedState> {
        self.verified.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.verified.is_some()
    }

    /// Incremented on every accepted mutation; used to invalidate derived content.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn priority(&self) -> Priority {
        self.header().map_or(Priority::Medium, CoValueHeader::priority)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Log
    // ─────────────────────────────────────────────────────────────────────────

    /// Provide the header for an empty core, checking that it hashes to our id.
    pub fn provide_header(&mut self, header: CoValueHeader, from: Option<&PeerId>) -> Result<(), CoValueCoreError> {
        let actual = header.id();
        if actual != self.id {
            return Err(CoValueCoreError::HeaderMismatch {
                expected: self.id,
                actual,
            });
        }
        if self.verified.is_none() {
            self.verified = Some(VerifiedState::new(header));
            self.version += 1;
        }
        if let Some(peer) = from {
            self.peer_states.insert(peer.clone(), PeerLoadState::Available);
        }
        Ok(())
    }

    /// Verify and append transactions, then notify subscribers.
    ///
    /// Returns `Ok(true)` when transactions were appended and `Ok(false)` when
    /// `transactions` was empty.
    pub fn try_add_transactions(
        &mut self,
        session: &SessionId,
        transactions: Vec<Transaction>,
        expected_hash: Option<&Hash>,
        signature: &Signature,
    ) -> Result<bool, CoValueCoreError> {
        let added = self.append(session, transactions, expected_hash, signature)?;
        if added {
            self.notify();
        }
        Ok(added)
    }

    /// Like [`CoValueCore::try_add_transactions`], but defers notification to `batch`.
    pub fn try_add_transactions_batched(
        &mut self,
        session: &SessionId,
        transactions: Vec<Transaction>,
        expected_hash: Option<&Hash>,
        signature: &Signature,
        batch: &mut UpdateBatch,
    ) -> Result<bool, CoValueCoreError> {
        let added = self.append(session, transactions, expected_hash, signature)?;
        if added {
            batch.mark(self.id);
        }
        Ok(added)
    }

    fn append(
        &mut self,
        session: &SessionId,
        transactions: Vec<Transaction>,
        expected_hash: Option<&Hash>,
        signature: &Signature,
    ) -> Result<bool, CoValueCoreError> {
        let verified = self
            .verified
            .as_mut()
            .ok_or(CoValueCoreError::TriedToAddTransactionsWithoutVerifiedState(self.id))?;
        if transactions.is_empty() {
            return Ok(false);
        }
        verified.try_add_transactions(session, transactions, expected_hash, signature)?;
        self.version += 1;
        if self.streaming_target.is_some() && !self.is_streaming() {
            self.streaming_target = None;
        }
        Ok(true)
    }

    /// Create, sign and append a transaction in `session`, which must belong to `agent`.
    pub fn make_transaction(
        &mut self,
        changes: &[Value],
        privacy: Privacy<'_>,
        agent: &AgentSecret,
        session: &SessionId,
        made_at: u64,
        batch: &mut UpdateBatch,
    ) -> Result<TransactionId, CoValueCoreError> {
        if *session.agent() != agent.id() {
            return Err(CoValueCoreError::SessionAgentMismatch(session.clone()));
        }
        let verified = self
            .verified
            .as_ref()
            .ok_or(CoValueCoreError::TriedToAddTransactionsWithoutVerifiedState(self.id))?;

        let tx_id = TransactionId::new(session.clone(), verified.session_tx_count(session));
        let tx = match privacy {
            Privacy::Trusting => Transaction::trusting(made_at, changes)?,
            Privacy::Private { key_id, key } => {
                Transaction::private(made_at, changes, key_id, key, &self.id, &tx_id)?
            }
        };

        let txs = vec![tx];
        let hash = verified.expected_new_hash(session, &txs);
        let signature = agent.sign(&hash);
        self.try_add_transactions_batched(session, txs, Some(&hash), &signature, batch)?;
        Ok(tx_id)
    }

    /// Transactions held for `session`.
    pub fn session_tx_count(&self, session: &SessionId) -> u64 {
        self.verified.as_ref().map_or(0, |v| v.session_tx_count(session))
    }

    pub fn known_state(&self) -> KnownState {
        match &self.verified {
            Some(verified) => verified.known_state(),
            None => KnownState::empty(self.id),
        }
    }

    /// Content a party with `known` is missing. See [`VerifiedState::new_content_since`].
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<NewContentMessage>> {
        self.verified.as_ref()?.new_content_since(known, self.priority())
    }

    pub fn dependencies(&self) -> Vec<CoValueId> {
        self.verified.as_ref().map(VerifiedState::dependencies).unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Streaming
    // ─────────────────────────────────────────────────────────────────────────

    /// Record the session counts a multi-piece transfer will reach.
    pub fn expect_content_until(&mut self, target: &BTreeMap<SessionId, u64>) {
        let merged = self.streaming_target.get_or_insert_with(BTreeMap::new);
        for (session, count) in target {
            let entry = merged.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
        if !self.is_streaming() {
            self.streaming_target = None;
        }
    }

    /// True while pieces of an announced transfer are still missing.
    pub fn is_streaming(&self) -> bool {
        match &self.streaming_target {
            Some(target) => target
                .iter()
                .any(|(session, count)| self.session_tx_count(session) < *count),
            None => false,
        }
    }

    /// True if this value and all of its dependencies are available and none
    /// of them is still streaming.
    pub fn is_completely_downloaded(&self, registry: &Registry) -> bool {
        registry.is_completely_downloaded(&self.id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-peer state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn mark_pending(&mut self, peer: &PeerId) {
        if self.verified.is_none() {
            self.peer_states.insert(peer.clone(), PeerLoadState::Pending);
        }
    }

    pub fn mark_not_found_in_peer(&mut self, peer: &PeerId) {
        self.peer_states.insert(peer.clone(), PeerLoadState::NotFound);
    }

    pub fn mark_errored(&mut self, peer: &PeerId, error: CoValueCoreError) {
        self.peer_states.insert(peer.clone(), PeerLoadState::Errored(error));
    }

    pub fn is_errored_in_peer(&self, peer: &PeerId) -> bool {
        matches!(self.peer_states.get(peer), Some(PeerLoadState::Errored(_)))
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<&PeerLoadState> {
        self.peer_states.get(peer)
    }

    pub fn is_pending_in(&self, peer: &PeerId) -> bool {
        matches!(self.peer_states.get(peer), Some(PeerLoadState::Pending))
    }

    /// Forget what `peer` told us, e.g. after it disconnected.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.peer_states.remove(peer);
    }

    pub fn loading_state(&self) -> LoadingState {
        if self.verified.is_some() {
            return LoadingState::Available;
        }
        if self.peer_states.values().any(|s| *s == PeerLoadState::Pending) {
            return LoadingState::Loading;
        }
        if self.peer_states.is_empty() {
            return LoadingState::Unknown;
        }
        if self
            .peer_states
            .values()
            .all(|s| matches!(s, PeerLoadState::Errored(_)))
        {
            return LoadingState::Errored;
        }
        LoadingState::Unavailable
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self, listener: impl Fn(&CoValueCore) + Send + Sync + 'static) -> Unsubscribe {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.insert(id, Arc::new(listener));
        Unsubscribe {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }

    /// Call every listener. A panicking listener is logged and skipped.
    pub fn notify(&self) {
        let listeners: Vec<Listener> = lock(&self.listeners).entries.values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
                tracing::error!(id = %self.id, "subscriber panicked during notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{new_random_key, AgentSecret};
    use crate::header::CoValueType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (AgentSecret, SessionId, CoValueCore) {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let core = CoValueCore::from_header(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        (agent, session, core)
    }

    #[test]
    fn test_requires_header() {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut core = CoValueCore::new_empty(CoValueId([3; 20]));
        let tx = Transaction::trusting(1, &[json!(1)]).unwrap();
        let hash = crate::crypto::Hash::of(b"x");

        let err = core
            .try_add_transactions(&session, vec![tx], None, &agent.sign(&hash))
            .unwrap_err();
        assert_eq!(err, CoValueCoreError::TriedToAddTransactionsWithoutVerifiedState(core.id()));
    }

    #[test]
    fn test_provide_header_checks_id() {
        let header = CoValueHeader::unsafe_allow_all(CoValueType::Map, None);
        let mut wrong = CoValueCore::new_empty(CoValueId([9; 20]));
        assert!(matches!(
            wrong.provide_header(header.clone(), None),
            Err(CoValueCoreError::HeaderMismatch { .. })
        ));

        let mut core = CoValueCore::new_empty(header.id());
        let peer = PeerId::new("server");
        core.mark_pending(&peer);
        assert_eq!(core.loading_state(), LoadingState::Loading);
        core.provide_header(header, Some(&peer)).unwrap();
        assert_eq!(core.loading_state(), LoadingState::Available);
    }

    #[test]
    fn test_make_transaction_private_and_trusting() {
        let (agent, session, mut core) = setup();
        let mut batch = UpdateBatch::new();
        let (key_id, key) = new_random_key();

        core.make_transaction(&[json!({"op": "set"})], Privacy::Trusting, &agent, &session, 1, &mut batch)
            .unwrap();
        let tx_id = core
            .make_transaction(
                &[json!({"op": "set"})],
                Privacy::Private { key_id, key: &key },
                &agent,
                &session,
                2,
                &mut batch,
            )
            .unwrap();

        assert_eq!(tx_id.tx_index, 1);
        assert_eq!(core.session_tx_count(&session), 2);
        assert!(batch.contains(&core.id()));
    }

    #[test]
    fn test_make_transaction_rejects_foreign_session() {
        let (agent, _, mut core) = setup();
        let other = SessionId::new_random(AgentSecret::generate().id());
        let mut batch = UpdateBatch::new();
        let err = core
            .make_transaction(&[json!(1)], Privacy::Trusting, &agent, &other, 1, &mut batch)
            .unwrap_err();
        assert!(matches!(err, CoValueCoreError::SessionAgentMismatch(_)));
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let (agent, session, mut core) = setup();
        let calls = Arc::new(AtomicUsize::new(0));

        let _a = core.subscribe(|_| panic!("boom"));
        let counter = calls.clone();
        let _b = core.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let txs = vec![Transaction::trusting(1, &[json!(1)]).unwrap()];
        let hash = core.verified().unwrap().expected_new_hash(&session, &txs);
        core.try_add_transactions(&session, txs, Some(&hash), &agent.sign(&hash)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(core.session_tx_count(&session), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let (_, _, core) = setup();
        let handle = core.subscribe(|_| {});
        assert_eq!(core.listener_count(), 1);
        handle.unsubscribe();
        assert_eq!(core.listener_count(), 0);
    }

    #[test]
    fn test_errors_are_per_peer() {
        let (_, session, mut core) = setup();
        let a = PeerId::new("a");
        let b = PeerId::new("b");
        core.mark_errored(&a, CoValueCoreError::InvalidSignature { session });

        assert!(core.is_errored_in_peer(&a));
        assert!(!core.is_errored_in_peer(&b));
        assert_eq!(core.loading_state(), LoadingState::Available);
    }
}
