//! Per-peer sync state and the priority outbox.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use covalent_core::{CoValueId, KnownState, PeerId, Priority};

use crate::messages::SyncMessage;

/// How a peer takes part in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Asked for values we lack; receives everything we have.
    Server,
    /// Receives only values it loaded or sent us.
    Client,
    /// Persistence. Receives everything, but only as CONTENT.
    Storage,
}

/// Outgoing messages, drained high priority first and FIFO within a level.
#[derive(Debug, Default)]
pub struct Outbox {
    queues: BTreeMap<Priority, VecDeque<SyncMessage>>,
}

impl Outbox {
    pub fn push(&mut self, msg: SyncMessage) {
        self.queues.entry(msg.priority()).or_default().push_back(msg);
    }

    pub fn pop(&mut self) -> Option<SyncMessage> {
        let queue = self.queues.values_mut().find(|queue| !queue.is_empty())?;
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What we know about one peer.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    /// What we believe the peer has, including content still in flight.
    optimistic: HashMap<CoValueId, KnownState>,
    /// What the peer has told us it has.
    confirmed: HashMap<CoValueId, KnownState>,
    /// Values the peer asked about or sent us.
    interested: HashSet<CoValueId>,
    outbox: Outbox,
}

impl PeerState {
    pub fn new(id: PeerId, role: PeerRole) -> Self {
        Self {
            id,
            role,
            optimistic: HashMap::new(),
            confirmed: HashMap::new(),
            interested: HashSet::new(),
            outbox: Outbox::default(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn optimistic(&self, id: &CoValueId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    pub fn confirmed(&self, id: &CoValueId) -> Option<&KnownState> {
        self.confirmed.get(id)
    }

    pub fn is_interested_in(&self, id: &CoValueId) -> bool {
        self.interested.contains(id)
    }

    /// Whether content for `id` should be pushed to this peer unasked.
    pub fn wants(&self, id: &CoValueId) -> bool {
        match self.role {
            PeerRole::Server | PeerRole::Storage => true,
            PeerRole::Client => self.interested.contains(id),
        }
    }

    pub(crate) fn mark_interested(&mut self, id: CoValueId) {
        self.interested.insert(id);
    }

    /// Record that the peer has at least `known`.
    pub(crate) fn combine_known(&mut self, known: &KnownState) {
        merge(&mut self.optimistic, known);
        merge(&mut self.confirmed, known);
    }

    /// Record that the peer will have `known` once in-flight content lands.
    pub(crate) fn combine_optimistic(&mut self, known: &KnownState) {
        merge(&mut self.optimistic, known);
    }

    /// Replace both views with what the peer says it actually has.
    pub(crate) fn reset_known(&mut self, known: KnownState) {
        self.confirmed.insert(known.id, known.clone());
        self.optimistic.insert(known.id, known);
    }

    /// Queue a message. Storage only takes content.
    pub(crate) fn enqueue(&mut self, msg: SyncMessage) {
        if self.role == PeerRole::Storage && !msg.is_content() {
            return;
        }
        self.outbox.push(msg);
    }

    pub fn pop_outgoing(&mut self) -> Option<SyncMessage> {
        self.outbox.pop()
    }

    pub fn pending_outgoing(&self) -> usize {
        self.outbox.len()
    }
}

fn merge(map: &mut HashMap<CoValueId, KnownState>, known: &KnownState) {
    map.entry(known.id)
        .and_modify(|existing| existing.combine_with(known))
        .or_insert_with(|| known.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::NewContentMessage;
    use proptest::prelude::*;

    fn priority() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
    }

    proptest! {
        #[test]
        fn outbox_never_yields_lower_before_higher(priorities in prop::collection::vec(priority(), 0..40)) {
            let mut outbox = Outbox::default();
            for (i, p) in priorities.iter().enumerate() {
                let id = CoValueId([i as u8; 20]);
                outbox.push(SyncMessage::Content(NewContentMessage::new(id, None, *p)));
            }
            let drained: Vec<(Priority, u8)> = std::iter::from_fn(|| outbox.pop())
                .map(|msg| (msg.priority(), msg.id().0[0]))
                .collect();
            prop_assert_eq!(drained.len(), priorities.len());
            let mut sorted = drained.clone();
            sorted.sort();
            prop_assert_eq!(drained, sorted);
        }
    }

    #[test]
    fn test_outbox_drains_by_priority_then_fifo() {
        let mut outbox = Outbox::default();
        let low = CoValueId([1; 20]);
        let medium_a = CoValueId([2; 20]);
        let medium_b = CoValueId([3; 20]);
        let control = CoValueId([4; 20]);

        outbox.push(SyncMessage::Content(NewContentMessage::new(low, None, Priority::Low)));
        outbox.push(SyncMessage::Content(NewContentMessage::new(medium_a, None, Priority::Medium)));
        outbox.push(SyncMessage::Content(NewContentMessage::new(medium_b, None, Priority::Medium)));
        outbox.push(SyncMessage::Done { id: control });

        let order: Vec<CoValueId> = std::iter::from_fn(|| outbox.pop()).map(|msg| msg.id()).collect();
        assert_eq!(order, vec![control, medium_a, medium_b, low]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_storage_only_takes_content() {
        let id = CoValueId([1; 20]);
        let mut storage = PeerState::new(PeerId::storage(), PeerRole::Storage);
        storage.enqueue(SyncMessage::known(KnownState::empty(id)));
        storage.enqueue(SyncMessage::Load(KnownState::empty(id)));
        assert_eq!(storage.pending_outgoing(), 0);
        storage.enqueue(SyncMessage::Content(NewContentMessage::new(id, None, Priority::Medium)));
        assert_eq!(storage.pending_outgoing(), 1);
        assert!(storage.wants(&id));
    }

    #[test]
    fn test_reset_overrides_optimistic_view() {
        let id = CoValueId([1; 20]);
        let mut peer = PeerState::new(PeerId::new("a"), PeerRole::Client);
        assert!(!peer.wants(&id));

        let mut ahead = KnownState::empty(id);
        ahead.header = true;
        peer.combine_optimistic(&ahead);
        assert!(peer.optimistic(&id).unwrap().header);
        assert!(peer.confirmed(&id).is_none());

        peer.reset_known(KnownState::empty(id));
        assert!(!peer.optimistic(&id).unwrap().header);
    }
}
