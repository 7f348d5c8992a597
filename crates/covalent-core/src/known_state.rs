//! Known state: a compact summary of how much of a CoValue a party has.
//!
//! Known states form a join-semilattice under [`KnownState::combine_with`]
//! (per-session maximum, header OR), which is what lets peers merge
//! acknowledgements in any order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{CoValueId, SessionId};

/// How many transactions of each session a party has, and whether it has the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoValueId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, u64>,
}

impl KnownState {
    /// Knows nothing about `id`.
    pub fn empty(id: CoValueId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Transactions known for `session` (0 when absent).
    pub fn session_count(&self, session: &SessionId) -> u64 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge another known state into this one.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    /// True if everything in `other` is also in `self`.
    pub fn contains(&self, other: &KnownState) -> bool {
        (self.header || !other.header)
            && other
                .sessions
                .iter()
                .all(|(session, count)| self.session_count(session) >= *count)
    }

    /// Sessions where `self` is ahead of `other`, with `other`'s count.
    pub fn ahead_of(&self, other: &KnownState) -> BTreeMap<SessionId, u64> {
        self.sessions
            .iter()
            .filter(|(session, count)| **count > other.session_count(session))
            .map(|(session, _)| (session.clone(), other.session_count(session)))
            .collect()
    }

    /// Total number of transactions across sessions.
    pub fn total(&self) -> u64 {
        self.sessions.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use proptest::prelude::*;

    fn sessions(n: usize) -> Vec<SessionId> {
        let agent = AgentSecret::generate().id();
        (0..n).map(|_| SessionId::new_random(agent)).collect()
    }

    fn state(id: CoValueId, header: bool, ids: &[SessionId], counts: &[u64]) -> KnownState {
        KnownState {
            id,
            header,
            sessions: ids.iter().cloned().zip(counts.iter().copied()).filter(|(_, c)| *c > 0).collect(),
        }
    }

    #[test]
    fn test_ahead_of() {
        let ids = sessions(2);
        let id = CoValueId([0; 20]);
        let a = state(id, true, &ids, &[5, 1]);
        let b = state(id, true, &ids, &[3, 1]);

        let ahead = a.ahead_of(&b);
        assert_eq!(ahead.len(), 1);
        assert_eq!(ahead[&ids[0]], 3);
        assert!(b.ahead_of(&a).is_empty());
    }

    proptest! {
        #[test]
        fn combine_is_commutative_and_covers_both(
            ha in any::<bool>(), hb in any::<bool>(),
            ca in prop::collection::vec(0u64..50, 4),
            cb in prop::collection::vec(0u64..50, 4),
        ) {
            let ids = sessions(4);
            let id = CoValueId([1; 20]);
            let a = state(id, ha, &ids, &ca);
            let b = state(id, hb, &ids, &cb);

            let mut ab = a.clone();
            ab.combine_with(&b);
            let mut ba = b.clone();
            ba.combine_with(&a);

            prop_assert_eq!(&ab, &ba);
            prop_assert!(ab.contains(&a));
            prop_assert!(ab.contains(&b));
        }

        #[test]
        fn combine_is_idempotent(
            h in any::<bool>(),
            c in prop::collection::vec(0u64..50, 3),
        ) {
            let ids = sessions(3);
            let a = state(CoValueId([2; 20]), h, &ids, &c);
            let mut aa = a.clone();
            aa.combine_with(&a);
            prop_assert_eq!(aa, a);
        }
    }
}
