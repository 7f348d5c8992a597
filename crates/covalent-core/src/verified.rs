//! The verified state of a CoValue: header plus hash-checked session logs.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::content_message::{NewContentMessage, Priority, SessionNewContent};
use crate::crypto::{Hash, Signature};
use crate::error::CoValueCoreError;
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, SessionId, TransactionId};
use crate::known_state::KnownState;
use crate::session_log::{SessionHead, SessionLog, MAX_RECOMMENDED_TX_SIZE};
use crate::transaction::{parse_changes, Transaction};

/// Session heads of a [`VerifiedState`] at one point in time.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    heads: BTreeMap<SessionId, SessionHead>,
}

/// Header and session logs whose hashes and signatures have been checked.
#[derive(Debug, Clone)]
pub struct VerifiedState {
    id: CoValueId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
}

impl VerifiedState {
    pub fn new(header: CoValueHeader) -> Self {
        Self {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> CoValueId {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn session_tx_count(&self, session: &SessionId) -> u64 {
        self.sessions.get(session).map_or(0, |log| log.len() as u64)
    }

    /// Hash the session would have after appending `new`.
    pub fn expected_new_hash(&self, session: &SessionId, new: &[Transaction]) -> Hash {
        match self.sessions.get(session) {
            Some(log) => log.expected_hash_after(new).0,
            None => SessionLog::new().expected_hash_after(new).0,
        }
    }

    /// Verify and append transactions to a session.
    ///
    /// When `expected_hash` is given it must equal the recomputed hash. The
    /// signature must verify against the session agent's signer. Nothing is
    /// appended on failure.
    pub fn try_add_transactions(
        &mut self,
        session: &SessionId,
        transactions: Vec<Transaction>,
        expected_hash: Option<&Hash>,
        signature: &Signature,
    ) -> Result<(), CoValueCoreError> {
        if transactions.is_empty() {
            return Ok(());
        }
        let empty = SessionLog::new();
        let log = self.sessions.get(session).unwrap_or(&empty);
        let (hash, hasher) = log.expected_hash_after(&transactions);

        if let Some(expected) = expected_hash {
            if *expected != hash {
                return Err(CoValueCoreError::InvalidHash {
                    session: session.clone(),
                    expected: *expected,
                    actual: hash,
                });
            }
        }

        session
            .agent()
            .signer
            .verify(&hash, signature)
            .map_err(|_| CoValueCoreError::InvalidSignature {
                session: session.clone(),
            })?;

        self.sessions
            .entry(session.clone())
            .or_default()
            .append(transactions, hash, hasher, *signature);
        Ok(())
    }

    /// Remember the current session heads. Costs one entry per session, not
    /// per transaction.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            heads: self
                .sessions
                .iter()
                .map(|(session, log)| (session.clone(), log.head()))
                .collect(),
        }
    }

    /// Undo every append made since `checkpoint` was taken.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let mut heads = checkpoint.heads;
        self.sessions.retain(|session, log| match heads.remove(session) {
            Some(head) => {
                log.rewind(head);
                true
            }
            None => false,
        });
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, log)| (session.clone(), log.len() as u64))
                .collect(),
        }
    }

    /// Content a party with `known` is missing, split into pieces.
    ///
    /// Each piece ends on a verifiable signature: a session's transactions are
    /// cut at its in-between signatures, and a piece is closed once adding the
    /// next chunk would push it over [`MAX_RECOMMENDED_TX_SIZE`]. Returns
    /// `None` when the party already has everything including the header; a
    /// party without the header always gets at least a header-only piece.
    pub fn new_content_since(&self, known: Option<&KnownState>, priority: Priority) -> Option<Vec<NewContentMessage>> {
        let send_header = known.map_or(true, |k| !k.header);
        let mut pieces = Vec::new();
        let mut current = NewContentMessage::new(self.id, send_header.then(|| self.header.clone()), priority);
        let mut current_size = 0usize;
        let mut sent: BTreeMap<&SessionId, usize> = BTreeMap::new();

        loop {
            let mut more_after_signature = false;

            for (session, log) in &self.sessions {
                let known_count = known.map_or(0, |k| k.session_count(session) as usize);
                let first_new = sent.get(session).copied().unwrap_or(known_count);
                if first_new >= log.len() {
                    continue;
                }

                let signature_idx = log.next_signature_index(first_new);
                let end = signature_idx.map_or(log.len(), |idx| idx + 1);
                let chunk = &log.transactions()[first_new..end];
                let chunk_size: usize = chunk.iter().map(Transaction::payload_len).sum();

                let overflows = current_size > 0 && current_size + chunk_size > MAX_RECOMMENDED_TX_SIZE;
                if overflows || current.new.contains_key(session) {
                    let next = NewContentMessage::new(self.id, None, priority);
                    pieces.push(std::mem::replace(&mut current, next));
                    current_size = 0;
                }

                let last_signature = match signature_idx {
                    Some(idx) => log.signature_after(idx),
                    None => log.last_signature(),
                };
                let Some(last_signature) = last_signature else {
                    continue;
                };

                current_size += chunk_size;
                current.new.insert(
                    session.clone(),
                    SessionNewContent {
                        after: first_new as u64,
                        new_transactions: chunk.to_vec(),
                        last_signature: *last_signature,
                    },
                );
                sent.insert(session, end);

                if end < log.len() {
                    more_after_signature = true;
                }
            }

            if !more_after_signature {
                break;
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }

        if pieces.is_empty() {
            return None;
        }
        if pieces.len() > 1 {
            pieces[0].expect_content_until = Some(self.known_state().sessions);
        }
        Some(pieces)
    }

    /// Ids this value needs before it can be validated: owner group, parent
    /// groups named in its own log, and the branch source.
    pub fn dependencies(&self) -> Vec<CoValueId> {
        let mut deps = Vec::new();
        if let Some(group) = self.header.owner_group() {
            deps.push(group);
        }
        if self.header.is_group_like() {
            for log in self.sessions.values() {
                for tx in log.transactions() {
                    let Transaction::Trusting(trusting) = tx else {
                        continue;
                    };
                    let Ok(changes) = parse_changes(&trusting.changes) else {
                        continue;
                    };
                    for change in &changes {
                        if let Some(parent) = parent_reference(change) {
                            if !deps.contains(&parent) {
                                deps.push(parent);
                            }
                        }
                    }
                }
            }
        }
        if let Some(source) = self.header.branch_source() {
            if !deps.contains(&source) {
                deps.push(source);
            }
        }
        deps.retain(|dep| *dep != self.id);
        deps
    }

    /// All transactions with their ids, session by session.
    pub fn transactions(&self) -> impl Iterator<Item = (TransactionId, &Transaction)> {
        self.sessions.iter().flat_map(|(session, log)| {
            log.transactions()
                .iter()
                .enumerate()
                .map(move |(idx, tx)| (TransactionId::new(session.clone(), idx as u64), tx))
        })
    }

    /// Look up a single transaction.
    pub fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.sessions
            .get(&id.session_id)?
            .transactions()
            .get(id.tx_index as usize)
    }
}

fn parent_reference(change: &Value) -> Option<CoValueId> {
    change
        .get("key")?
        .as_str()?
        .strip_prefix("parent_")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::header::CoValueType;
    use serde_json::json;

    fn append(state: &mut VerifiedState, agent: &AgentSecret, session: &SessionId, txs: Vec<Transaction>) {
        let hash = state.expected_new_hash(session, &txs);
        let sig = agent.sign(&hash);
        state.try_add_transactions(session, txs, Some(&hash), &sig).unwrap();
    }

    fn kb_set(i: u64) -> Transaction {
        Transaction::trusting(i, &[json!({"op": "set", "key": "k", "value": "x".repeat(1024)})]).unwrap()
    }

    #[test]
    fn test_rejects_wrong_hash_and_foreign_signature() {
        let agent = AgentSecret::generate();
        let mallory = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        let txs = vec![Transaction::trusting(1, &[json!(1)]).unwrap()];

        let hash = state.expected_new_hash(&session, &txs);
        let wrong = crate::crypto::Hash::of(b"nope");
        let err = state
            .try_add_transactions(&session, txs.clone(), Some(&wrong), &agent.sign(&wrong))
            .unwrap_err();
        assert!(matches!(err, CoValueCoreError::InvalidHash { .. }));

        let err = state
            .try_add_transactions(&session, txs.clone(), Some(&hash), &mallory.sign(&hash))
            .unwrap_err();
        assert!(matches!(err, CoValueCoreError::InvalidSignature { .. }));
        assert_eq!(state.session_tx_count(&session), 0);

        state.try_add_transactions(&session, txs, Some(&hash), &agent.sign(&hash)).unwrap();
        assert_eq!(state.session_tx_count(&session), 1);
    }

    #[test]
    fn test_new_content_since_nothing_new() {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));

        let header_only = state.new_content_since(None, Priority::Medium).unwrap();
        assert_eq!(header_only.len(), 1);
        assert!(header_only[0].header.is_some());
        assert!(header_only[0].new.is_empty());

        append(&mut state, &agent, &session, vec![kb_set(1)]);
        let known = state.known_state();
        assert!(state.new_content_since(Some(&known), Priority::Medium).is_none());
    }

    #[test]
    fn test_streams_in_signed_pieces() {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for i in 0..200 {
            append(&mut state, &agent, &session, vec![kb_set(i)]);
        }

        let pieces = state.new_content_since(None, Priority::Medium).unwrap();
        assert_eq!(pieces.len(), 3);
        assert!(pieces[0].header.is_some());
        assert_eq!(
            pieces[0].expect_content_until.as_ref().unwrap()[&session],
            200
        );

        let ends: Vec<u64> = pieces.iter().map(|p| p.implied_known_state().session_count(&session)).collect();
        assert_eq!(ends, vec![97, 194, 200]);

        let mut receiver = VerifiedState::new(pieces[0].header.clone().unwrap());
        for piece in &pieces {
            for (session, content) in &piece.new {
                assert_eq!(content.after, receiver.session_tx_count(session));
                receiver
                    .try_add_transactions(session, content.new_transactions.clone(), None, &content.last_signature)
                    .unwrap();
            }
        }
        assert_eq!(receiver.known_state(), state.known_state());
    }

    #[test]
    fn test_resume_from_partial_known_state() {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for i in 0..10 {
            append(&mut state, &agent, &session, vec![kb_set(i)]);
        }

        let mut known = KnownState::empty(state.id());
        known.header = true;
        known.sessions.insert(session.clone(), 4);

        let pieces = state.new_content_since(Some(&known), Priority::Medium).unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].header.is_none());
        assert_eq!(pieces[0].new[&session].after, 4);
        assert_eq!(pieces[0].new[&session].new_transactions.len(), 6);
    }

    #[test]
    fn test_rollback_drops_new_sessions_and_appends() {
        let agent = AgentSecret::generate();
        let first = SessionId::new_random(agent.id());
        let second = SessionId::new_random(agent.id());
        let mut state = VerifiedState::new(CoValueHeader::unsafe_allow_all(CoValueType::Map, None));
        for i in 0..3 {
            append(&mut state, &agent, &first, vec![kb_set(i)]);
        }
        let before = state.known_state();
        let hash = state.session(&first).unwrap().last_hash().copied();

        let checkpoint = state.checkpoint();
        for i in 3..150 {
            append(&mut state, &agent, &first, vec![kb_set(i)]);
        }
        append(&mut state, &agent, &second, vec![kb_set(0)]);
        state.rollback(checkpoint);

        assert_eq!(state.known_state(), before);
        assert_eq!(state.session(&first).unwrap().last_hash().copied(), hash);
        assert!(state.session(&first).unwrap().signatures_after().is_empty());

        // Still accepts the next transaction in the chain.
        append(&mut state, &agent, &first, vec![kb_set(3)]);
        assert_eq!(state.session_tx_count(&first), 4);
    }

    #[test]
    fn test_group_dependencies_from_parent_keys() {
        let agent = AgentSecret::generate();
        let session = SessionId::new_random(agent.id());
        let parent = CoValueHeader::group(agent.id()).id();
        let mut group = VerifiedState::new(CoValueHeader::group(agent.id()));

        let change = json!({"op": "set", "key": format!("parent_{parent}"), "value": "extend"});
        append(&mut group, &agent, &session, vec![Transaction::trusting(1, &[change]).unwrap()]);

        assert_eq!(group.dependencies(), vec![parent]);
    }
}
