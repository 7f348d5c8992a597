//! Group state: the admin-validated fold of a group's own log.
//!
//! Transactions are replayed in `(madeAt, sessionId, txIndex)` order. Each
//! must carry exactly one `set` change, and whether it is admitted depends on
//! the author's role *at that point of the replay*, so role changes take
//! effect for the transactions that follow them.
//!
//! ## Admission rules
//!
//! - Private transactions are admitted for admins only and do not touch the map.
//! - The initial admin may appoint itself once, before anyone holds a role.
//! - Admins may assign any role, except that an existing admin is never lowered
//!   and a `writeOnly` member is never downgraded to `reader`.
//! - An invite role may assign exactly the role it grants, once, to an agent
//!   without a role, and may then hand that agent its keys.
//! - `readKey`, `parent_`, `child_` and unrecognised keys are admin-only.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use covalent_core::{parse_changes, AgentId, CoValueCore, CoValueId, KeyId, Transaction, TransactionId};

use crate::fields::{GroupField, ParentLink, Principal, RevealedTo};
use crate::role::Role;

/// One admitted assignment of a group map key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub value: Value,
    pub made_at: u64,
    pub tx_id: TransactionId,
}

impl GroupEntry {
    /// The agent whose session wrote this entry.
    pub fn author(&self) -> &AgentId {
        self.tx_id.session_id.agent()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Validated content of a group or account.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: CoValueId,
    entries: BTreeMap<String, Vec<GroupEntry>>,
    valid: BTreeSet<TransactionId>,
    /// Invite agent -> the agent it admitted.
    used_invites: HashMap<AgentId, AgentId>,
}

impl GroupState {
    /// Replay the log of `core`. Returns `None` if `core` is not an available
    /// group or account.
    pub fn from_core(core: &CoValueCore) -> Option<Self> {
        let verified = core.verified()?;
        let header = verified.header();
        if !header.is_group_like() {
            return None;
        }
        let initial_admin = header.initial_admin();

        let mut txs: Vec<(TransactionId, &Transaction)> = verified.transactions().collect();
        txs.sort_by(|(a_id, a), (b_id, b)| (a.made_at(), a_id).cmp(&(b.made_at(), b_id)));

        let mut state = Self {
            id: core.id(),
            entries: BTreeMap::new(),
            valid: BTreeSet::new(),
            used_invites: HashMap::new(),
        };

        for (tx_id, tx) in txs {
            let author = *tx_id.session_id.agent();
            let author_role = state.current_role(&Principal::Agent(author));

            let trusting = match tx {
                Transaction::Private(_) => {
                    if author_role == Some(Role::Admin) {
                        state.valid.insert(tx_id);
                    }
                    continue;
                }
                Transaction::Trusting(trusting) => trusting,
            };

            let Some((key, value)) = single_set_change(&trusting.changes) else {
                tracing::debug!(group = %state.id, tx = %tx_id, "ignoring group transaction without exactly one set");
                continue;
            };

            if state.admits(&author, author_role, initial_admin.as_ref(), &key, &value) {
                state.record(key, value, tx.made_at(), tx_id);
            }
        }

        Some(state)
    }

    fn admits(
        &mut self,
        author: &AgentId,
        author_role: Option<Role>,
        initial_admin: Option<&AgentId>,
        key: &str,
        value: &Value,
    ) -> bool {
        let is_admin = author_role == Some(Role::Admin);
        match GroupField::parse(key) {
            GroupField::Member(target) => {
                let Some(assigned) = value.as_str().and_then(|v| v.parse::<Role>().ok()) else {
                    return false;
                };
                self.admits_role_change(author, author_role, initial_admin, target, assigned)
            }
            GroupField::Revelation { to, .. } => {
                is_admin
                    || matches!(to, RevealedTo::Agent(agent) if self.invite_target(author, author_role) == Some(agent))
            }
            GroupField::WriteKeyFor(target) => {
                is_admin || (target.agent().is_some() && self.invite_target(author, author_role) == target.agent().copied())
            }
            GroupField::ReadKey => is_admin && value.as_str().is_some_and(|v| v.parse::<KeyId>().is_ok()),
            GroupField::Parent(_) => is_admin && value.as_str().and_then(ParentLink::parse).is_some(),
            GroupField::Child(_) | GroupField::Other(_) => is_admin,
        }
    }

    fn admits_role_change(
        &mut self,
        author: &AgentId,
        author_role: Option<Role>,
        initial_admin: Option<&AgentId>,
        target: Principal,
        assigned: Role,
    ) -> bool {
        if target == Principal::Everyone && !assigned.allowed_for_everyone() {
            return false;
        }
        let current = self.current_role(&target);

        match author_role {
            Some(Role::Admin) => {
                if current == Some(Role::Admin) && assigned != Role::Admin {
                    return false;
                }
                !(current == Some(Role::WriteOnly) && assigned == Role::Reader)
            }
            Some(invite) if invite.is_invite() => {
                let Principal::Agent(target_agent) = target else {
                    return false;
                };
                if invite.invited_role() != Some(assigned)
                    || self.used_invites.contains_key(author)
                    || current.is_some()
                {
                    return false;
                }
                self.used_invites.insert(*author, target_agent);
                true
            }
            _ => {
                initial_admin == Some(author)
                    && target == Principal::Agent(*author)
                    && assigned == Role::Admin
                    && !self.has_any_member()
            }
        }
    }

    /// The agent an invite author already admitted, if `author` holds an invite role.
    fn invite_target(&self, author: &AgentId, author_role: Option<Role>) -> Option<AgentId> {
        if author_role.is_some_and(|r| r.is_invite()) {
            self.used_invites.get(author).copied()
        } else {
            None
        }
    }

    fn has_any_member(&self) -> bool {
        self.entries
            .keys()
            .any(|key| matches!(GroupField::parse(key), GroupField::Member(_)))
    }

    fn record(&mut self, key: String, value: Value, made_at: u64, tx_id: TransactionId) {
        self.valid.insert(tx_id.clone());
        self.entries
            .entry(key)
            .or_default()
            .push(GroupEntry { value, made_at, tx_id });
    }

    fn current_role(&self, principal: &Principal) -> Option<Role> {
        self.get(&principal.to_string())?.as_str()?.parse().ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> CoValueId {
        self.id
    }

    /// Transactions admitted by the fold.
    pub fn valid_transactions(&self) -> &BTreeSet<TransactionId> {
        &self.valid
    }

    /// Latest entry for `key`.
    pub fn get(&self, key: &str) -> Option<&GroupEntry> {
        self.entries.get(key)?.last()
    }

    /// Latest entry for `key` made at or before `at`.
    pub fn get_at(&self, key: &str, at: u64) -> Option<&GroupEntry> {
        self.entries.get(key)?.iter().rev().find(|e| e.made_at <= at)
    }

    /// Entry for `key` as of `at`, or the latest when `at` is `None`.
    pub fn get_as_of(&self, key: &str, at: Option<u64>) -> Option<&GroupEntry> {
        match at {
            Some(at) => self.get_at(key, at),
            None => self.get(key),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Role held directly in this group (no inheritance).
    pub fn direct_role(&self, principal: &Principal, at: Option<u64>) -> Option<Role> {
        self.get_as_of(&principal.to_string(), at)?.as_str()?.parse().ok()
    }

    /// Current direct members and their roles, `everyone` included.
    pub fn members(&self) -> Vec<(Principal, Role)> {
        self.entries
            .iter()
            .filter_map(|(key, history)| {
                let GroupField::Member(principal) = GroupField::parse(key) else {
                    return None;
                };
                let role = history.last()?.as_str()?.parse().ok()?;
                Some((principal, role))
            })
            .collect()
    }

    /// Id of the current read key.
    pub fn read_key_id(&self) -> Option<KeyId> {
        self.get(crate::fields::READ_KEY)?.as_str()?.parse().ok()
    }

    /// Id of the write key assigned to a writeOnly principal.
    pub fn write_key_id_for(&self, principal: &Principal) -> Option<KeyId> {
        let field = GroupField::WriteKeyFor(*principal).to_string();
        self.get(&field)?.as_str()?.parse().ok()
    }

    /// Parent groups and their link kind as of `at`.
    pub fn parents(&self, at: Option<u64>) -> Vec<(CoValueId, ParentLink)> {
        self.entries
            .keys()
            .filter_map(|key| {
                let GroupField::Parent(parent) = GroupField::parse(key) else {
                    return None;
                };
                let link = ParentLink::parse(self.get_as_of(key, at)?.as_str()?)?;
                Some((parent, link))
            })
            .collect()
    }

    /// Child groups currently linked.
    pub fn children(&self) -> Vec<CoValueId> {
        self.entries
            .iter()
            .filter_map(|(key, history)| {
                let GroupField::Child(child) = GroupField::parse(key) else {
                    return None;
                };
                (history.last()?.as_str()? != "revoked").then_some(child)
            })
            .collect()
    }

    /// Revelations of `key`, newest last.
    pub fn revelations_of(&self, key: &KeyId) -> Vec<(RevealedTo, &GroupEntry)> {
        let prefix = format!("{key}_for_");
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, history)| match GroupField::parse(k) {
                GroupField::Revelation { to, .. } => Some((to, history.last()?)),
                _ => None,
            })
            .collect()
    }

    /// True once the invite agent `invite` has admitted someone.
    pub fn invite_used(&self, invite: &AgentId) -> bool {
        self.used_invites.contains_key(invite)
    }

    pub fn has_revelation(&self, key: &KeyId, to: RevealedTo) -> bool {
        self.get(&GroupField::Revelation { key: *key, to }.to_string()).is_some()
    }
}

fn single_set_change(changes: &str) -> Option<(String, Value)> {
    let mut changes = parse_changes(changes).ok()?;
    if changes.len() != 1 {
        return None;
    }
    let mut change = changes.pop()?;
    if change.get("op")?.as_str()? != "set" {
        return None;
    }
    let key = change.get("key")?.as_str()?.to_string();
    let value = change.get_mut("value")?.take();
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_core::{AgentSecret, CoValueHeader, SessionId, UpdateBatch};
    use covalent_core::Privacy;
    use serde_json::json;

    struct Writer {
        agent: AgentSecret,
        session: SessionId,
    }

    impl Writer {
        fn new() -> Self {
            let agent = AgentSecret::generate();
            let session = SessionId::new_random(agent.id());
            Self { agent, session }
        }

        fn set(&self, core: &mut CoValueCore, made_at: u64, key: &str, value: Value) {
            let change = json!({"op": "set", "key": key, "value": value});
            core.make_transaction(&[change], Privacy::Trusting, &self.agent, &self.session, made_at, &mut UpdateBatch::new())
                .unwrap();
        }
    }

    #[test]
    fn test_initial_admin_and_non_admin_writes() {
        let admin = Writer::new();
        let other = Writer::new();
        let mut core = CoValueCore::from_header(CoValueHeader::group(admin.agent.id()));

        admin.set(&mut core, 1, &admin.agent.id().to_string(), json!("admin"));
        other.set(&mut core, 2, &other.agent.id().to_string(), json!("admin"));
        admin.set(&mut core, 3, &other.agent.id().to_string(), json!("reader"));
        other.set(&mut core, 4, "everyone", json!("writer"));

        let state = GroupState::from_core(&core).unwrap();
        assert_eq!(state.direct_role(&admin.agent.id().into(), None), Some(Role::Admin));
        assert_eq!(state.direct_role(&other.agent.id().into(), None), Some(Role::Reader));
        assert_eq!(state.direct_role(&other.agent.id().into(), Some(2)), None);
        assert_eq!(state.direct_role(&Principal::Everyone, None), None);
        assert_eq!(state.valid_transactions().len(), 2);
    }

    #[test]
    fn test_admins_cannot_be_demoted() {
        let first = Writer::new();
        let second = Writer::new();
        let mut core = CoValueCore::from_header(CoValueHeader::group(first.agent.id()));

        first.set(&mut core, 1, &first.agent.id().to_string(), json!("admin"));
        first.set(&mut core, 2, &second.agent.id().to_string(), json!("admin"));
        second.set(&mut core, 3, &first.agent.id().to_string(), json!("reader"));
        second.set(&mut core, 4, &second.agent.id().to_string(), json!("writer"));

        let state = GroupState::from_core(&core).unwrap();
        assert_eq!(state.direct_role(&first.agent.id().into(), None), Some(Role::Admin));
        assert_eq!(state.direct_role(&second.agent.id().into(), None), Some(Role::Admin));
    }

    #[test]
    fn test_everyone_cannot_be_admin_and_multi_change_is_ignored() {
        let admin = Writer::new();
        let mut core = CoValueCore::from_header(CoValueHeader::group(admin.agent.id()));
        admin.set(&mut core, 1, &admin.agent.id().to_string(), json!("admin"));
        admin.set(&mut core, 2, "everyone", json!("admin"));

        let two = vec![
            json!({"op": "set", "key": "everyone", "value": "reader"}),
            json!({"op": "set", "key": "everyone", "value": "writer"}),
        ];
        core.make_transaction(&two, Privacy::Trusting, &admin.agent, &admin.session, 3, &mut UpdateBatch::new())
            .unwrap();

        let state = GroupState::from_core(&core).unwrap();
        assert_eq!(state.direct_role(&Principal::Everyone, None), None);
    }

    #[test]
    fn test_invite_is_single_use() {
        let admin = Writer::new();
        let invite = Writer::new();
        let (alice, bob) = (Writer::new(), Writer::new());
        let mut core = CoValueCore::from_header(CoValueHeader::group(admin.agent.id()));

        admin.set(&mut core, 1, &admin.agent.id().to_string(), json!("admin"));
        admin.set(&mut core, 2, &invite.agent.id().to_string(), json!("readerInvite"));
        invite.set(&mut core, 3, &alice.agent.id().to_string(), json!("writer"));
        invite.set(&mut core, 4, &alice.agent.id().to_string(), json!("reader"));
        invite.set(&mut core, 5, &bob.agent.id().to_string(), json!("reader"));

        let state = GroupState::from_core(&core).unwrap();
        assert_eq!(state.direct_role(&alice.agent.id().into(), None), Some(Role::Reader));
        assert_eq!(state.direct_role(&bob.agent.id().into(), None), None);
    }

    #[test]
    fn test_reader_does_not_downgrade_write_only() {
        let admin = Writer::new();
        let member = Writer::new();
        let mut core = CoValueCore::from_header(CoValueHeader::group(admin.agent.id()));
        let key = member.agent.id().to_string();

        admin.set(&mut core, 1, &admin.agent.id().to_string(), json!("admin"));
        admin.set(&mut core, 2, &key, json!("writeOnly"));
        admin.set(&mut core, 3, &key, json!("reader"));
        let state = GroupState::from_core(&core).unwrap();
        assert_eq!(state.direct_role(&member.agent.id().into(), None), Some(Role::WriteOnly));

        admin.set(&mut core, 4, &key, json!("writer"));
        let state = GroupState::from_core(&core).unwrap();
        assert_eq!(state.direct_role(&member.agent.id().into(), None), Some(Role::Writer));
    }
}
