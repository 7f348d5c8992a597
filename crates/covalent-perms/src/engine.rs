//! Role resolution, valid-transaction filtering and key resolution.
//!
//! An [`Engine`] is a read-only view over a [`Registry`]. It folds each group
//! at most once per view, so it is cheap to create one per operation and
//! should not be kept across mutations.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::Value;

use covalent_core::{
    parse_changes, AgentId, AgentSecret, CoValueId, KeyId, KeySecret, Registry, Ruleset,
    Transaction, TransactionId,
};

use crate::error::{PermsError, Result};
use crate::fields::{GroupField, KeyForKeyNonce, ParentLink, Principal, RevealedTo, SealNonce};
use crate::group::GroupState;
use crate::role::{is_more_permissive_and_should_inherit, Role};

/// A transaction admitted by the permission rules, with its changes decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TransactionId,
    pub made_at: u64,
    pub changes: Vec<Value>,
}

/// A valid transaction whose key is not available to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnavailableTransaction {
    pub tx_id: TransactionId,
    pub made_at: u64,
    pub key_used: KeyId,
}

/// Output of [`Engine::valid_transactions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidTransactions {
    /// Sorted by `(made_at, tx_id)`.
    pub transactions: Vec<DecryptedTransaction>,
    pub unavailable: Vec<UnavailableTransaction>,
}

/// Read-only permission view over a registry.
pub struct Engine<'a> {
    registry: &'a Registry,
    groups: RefCell<HashMap<CoValueId, Option<Rc<GroupState>>>>,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            groups: RefCell::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Folded state of a group or account, if available.
    pub fn group(&self, id: &CoValueId) -> Option<Rc<GroupState>> {
        if let Some(cached) = self.groups.borrow().get(id) {
            return cached.clone();
        }
        let state = self.registry.get(id).and_then(GroupState::from_core).map(Rc::new);
        self.groups.borrow_mut().insert(*id, state.clone());
        state
    }

    /// Like [`Engine::group`], but an error when the value is missing or not a group.
    pub fn require_group(&self, id: &CoValueId) -> Result<Rc<GroupState>> {
        match self.registry.get(id) {
            Some(core) if core.is_available() => self.group(id).ok_or(PermsError::NotAGroup(*id)),
            _ => Err(PermsError::GroupUnavailable(*id)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Roles
    // ─────────────────────────────────────────────────────────────────────────

    /// Effective role of `principal` in `group`, optionally as of `at`.
    ///
    /// A direct `revoked` entry wins. Otherwise parent roles are folded in
    /// through `extend` or delegated links, and `everyone` is the fallback.
    pub fn role_of(&self, group: &CoValueId, principal: &Principal, at: Option<u64>) -> Option<Role> {
        let order = self.parent_closure(group, at);
        let mut resolved: HashMap<CoValueId, Option<Role>> = HashMap::new();

        for id in order {
            let role = self.group(&id).and_then(|state| {
                let direct = state.direct_role(principal, at);
                if direct == Some(Role::Revoked) {
                    return None;
                }
                let mut role = direct;
                for (parent, link) in state.parents(at) {
                    let Some(parent_role) = resolved.get(&parent).copied().flatten() else {
                        continue;
                    };
                    let inherited = match link {
                        ParentLink::Extend => parent_role,
                        ParentLink::Delegate(delegated) => delegated,
                        ParentLink::Revoked => continue,
                    };
                    if is_more_permissive_and_should_inherit(inherited, role) {
                        role = Some(inherited);
                    }
                }
                role.or_else(|| match principal {
                    Principal::Agent(_) => state
                        .direct_role(&Principal::Everyone, at)
                        .filter(|r| *r != Role::Revoked),
                    Principal::Everyone => None,
                })
            });
            resolved.insert(id, role);
        }

        resolved.get(group).copied().flatten()
    }

    /// `group` and its parent groups as of `at`, parents before children.
    pub(crate) fn parent_closure(&self, group: &CoValueId, at: Option<u64>) -> Vec<CoValueId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(*group, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(state) = self.group(&id) {
                for (parent, link) in state.parents(at) {
                    if link != ParentLink::Revoked && !visited.contains(&parent) {
                        stack.push((parent, false));
                    }
                }
            }
        }
        order
    }

    /// Owning group of a value, or the value itself for groups and accounts.
    pub fn governing_group(&self, id: &CoValueId) -> Option<CoValueId> {
        let header = self.registry.get(id)?.header()?;
        if header.is_group_like() {
            Some(*id)
        } else {
            header.owner_group()
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Valid transactions
    // ─────────────────────────────────────────────────────────────────────────

    /// Ids of the transactions of `id` that the permission rules admit.
    pub fn determine_valid_transactions(&self, id: &CoValueId) -> Vec<TransactionId> {
        let Some(core) = self.registry.get(id) else {
            return Vec::new();
        };
        let Some(verified) = core.verified() else {
            return Vec::new();
        };
        match &verified.header().ruleset {
            Ruleset::UnsafeAllowAll => verified.transactions().map(|(tx_id, _)| tx_id).collect(),
            Ruleset::Group { .. } => self
                .group(id)
                .map(|state| state.valid_transactions().iter().cloned().collect())
                .unwrap_or_default(),
            Ruleset::OwnedByGroup { group } => {
                if self.group(group).is_none() {
                    return Vec::new();
                }
                verified
                    .transactions()
                    .filter(|(tx_id, tx)| {
                        let author = Principal::Agent(*tx_id.session_id.agent());
                        self.role_of(group, &author, Some(tx.made_at()))
                            .is_some_and(|role| role.can_write())
                    })
                    .map(|(tx_id, _)| tx_id)
                    .collect()
            }
        }
    }

    /// Valid transactions of `id` decoded for `me`.
    ///
    /// Private transactions are decrypted with the key they name; those whose
    /// key `me` cannot resolve are reported as unavailable. Transactions whose
    /// changes do not parse are skipped.
    pub fn valid_transactions(&self, id: &CoValueId, me: &AgentSecret) -> ValidTransactions {
        let mut out = ValidTransactions::default();
        let Some(core) = self.registry.get(id) else {
            return out;
        };
        let key_group = self.governing_group(id);
        let mut keys: HashMap<KeyId, Option<KeySecret>> = HashMap::new();

        for tx_id in self.determine_valid_transactions(id) {
            let Some(tx) = core.verified().and_then(|v| v.transaction(&tx_id)) else {
                continue;
            };
            let changes = match tx {
                Transaction::Trusting(trusting) => trusting.changes.clone(),
                Transaction::Private(private) => {
                    let key = keys.entry(private.key_used).or_insert_with(|| {
                        key_group.and_then(|group| self.get_key(&group, &private.key_used, me))
                    });
                    let Some(key) = key else {
                        out.unavailable.push(UnavailableTransaction {
                            tx_id,
                            made_at: private.made_at,
                            key_used: private.key_used,
                        });
                        continue;
                    };
                    match private.decrypt(key, id, &tx_id) {
                        Ok(changes) => changes,
                        Err(e) => {
                            tracing::warn!(id = %id, tx = %tx_id, error = %e, "failed to decrypt transaction");
                            continue;
                        }
                    }
                }
            };
            match parse_changes(&changes) {
                Ok(changes) => out.transactions.push(DecryptedTransaction {
                    tx_id,
                    made_at: tx.made_at(),
                    changes,
                }),
                Err(e) => {
                    tracing::warn!(id = %id, tx = %tx_id, error = %e, "skipping malformed changes");
                }
            }
        }

        out.transactions
            .sort_by(|a, b| (a.made_at, &a.tx_id).cmp(&(b.made_at, &b.tx_id)));
        out
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keys
    // ─────────────────────────────────────────────────────────────────────────

    /// Current read key of `group` as seen by `me`.
    pub fn read_key(&self, group: &CoValueId, me: &AgentSecret) -> Result<(KeyId, KeySecret)> {
        let state = self.require_group(group)?;
        let key_id = state.read_key_id().ok_or(PermsError::NoReadKey(*group))?;
        let secret = self
            .get_key(group, &key_id, me)
            .ok_or(PermsError::KeyUnavailable { group: *group, key: key_id })?;
        Ok((key_id, secret))
    }

    /// Key `me` should encrypt new content with: the personal write key for
    /// writeOnly members, the current read key otherwise.
    pub fn write_key(&self, group: &CoValueId, me: &AgentSecret) -> Result<(KeyId, KeySecret)> {
        let state = self.require_group(group)?;
        let principal = Principal::Agent(me.id());
        if self.role_of(group, &principal, None) == Some(Role::WriteOnly) {
            let key_id = state
                .write_key_id_for(&principal)
                .or_else(|| state.write_key_id_for(&Principal::Everyone))
                .ok_or_else(|| PermsError::Unauthorized(format!("no write key for {} in {group}", me.id())))?;
            let secret = self
                .get_key(group, &key_id, me)
                .ok_or(PermsError::KeyUnavailable { group: *group, key: key_id })?;
            return Ok((key_id, secret));
        }
        self.read_key(group, me)
    }

    /// Resolve key `key` of `group` for `me`.
    ///
    /// Tries, per (group, key): a revelation sealed to `me`, a plaintext
    /// revelation to everyone, then any revelation encrypted with another key
    /// of this group or one of its parents. Traversal is iterative and each
    /// (group, key) pair is visited once.
    pub fn get_key(&self, group: &CoValueId, key: &KeyId, me: &AgentSecret) -> Option<KeySecret> {
        type Node = (CoValueId, KeyId);

        let mut resolved: HashMap<Node, KeySecret> = HashMap::new();
        let mut visited: HashSet<Node> = HashSet::new();
        let mut stack: Vec<(Node, bool)> = vec![((*group, *key), false)];

        while let Some((node, expanded)) = stack.pop() {
            let (node_group, node_key) = node;
            let Some(state) = self.group(&node_group) else {
                continue;
            };

            if !expanded {
                if !visited.insert(node) {
                    continue;
                }
                if let Some(secret) = self.direct_key(&state, &node_key, me) {
                    if node == (*group, *key) {
                        return Some(secret);
                    }
                    resolved.insert(node, secret);
                    continue;
                }
                stack.push((node, true));
                for encrypting in key_for_key_sources(&state, &node_key) {
                    for candidate in self.key_holders(&state, &encrypting) {
                        if !visited.contains(&candidate) {
                            stack.push((candidate, false));
                        }
                    }
                }
                continue;
            }

            for encrypting in key_for_key_sources(&state, &node_key) {
                let secret = self
                    .key_holders(&state, &encrypting)
                    .into_iter()
                    .find_map(|candidate| resolved.get(&candidate).cloned());
                let Some(secret) = secret else {
                    continue;
                };
                let field = GroupField::Revelation {
                    key: node_key,
                    to: RevealedTo::Key(encrypting),
                }
                .to_string();
                let Some(decrypted) = state
                    .get(&field)
                    .and_then(|entry| decrypt_key_for_key(&entry.value, &node_key, &encrypting, &secret))
                else {
                    continue;
                };
                if node == (*group, *key) {
                    return Some(decrypted);
                }
                resolved.insert(node, decrypted);
                break;
            }
        }
        resolved.remove(&(*group, *key))
    }

    /// Groups that might hold `key`: the group itself and its parents.
    fn key_holders(&self, state: &GroupState, key: &KeyId) -> Vec<(CoValueId, KeyId)> {
        let mut holders = vec![(state.id(), *key)];
        for (parent, link) in state.parents(None) {
            if link != ParentLink::Revoked {
                holders.push((parent, *key));
            }
        }
        holders
    }

    fn direct_key(&self, state: &GroupState, key: &KeyId, me: &AgentSecret) -> Option<KeySecret> {
        let sealed_field = GroupField::Revelation {
            key: *key,
            to: RevealedTo::Agent(me.id()),
        }
        .to_string();
        if let Some(entry) = state.get(&sealed_field) {
            let sealed = entry.as_str()?.parse().ok();
            let sender = entry.author().sealer;
            let nonce = SealNonce {
                group: &state.id(),
                field: &sealed_field,
            };
            if let Some(bytes) = sealed.and_then(|sealed| me.open(&sealed, &sender, &nonce).ok()) {
                if let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    return Some(KeySecret(bytes));
                }
            }
            tracing::warn!(group = %state.id(), key = %key, "could not open sealed key revelation");
        }

        let everyone_field = GroupField::Revelation {
            key: *key,
            to: RevealedTo::Everyone,
        }
        .to_string();
        state.get(&everyone_field)?.as_str()?.parse().ok()
    }

    /// Revelations relevant to healing: what is missing for the current read key.
    pub fn missing_revelations(&self, group: &CoValueId, me: &AgentSecret) -> Result<MissingRevelations> {
        let state = self.require_group(group)?;
        let key_id = state.read_key_id().ok_or(PermsError::NoReadKey(*group))?;
        let mut missing = MissingRevelations::default();

        let everyone_reads = state
            .direct_role(&Principal::Everyone, None)
            .is_some_and(|role| role.can_read());
        if everyone_reads && !state.has_revelation(&key_id, RevealedTo::Everyone) {
            missing.everyone = true;
        }

        for (parent, link) in state.parents(None) {
            if link == ParentLink::Revoked {
                continue;
            }
            match self.read_key(&parent, me) {
                Ok((parent_key, _)) => {
                    if !state.has_revelation(&key_id, RevealedTo::Key(parent_key)) {
                        missing.parent_keys.push(parent);
                    }
                }
                Err(_) => missing.unresolved_parents.push(parent),
            }
        }
        Ok(missing)
    }

    /// Agents and principals that hold each role in `group` directly.
    pub fn members(&self, group: &CoValueId) -> Result<Vec<(Principal, Role)>> {
        Ok(self.require_group(group)?.members())
    }

    /// True if `agent` is an admin of `group`.
    pub fn is_admin(&self, group: &CoValueId, agent: &AgentId) -> bool {
        self.role_of(group, &Principal::Agent(*agent), None) == Some(Role::Admin)
    }
}

/// What an admin would have to write to heal a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingRevelations {
    /// `<readKey>_for_everyone` is absent although everyone may read.
    pub everyone: bool,
    /// Parents whose read key does not yet have `<readKey>_for_<parentKey>`.
    pub parent_keys: Vec<CoValueId>,
    /// Parents whose read key cannot be resolved locally yet.
    pub unresolved_parents: Vec<CoValueId>,
}

impl MissingRevelations {
    pub fn is_empty(&self) -> bool {
        !self.everyone && self.parent_keys.is_empty()
    }
}

/// Keys that `key` has been encrypted with in `state`.
fn key_for_key_sources(state: &GroupState, key: &KeyId) -> Vec<KeyId> {
    state
        .revelations_of(key)
        .into_iter()
        .filter_map(|(to, _)| match to {
            RevealedTo::Key(encrypting) => Some(encrypting),
            _ => None,
        })
        .collect()
}

fn decrypt_key_for_key(value: &Value, key: &KeyId, encrypting: &KeyId, secret: &KeySecret) -> Option<KeySecret> {
    let encrypted = value.as_str()?.parse().ok()?;
    let nonce = KeyForKeyNonce {
        encrypted_id: key,
        encrypting_id: encrypting,
    };
    let bytes = secret.decrypt(&encrypted, &nonce).ok()?;
    Some(KeySecret(<[u8; 32]>::try_from(bytes.as_slice()).ok()?))
}
