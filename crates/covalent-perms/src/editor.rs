//! Group editing: the changes an agent writes to manage members and keys.
//!
//! Every function here only *computes* changes. Each returned change is a
//! single `set` and must be written as its own transaction, in order, by the
//! acting agent (or by the invite agent for [`accept_invite`]).

use serde_json::{json, Value};

use covalent_core::crypto::new_random_key;
use covalent_core::{AgentId, AgentSecret, CoValueId, KeyId, KeySecret};

use crate::engine::Engine;
use crate::error::{PermsError, Result};
use crate::fields::{GroupField, KeyForKeyNonce, ParentLink, Principal, RevealedTo, SealNonce};
use crate::invite::Invite;
use crate::role::Role;

/// Changes of a read-key rotation.
#[derive(Debug, Clone)]
pub struct Rotation {
    pub changes: Vec<Value>,
    pub new_key: KeyId,
    /// Parents whose read key could not be resolved; the new key must be
    /// revealed to them once they are available.
    pub unresolved_parents: Vec<CoValueId>,
}

/// Changes of an `extend`, split by the group they are written to.
#[derive(Debug, Clone, Default)]
pub struct Extension {
    pub child_changes: Vec<Value>,
    pub parent_changes: Vec<Value>,
    /// The child's key could not be revealed to the parent's key yet.
    pub parent_key_pending: bool,
}

/// A single-`set` change.
pub fn set_change(key: &str, value: impl Into<Value>) -> Value {
    json!({"op": "set", "key": key, "value": value.into()})
}

fn seal_key(
    me: &AgentSecret,
    group: &CoValueId,
    key_id: &KeyId,
    secret: &KeySecret,
    to: &AgentId,
) -> Result<Value> {
    let field = GroupField::Revelation {
        key: *key_id,
        to: RevealedTo::Agent(*to),
    }
    .to_string();
    let nonce = SealNonce { group, field: &field };
    let sealed = me.seal(secret.as_bytes(), &to.sealer, &nonce)?;
    Ok(set_change(&field, sealed.to_string()))
}

fn encrypt_key_for_key(key_id: &KeyId, secret: &KeySecret, with_id: &KeyId, with: &KeySecret) -> Result<Value> {
    let field = GroupField::Revelation {
        key: *key_id,
        to: RevealedTo::Key(*with_id),
    }
    .to_string();
    let nonce = KeyForKeyNonce {
        encrypted_id: key_id,
        encrypting_id: with_id,
    };
    let encrypted = with.encrypt(secret.as_bytes(), &nonce)?;
    Ok(set_change(&field, encrypted.to_string()))
}

fn reveal_to_everyone(key_id: &KeyId, secret: &KeySecret) -> Value {
    let field = GroupField::Revelation {
        key: *key_id,
        to: RevealedTo::Everyone,
    }
    .to_string();
    set_change(&field, secret.to_string())
}

fn require_admin(engine: &Engine<'_>, group: &CoValueId, me: &AgentSecret) -> Result<()> {
    engine.require_group(group)?;
    if engine.is_admin(group, &me.id()) {
        Ok(())
    } else {
        Err(PermsError::Unauthorized(format!("{} is not an admin of {group}", me.id())))
    }
}

/// First changes of a new group or account: `me` becomes admin and receives
/// a fresh read key.
pub fn initial_group_changes(me: &AgentSecret, group: &CoValueId) -> Result<Vec<Value>> {
    let (key_id, secret) = new_random_key();
    Ok(vec![
        set_change(&me.id().to_string(), Role::Admin.as_str()),
        seal_key(me, group, &key_id, &secret, &me.id())?,
        set_change(crate::fields::READ_KEY, key_id.to_string()),
    ])
}

/// Changes that give a fresh write key to a writeOnly principal.
///
/// The write key is revealed to the member and to the current read key, so
/// readers can read the member's writes while the member cannot read theirs.
fn write_key_changes(
    me: &AgentSecret,
    group: &CoValueId,
    principal: &Principal,
    read_key: &(KeyId, KeySecret),
) -> Result<Vec<Value>> {
    let (write_id, write_secret) = new_random_key();
    let mut changes = Vec::with_capacity(3);
    match principal {
        Principal::Agent(agent) => changes.push(seal_key(me, group, &write_id, &write_secret, agent)?),
        Principal::Everyone => changes.push(reveal_to_everyone(&write_id, &write_secret)),
    }
    changes.push(set_change(
        &GroupField::WriteKeyFor(*principal).to_string(),
        write_id.to_string(),
    ));
    changes.push(encrypt_key_for_key(&write_id, &write_secret, &read_key.0, &read_key.1)?);
    Ok(changes)
}

/// Grant `role` to `principal`, revealing the keys that role needs.
pub fn add_member(
    engine: &Engine<'_>,
    me: &AgentSecret,
    group: &CoValueId,
    principal: Principal,
    role: Role,
) -> Result<Vec<Value>> {
    require_admin(engine, group, me)?;
    if role.is_invite() || role == Role::Revoked {
        return Err(PermsError::InvalidRole(format!("{role} cannot be granted directly")));
    }
    if principal == Principal::Everyone && !role.allowed_for_everyone() {
        return Err(PermsError::InvalidRole(format!("everyone cannot be {role}")));
    }

    let state = engine.require_group(group)?;
    let current = state.direct_role(&principal, None);
    if current == Some(Role::Admin) && role != Role::Admin {
        return Err(PermsError::Unauthorized("admins cannot be demoted".into()));
    }
    if current == Some(Role::WriteOnly) && role == Role::Reader {
        return Err(PermsError::InvalidRole("reader does not replace writeOnly".into()));
    }

    let read_key = engine.read_key(group, me)?;
    let mut changes = vec![set_change(&principal.to_string(), role.as_str())];
    match (role, &principal) {
        (Role::WriteOnly, _) => changes.extend(write_key_changes(me, group, &principal, &read_key)?),
        (_, Principal::Agent(agent)) => changes.push(seal_key(me, group, &read_key.0, &read_key.1, agent)?),
        (_, Principal::Everyone) => changes.push(reveal_to_everyone(&read_key.0, &read_key.1)),
    }
    Ok(changes)
}

/// Revoke `principal` and rotate the read key so later content is hidden from it.
pub fn remove_member(
    engine: &Engine<'_>,
    me: &AgentSecret,
    group: &CoValueId,
    principal: Principal,
) -> Result<Rotation> {
    require_admin(engine, group, me)?;
    let state = engine.require_group(group)?;
    if state.direct_role(&principal, None) == Some(Role::Admin) {
        return Err(PermsError::Unauthorized("admins cannot be removed".into()));
    }
    let mut rotation = rotate_read_key(engine, me, group, &[principal])?;
    rotation
        .changes
        .insert(0, set_change(&principal.to_string(), Role::Revoked.as_str()));
    Ok(rotation)
}

/// Generate a new read key and reveal it to every remaining principal that
/// may read, to the parents' keys, and chain the old key to it.
///
/// `excluded` principals are treated as already revoked.
pub fn rotate_read_key(
    engine: &Engine<'_>,
    me: &AgentSecret,
    group: &CoValueId,
    excluded: &[Principal],
) -> Result<Rotation> {
    require_admin(engine, group, me)?;
    let state = engine.require_group(group)?;
    let (old_id, old_secret) = engine.read_key(group, me)?;
    let (new_id, new_secret) = new_random_key();
    let mut changes = Vec::new();

    for (principal, role) in state.members() {
        if excluded.contains(&principal) {
            continue;
        }
        let receives_read_key = role.can_read() || matches!(role, Role::AdminInvite | Role::WriterInvite | Role::ReaderInvite);
        if receives_read_key {
            match &principal {
                Principal::Agent(agent) => changes.push(seal_key(me, group, &new_id, &new_secret, agent)?),
                Principal::Everyone => changes.push(reveal_to_everyone(&new_id, &new_secret)),
            }
        }
        if matches!(role, Role::WriteOnly | Role::WriteOnlyInvite) {
            let Some(write_id) = state.write_key_id_for(&principal) else {
                continue;
            };
            match engine.get_key(group, &write_id, me) {
                Some(write_secret) => {
                    changes.push(encrypt_key_for_key(&write_id, &write_secret, &new_id, &new_secret)?)
                }
                None => tracing::warn!(group = %group, key = %write_id, "write key not resolvable during rotation"),
            }
        }
    }

    changes.push(encrypt_key_for_key(&old_id, &old_secret, &new_id, &new_secret)?);

    let mut unresolved_parents = Vec::new();
    for (parent, link) in state.parents(None) {
        if link == ParentLink::Revoked {
            continue;
        }
        match engine.read_key(&parent, me) {
            Ok((parent_id, parent_secret)) => {
                changes.push(encrypt_key_for_key(&new_id, &new_secret, &parent_id, &parent_secret)?)
            }
            Err(e) => {
                tracing::debug!(group = %group, parent = %parent, error = %e, "parent key unavailable during rotation");
                unresolved_parents.push(parent);
            }
        }
    }

    changes.push(set_change(crate::fields::READ_KEY, new_id.to_string()));
    Ok(Rotation {
        changes,
        new_key: new_id,
        unresolved_parents,
    })
}

/// Make `child` inherit from `parent` through `link`.
pub fn extend(
    engine: &Engine<'_>,
    me: &AgentSecret,
    child: &CoValueId,
    parent: &CoValueId,
    link: ParentLink,
) -> Result<Extension> {
    require_admin(engine, child, me)?;
    engine.require_group(parent)?;
    if child == parent || engine.parent_closure(parent, None).contains(child) {
        return Err(PermsError::InvalidExtension(format!("{child} cannot extend {parent}")));
    }

    let mut extension = Extension::default();
    extension
        .child_changes
        .push(set_change(&GroupField::Parent(*parent).to_string(), link.as_str()));

    let (child_key_id, child_key) = engine.read_key(child, me)?;
    match engine.read_key(parent, me) {
        Ok((parent_key_id, parent_key)) => extension.child_changes.push(encrypt_key_for_key(
            &child_key_id,
            &child_key,
            &parent_key_id,
            &parent_key,
        )?),
        Err(_) => extension.parent_key_pending = true,
    }

    if engine.is_admin(parent, &me.id()) {
        extension
            .parent_changes
            .push(set_change(&GroupField::Child(*child).to_string(), "extend"));
    }
    Ok(extension)
}

/// Revelations an admin can add to repair a group: the current read key for
/// everyone when everyone may read, and for parents that lack it.
///
/// Returns no changes when `me` is not an admin or nothing is missing.
pub fn heal(engine: &Engine<'_>, me: &AgentSecret, group: &CoValueId) -> Result<Vec<Value>> {
    if !engine.is_admin(group, &me.id()) {
        return Ok(Vec::new());
    }
    let missing = engine.missing_revelations(group, me)?;
    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let (key_id, secret) = engine.read_key(group, me)?;
    let mut changes = Vec::new();
    if missing.everyone {
        changes.push(reveal_to_everyone(&key_id, &secret));
    }
    for parent in missing.parent_keys {
        let (parent_id, parent_secret) = engine.read_key(&parent, me)?;
        changes.push(encrypt_key_for_key(&key_id, &secret, &parent_id, &parent_secret)?);
    }
    Ok(changes)
}

/// Mint an invite granting `role`. The returned changes are written by `me`.
pub fn create_invite(
    engine: &Engine<'_>,
    me: &AgentSecret,
    group: &CoValueId,
    role: Role,
) -> Result<(Invite, Vec<Value>)> {
    require_admin(engine, group, me)?;
    let invite_role = role
        .invite()
        .ok_or_else(|| PermsError::InvalidRole(format!("{role} cannot be invited")))?;

    let secret = AgentSecret::generate();
    let invite_agent = Principal::Agent(secret.id());
    let read_key = engine.read_key(group, me)?;

    let mut changes = vec![set_change(&invite_agent.to_string(), invite_role.as_str())];
    if role == Role::WriteOnly {
        changes.extend(write_key_changes(me, group, &invite_agent, &read_key)?);
    } else {
        changes.push(seal_key(me, group, &read_key.0, &read_key.1, &secret.id())?);
    }

    let invite = Invite {
        group: *group,
        role,
        secret,
    };
    Ok((invite, changes))
}

/// Changes the invite agent writes to admit `redeemer`.
///
/// Returns no changes if `redeemer` already holds a role.
pub fn accept_invite(engine: &Engine<'_>, invite: &Invite, redeemer: &AgentId) -> Result<Vec<Value>> {
    let group = &invite.group;
    let state = engine.require_group(group)?;
    let invite_agent = invite.secret.id();

    let held = state.direct_role(&Principal::Agent(invite_agent), None);
    if held.is_none() || held != invite.role.invite() {
        return Err(PermsError::InvalidInvite(format!("invite for {group} is not valid")));
    }
    match state.direct_role(&Principal::Agent(*redeemer), None) {
        Some(Role::Revoked) => {
            return Err(PermsError::Unauthorized(format!("{redeemer} was revoked from {group}")))
        }
        Some(_) => return Ok(Vec::new()),
        None => {}
    }
    if state.invite_used(&invite_agent) {
        return Err(PermsError::InvalidInvite("invite already used".into()));
    }

    let mut changes = vec![set_change(&redeemer.to_string(), invite.role.as_str())];
    if invite.role == Role::WriteOnly {
        let invite_principal = Principal::Agent(invite_agent);
        let write_id = state
            .write_key_id_for(&invite_principal)
            .ok_or_else(|| PermsError::InvalidInvite("invite has no write key".into()))?;
        let write_secret = engine
            .get_key(group, &write_id, &invite.secret)
            .ok_or(PermsError::KeyUnavailable { group: *group, key: write_id })?;
        changes.push(set_change(
            &GroupField::WriteKeyFor(Principal::Agent(*redeemer)).to_string(),
            write_id.to_string(),
        ));
        changes.push(seal_key(&invite.secret, group, &write_id, &write_secret, redeemer)?);
    } else {
        let (key_id, secret) = engine.read_key(group, &invite.secret)?;
        changes.push(seal_key(&invite.secret, group, &key_id, &secret, redeemer)?);
    }
    Ok(changes)
}
