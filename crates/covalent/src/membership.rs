//! Group membership: roles, key rotation, extension, invites and healing.
//!
//! Every operation computes its changes with the permission editor against a
//! fresh [`Engine`] and writes them as trusting group transactions.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use covalent_core::{CoValueId, SessionId, UpdateBatch};
use covalent_perms::{editor, Engine, Invite, ParentLink, Principal, Role, Rotation};

use crate::error::{NodeError, Result};
use crate::load::LoadOutcome;
use crate::node::{LocalNode, NodeInner, NodeState};

impl NodeInner {
    fn apply_rotation(
        &self,
        state: &mut NodeState,
        batch: &mut UpdateBatch,
        group: &CoValueId,
        rotation: Rotation,
    ) -> Result<()> {
        debug!(group = %group, key = %rotation.new_key, "rotated read key");
        if !rotation.unresolved_parents.is_empty() {
            state.pending_heals.insert(*group);
        }
        self.write_group_changes(state, batch, group, rotation.changes, None)
    }

    /// Rotate every group below `group` that this agent administers.
    fn rotate_descendants(&self, state: &mut NodeState, batch: &mut UpdateBatch, group: &CoValueId) -> Result<()> {
        let me = self.agent.id();
        let mut visited = HashSet::from([*group]);
        let mut queue = children_of(state, group);
        while let Some(child) = queue.pop() {
            if !visited.insert(child) {
                continue;
            }
            let rotation = {
                let engine = Engine::new(&state.registry);
                if !engine.is_admin(&child, &me) {
                    debug!(child = %child, "not an admin of child group; leaving its key");
                    continue;
                }
                editor::rotate_read_key(&engine, &self.agent, &child, &[])
            };
            match rotation {
                Ok(rotation) => self.apply_rotation(state, batch, &child, rotation)?,
                Err(e) => warn!(child = %child, error = %e, "child rotation failed"),
            }
            queue.extend(children_of(state, &child));
        }
        Ok(())
    }

    /// Write missing key revelations for groups touched by this update.
    ///
    /// Candidates are pending heals, changed groups and the children of
    /// changed groups. Only groups this agent administers are healed.
    pub(crate) fn maintain_groups(&self, state: &mut NodeState, changed: &[CoValueId], batch: &mut UpdateBatch) {
        let me = self.agent.id();
        let mut candidates: BTreeSet<CoValueId> = state.pending_heals.iter().copied().collect();
        {
            let engine = Engine::new(&state.registry);
            for id in changed {
                if let Some(group) = engine.group(id) {
                    candidates.insert(*id);
                    candidates.extend(group.children());
                }
            }
        }

        for group in candidates {
            let (changes, unresolved) = {
                let engine = Engine::new(&state.registry);
                if !engine.is_admin(&group, &me) {
                    state.pending_heals.remove(&group);
                    continue;
                }
                let missing = match engine.missing_revelations(&group, &self.agent) {
                    Ok(missing) => missing,
                    Err(e) => {
                        debug!(group = %group, error = %e, "cannot check revelations yet");
                        continue;
                    }
                };
                let changes = if missing.is_empty() {
                    Ok(Vec::new())
                } else {
                    editor::heal(&engine, &self.agent, &group)
                };
                (changes, !missing.unresolved_parents.is_empty())
            };

            if unresolved {
                state.pending_heals.insert(group);
            } else {
                state.pending_heals.remove(&group);
            }
            match changes {
                Ok(changes) if !changes.is_empty() => {
                    debug!(group = %group, revelations = changes.len(), "healing group");
                    if let Err(e) = self.write_group_changes(state, batch, &group, changes, None) {
                        warn!(group = %group, error = %e, "failed to write healing revelations");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(group = %group, error = %e, "heal failed"),
            }
        }
    }
}

fn children_of(state: &NodeState, group: &CoValueId) -> Vec<CoValueId> {
    Engine::new(&state.registry)
        .group(group)
        .map(|group| group.children())
        .unwrap_or_default()
}

impl LocalNode {
    /// Grant `role` in `group`. Admins cannot be demoted.
    pub fn add_member(&self, group: &CoValueId, principal: Principal, role: Role) -> Result<()> {
        self.inner.update(|inner, state, batch| {
            let changes = editor::add_member(&Engine::new(&state.registry), &inner.agent, group, principal, role)?;
            inner.write_group_changes(state, batch, group, changes, None)
        })
    }

    /// Revoke `principal` and rotate the read key of `group` and of every
    /// descendant group this agent administers.
    pub fn remove_member(&self, group: &CoValueId, principal: Principal) -> Result<()> {
        self.inner.update(|inner, state, batch| {
            let rotation = editor::remove_member(&Engine::new(&state.registry), &inner.agent, group, principal)?;
            inner.apply_rotation(state, batch, group, rotation)?;
            inner.rotate_descendants(state, batch, group)
        })
    }

    /// Replace the read key of `group`, and of its administered
    /// descendants, without changing membership.
    pub fn rotate_read_key(&self, group: &CoValueId) -> Result<()> {
        self.inner.update(|inner, state, batch| {
            let rotation = editor::rotate_read_key(&Engine::new(&state.registry), &inner.agent, group, &[])?;
            inner.apply_rotation(state, batch, group, rotation)?;
            inner.rotate_descendants(state, batch, group)
        })
    }

    /// Make `child` inherit from `parent`.
    ///
    /// The child side needs admin rights on `child`; the parent is told
    /// about the child only when this agent also administers it.
    pub fn extend(&self, child: &CoValueId, parent: &CoValueId, link: ParentLink) -> Result<()> {
        self.inner.update(|inner, state, batch| {
            let extension = editor::extend(&Engine::new(&state.registry), &inner.agent, child, parent, link)?;
            inner.write_group_changes(state, batch, child, extension.child_changes, None)?;
            inner.write_group_changes(state, batch, parent, extension.parent_changes, None)?;
            if extension.parent_key_pending {
                debug!(child = %child, parent = %parent, "parent key unavailable; revelation deferred");
                state.pending_heals.insert(*child);
            }
            Ok(())
        })
    }

    /// Add whatever key revelations `group` is missing. Returns true if
    /// anything was written.
    pub fn heal(&self, group: &CoValueId) -> Result<bool> {
        self.inner.update(|inner, state, batch| {
            let changes = editor::heal(&Engine::new(&state.registry), &inner.agent, group)?;
            let healed = !changes.is_empty();
            inner.write_group_changes(state, batch, group, changes, None)?;
            Ok(healed)
        })
    }

    /// Mint an invite that admits its holder to `group` with `role`.
    pub fn create_invite(&self, group: &CoValueId, role: Role) -> Result<Invite> {
        self.inner.update(|inner, state, batch| {
            let (invite, changes) = editor::create_invite(&Engine::new(&state.registry), &inner.agent, group, role)?;
            inner.write_group_changes(state, batch, group, changes, None)?;
            Ok(invite)
        })
    }

    /// Redeem an invite for this node's agent. The group is loaded first;
    /// the grant is written by the invite's own agent in a fresh session.
    pub async fn accept_invite(&self, invite: &Invite) -> Result<()> {
        if self.load(&invite.group).await? != LoadOutcome::Available {
            return Err(NodeError::Unavailable(invite.group));
        }
        self.inner.update(|inner, state, batch| {
            let changes = editor::accept_invite(&Engine::new(&state.registry), invite, &inner.agent.id())?;
            if changes.is_empty() {
                debug!(group = %invite.group, "already a member; invite not used");
                return Ok(());
            }
            let session = SessionId::new_random(invite.secret.id());
            inner.write_group_changes(state, batch, &invite.group, changes, Some((&invite.secret, &session)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use covalent_core::AgentSecret;
    use covalent_perms::PermsError;

    fn node() -> LocalNode {
        LocalNode::new(AgentSecret::generate(), NodeConfig::default(), None)
    }

    fn read_key_of(node: &LocalNode, group: &CoValueId) -> Option<covalent_core::KeyId> {
        let state = node.inner.lock_state();
        Engine::new(&state.registry).group(group).and_then(|g| g.read_key_id())
    }

    #[tokio::test]
    async fn test_add_and_remove_member() {
        let node = node();
        let group = node.create_group().unwrap();
        let friend = Principal::Agent(AgentSecret::generate().id());

        node.add_member(&group, friend, Role::Writer).unwrap();
        assert_eq!(node.role_of(&group, &friend), Some(Role::Writer));

        let before = read_key_of(&node, &group);
        node.remove_member(&group, friend).unwrap();
        assert_eq!(node.role_of(&group, &friend), Some(Role::Revoked));
        assert_ne!(read_key_of(&node, &group), before);
    }

    #[tokio::test]
    async fn test_admins_cannot_be_removed_or_demoted() {
        let node = node();
        let group = node.create_group().unwrap();
        let me = Principal::Agent(node.agent_id());
        assert!(matches!(
            node.remove_member(&group, me),
            Err(NodeError::Perms(PermsError::Unauthorized(_)))
        ));
        assert!(node.add_member(&group, me, Role::Reader).is_err());
        assert_eq!(node.role_of(&group, &me), Some(Role::Admin));
    }

    #[tokio::test]
    async fn test_removal_rotates_descendants() {
        let node = node();
        let parent = node.create_group().unwrap();
        let child = node.create_group().unwrap();
        let grandchild = node.create_group().unwrap();
        node.extend(&child, &parent, ParentLink::Extend).unwrap();
        node.extend(&grandchild, &child, ParentLink::Extend).unwrap();

        let reader = Principal::Agent(AgentSecret::generate().id());
        node.add_member(&parent, reader, Role::Reader).unwrap();
        assert_eq!(node.role_of(&grandchild, &reader), Some(Role::Reader));

        let child_key = read_key_of(&node, &child);
        let grandchild_key = read_key_of(&node, &grandchild);
        node.remove_member(&parent, reader).unwrap();

        assert_ne!(read_key_of(&node, &child), child_key);
        assert_ne!(read_key_of(&node, &grandchild), grandchild_key);
        assert!(!node.role_of(&grandchild, &reader).is_some_and(|r| r.can_read()));
    }

    #[tokio::test]
    async fn test_content_stays_readable_after_rotation() {
        let node = node();
        let group = node.create_group().unwrap();
        let map = node.create_map(&group).unwrap();
        node.map_set(&map, "before", serde_json::json!(1)).unwrap();
        node.rotate_read_key(&group).unwrap();
        node.map_set(&map, "after", serde_json::json!(2)).unwrap();

        let content = node.map(&map).unwrap();
        assert!(!content.has_unavailable());
        assert_eq!(content.to_json(), serde_json::json!({"before": 1, "after": 2}));
    }

    #[tokio::test]
    async fn test_extension_cycles_are_rejected() {
        let node = node();
        let a = node.create_group().unwrap();
        let b = node.create_group().unwrap();
        node.extend(&a, &b, ParentLink::Extend).unwrap();
        assert!(node.extend(&b, &a, ParentLink::Extend).is_err());
        assert!(node.extend(&a, &a, ParentLink::Extend).is_err());
    }

    #[tokio::test]
    async fn test_heal_is_a_no_op_for_complete_groups() {
        let node = node();
        let group = node.create_group().unwrap();
        node.add_member(&group, Principal::Everyone, Role::Reader).unwrap();
        assert!(!node.heal(&group).unwrap());
    }

    #[tokio::test]
    async fn test_invite_round_trip_on_one_node() {
        let node = node();
        let group = node.create_group().unwrap();
        let invite = node.create_invite(&group, Role::Writer).unwrap();
        let parsed: Invite = invite.to_string().parse().unwrap();
        assert_eq!(parsed.group, group);

        // Already an admin; redeeming writes nothing.
        node.accept_invite(&parsed).await.unwrap();
        assert_eq!(node.role_of(&group, &Principal::Agent(node.agent_id())), Some(Role::Admin));
    }
}
