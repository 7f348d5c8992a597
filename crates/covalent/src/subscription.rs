//! Change subscriptions.
//!
//! A [`Subscription`] follows one value. An [`AutoloadSubscription`] follows
//! a value and everything reachable from it through id references, loading
//! referenced values as they appear. Bursts of updates coalesce into one
//! notification.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use covalent_core::{CoValueId, Unsubscribe};

use crate::load::LoadOptions;
use crate::node::LocalNode;

/// Follows changes to one value. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: CoValueId,
    versions: watch::Receiver<u64>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn id(&self) -> CoValueId {
        self.id
    }

    /// The value's version as of the last notification.
    pub fn version(&self) -> u64 {
        *self.versions.borrow()
    }

    /// Wait for the next change. Changes made since the last call are
    /// reported once.
    pub async fn changed(&mut self) -> bool {
        self.versions.changed().await.is_ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.unsubscribe();
        }
    }
}

/// What an autoload subscription currently covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoloadState {
    /// Bumped on every coalesced change.
    pub version: u64,
    /// Values reachable from the root, root included.
    pub reachable: BTreeSet<CoValueId>,
    /// The reachable values that are not available (yet).
    pub missing: BTreeSet<CoValueId>,
}

impl AutoloadState {
    /// True when the root and everything it references are available.
    pub fn is_complete(&self) -> bool {
        !self.reachable.is_empty() && self.missing.is_empty()
    }
}

/// Follows a value and everything it references, loading what is missing.
///
/// Child loads run under the subscription's cancellation token; destroying
/// the subscription cancels them.
#[derive(Debug)]
pub struct AutoloadSubscription {
    root: CoValueId,
    state: watch::Receiver<AutoloadState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AutoloadSubscription {
    pub fn root(&self) -> CoValueId {
        self.root
    }

    pub fn state(&self) -> AutoloadState {
        self.state.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.borrow().is_complete()
    }

    /// Wait for the next coalesced change. False once destroyed.
    pub async fn changed(&mut self) -> bool {
        self.state.changed().await.is_ok()
    }

    /// Wait until the root and everything it references are available.
    pub async fn loaded(&mut self) -> bool {
        loop {
            if self.is_complete() {
                return true;
            }
            if !self.changed().await {
                return false;
            }
        }
    }

    /// Stop following and cancel in-flight loads.
    pub async fn destroy(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(root = %self.root, error = %e, "autoload task failed");
            }
        }
    }
}

impl Drop for AutoloadSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl LocalNode {
    /// Subscribe to changes of `id`, whether or not it is available yet.
    pub fn subscribe(&self, id: &CoValueId) -> Subscription {
        let (sender, versions) = watch::channel(0);
        let mut state = self.inner.lock_state();
        let core = state.registry.get_or_insert_empty(*id);
        let unsubscribe = core.subscribe(move |core| {
            sender.send_replace(core.version());
        });
        Subscription {
            id: *id,
            versions,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Subscribe to `root` and everything reachable from it, loading
    /// referenced values as they are discovered. Must be called from within
    /// a Tokio runtime.
    pub fn subscribe_autoload(&self, root: &CoValueId) -> AutoloadSubscription {
        let (sender, state) = watch::channel(AutoloadState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_autoload(self.clone(), *root, sender, cancel.clone()));
        AutoloadSubscription {
            root: *root,
            state,
            cancel,
            task: Some(task),
        }
    }

    /// `root` plus every value reachable through references in available
    /// content. Iterative; cycles are cut by the visited set.
    pub fn reachable_from(&self, root: &CoValueId) -> BTreeSet<CoValueId> {
        let state = self.inner.lock_state();
        let mut visited = BTreeSet::from([*root]);
        let mut queue = vec![*root];
        while let Some(id) = queue.pop() {
            let Ok(content) = self.inner.content_in(&state, &id) else {
                continue;
            };
            for reference in content.references() {
                if visited.insert(reference) {
                    queue.push(reference);
                }
            }
        }
        visited
    }
}

async fn run_autoload(
    node: LocalNode,
    root: CoValueId,
    sender: watch::Sender<AutoloadState>,
    cancel: CancellationToken,
) {
    let wake = Arc::new(Notify::new());
    let mut listeners: HashMap<CoValueId, Unsubscribe> = HashMap::new();
    let mut requested: HashSet<CoValueId> = HashSet::new();
    let mut version = 0u64;

    loop {
        let reachable = node.reachable_from(&root);

        for id in &reachable {
            if !listeners.contains_key(id) {
                let wake = wake.clone();
                let unsubscribe = node
                    .inner
                    .lock_state()
                    .registry
                    .get_or_insert_empty(*id)
                    .subscribe(move |_| wake.notify_one());
                listeners.insert(*id, unsubscribe);
            }
            if !node.is_available(id) && requested.insert(*id) {
                trace!(root = %root, id = %id, "autoloading reference");
                let node = node.clone();
                let id = *id;
                let wake = wake.clone();
                let options = LoadOptions {
                    skip_retry: false,
                    cancel: Some(cancel.child_token()),
                };
                tokio::spawn(async move {
                    if let Err(e) = node.load_with(&id, options).await {
                        debug!(id = %id, error = %e, "autoload failed");
                    }
                    wake.notify_one();
                });
            }
        }

        let unreachable: Vec<CoValueId> = listeners.keys().filter(|id| !reachable.contains(id)).copied().collect();
        for id in unreachable {
            if let Some(unsubscribe) = listeners.remove(&id) {
                unsubscribe.unsubscribe();
            }
        }

        let missing = reachable.iter().filter(|id| !node.is_available(id)).copied().collect();
        version += 1;
        sender.send_replace(AutoloadState {
            version,
            reachable,
            missing,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
        }
    }

    for (_, unsubscribe) in listeners {
        unsubscribe.unsubscribe();
    }
    trace!(root = %root, "autoload subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use covalent_core::{AgentSecret, PeerId};
    use covalent_perms::{Principal, Role};
    use covalent_sync::{connected_pair, PeerRole};
    use serde_json::json;
    use std::time::Duration;

    fn node() -> LocalNode {
        LocalNode::new(AgentSecret::generate(), NodeConfig::default(), None)
    }

    #[tokio::test]
    async fn test_subscription_sees_local_writes() {
        let node = node();
        let group = node.create_group().unwrap();
        let map = node.create_map(&group).unwrap();
        let mut sub = node.subscribe(&map);

        node.map_set(&map, "a", json!(1)).unwrap();
        assert!(sub.changed().await);
        let first = sub.version();
        node.map_set(&map, "b", json!(2)).unwrap();
        assert!(sub.changed().await);
        assert!(sub.version() > first);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unregisters() {
        let node = node();
        let group = node.create_group().unwrap();
        let sub = node.subscribe(&group);
        let count = || node.inner.lock_state().registry.get(&group).map_or(0, |c| c.listener_count());
        assert_eq!(count(), 1);
        drop(sub);
        assert_eq!(count(), 0);
    }

    #[tokio::test]
    async fn test_reachable_values_handle_cycles() {
        let node = node();
        let group = node.create_group().unwrap();
        let a = node.create_map(&group).unwrap();
        let b = node.create_map(&group).unwrap();
        node.map_set(&a, "next", json!(b.to_string())).unwrap();
        node.map_set(&b, "next", json!(a.to_string())).unwrap();
        assert_eq!(node.reachable_from(&a), BTreeSet::from([a, b]));
    }

    #[tokio::test]
    async fn test_autoload_pulls_referenced_values() {
        let server = node();
        let client = node();
        let (to_client, to_server) = connected_pair();
        server.add_peer(PeerId::new("client"), PeerRole::Client, to_client).unwrap();
        client.add_peer(PeerId::new("server"), PeerRole::Server, to_server).unwrap();

        let group = server.create_group().unwrap();
        server.add_member(&group, Principal::Everyone, Role::Reader).unwrap();
        let leaf = server.create_list(&group).unwrap();
        server.list_append(&leaf, json!("x")).unwrap();
        let root = server.create_map(&group).unwrap();
        server.map_set(&root, "items", json!(leaf.to_string())).unwrap();

        let mut sub = client.subscribe_autoload(&root);
        let loaded = tokio::time::timeout(Duration::from_secs(5), sub.loaded()).await.unwrap();
        assert!(loaded);
        assert_eq!(sub.state().reachable, BTreeSet::from([root, leaf]));
        assert_eq!(client.list(&leaf).unwrap().values(), vec![json!("x")]);
        sub.destroy().await;
    }
}
