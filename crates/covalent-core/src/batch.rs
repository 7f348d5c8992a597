//! Deferred notification for updates applied in bulk.

use std::collections::BTreeSet;

use crate::ids::CoValueId;
use crate::registry::Registry;

/// Collects the ids touched while applying a batch of content, so that each
/// CoValue's subscribers fire once when the batch closes.
#[derive(Debug, Default)]
#[must_use = "an update batch does nothing until closed"]
pub struct UpdateBatch {
    dirty: BTreeSet<CoValueId>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, id: CoValueId) {
        self.dirty.insert(id);
    }

    /// Mark `id` and every value that depends on it, transitively. Used when a
    /// group changes, since that can change what its owned values show.
    pub fn mark_with_dependents(&mut self, id: CoValueId, registry: &Registry) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.dirty.insert(current) || current == id {
                for dependent in registry.dependents_of(&current) {
                    if !self.dirty.contains(&dependent) {
                        stack.push(dependent);
                    }
                }
            }
        }
    }

    pub fn contains(&self, id: &CoValueId) -> bool {
        self.dirty.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CoValueId> {
        self.dirty.iter()
    }

    /// Notify each marked value once. Returns the notified ids.
    pub fn close(self, registry: &Registry) -> Vec<CoValueId> {
        let ids: Vec<CoValueId> = self.dirty.into_iter().collect();
        for id in &ids {
            if let Some(core) = registry.get(id) {
                core.notify();
            }
        }
        ids
    }
}
