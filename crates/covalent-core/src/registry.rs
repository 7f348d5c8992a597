//! The set of CoValues a node holds, and dependency traversal over them.

use std::collections::{HashMap, HashSet};

use crate::co_value::CoValueCore;
use crate::header::CoValueHeader;
use crate::ids::CoValueId;

/// All CoValues known to a node, by id.
#[derive(Debug, Default)]
pub struct Registry {
    values: HashMap<CoValueId, CoValueCore>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CoValueId) -> Option<&CoValueCore> {
        self.values.get(id)
    }

    pub fn get_mut(&mut self, id: &CoValueId) -> Option<&mut CoValueCore> {
        self.values.get_mut(id)
    }

    pub fn contains(&self, id: &CoValueId) -> bool {
        self.values.contains_key(id)
    }

    /// Get the core for `id`, creating an empty one if needed.
    pub fn get_or_insert_empty(&mut self, id: CoValueId) -> &mut CoValueCore {
        self.values.entry(id).or_insert_with(|| CoValueCore::new_empty(id))
    }

    /// Insert a freshly created value. An existing core with the same id is
    /// kept (headers are content-addressed) and given the header if empty.
    pub fn insert_header(&mut self, header: CoValueHeader) -> &mut CoValueCore {
        let id = header.id();
        let core = self.get_or_insert_empty(id);
        if !core.is_available() {
            // The id was derived from this very header, so this cannot mismatch.
            let _ = core.provide_header(header, None);
        }
        core
    }

    pub fn is_available(&self, id: &CoValueId) -> bool {
        self.values.get(id).is_some_and(CoValueCore::is_available)
    }

    pub fn ids(&self) -> impl Iterator<Item = &CoValueId> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `id` and its transitive dependencies, dependencies first and `id` last.
    ///
    /// Each value appears once; cycles are cut at the first revisit. Unknown
    /// or unavailable values are included but not expanded.
    pub fn with_dependencies(&self, id: &CoValueId) -> Vec<CoValueId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (node, children already pushed)
        let mut stack = vec![(*id, false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if !visited.insert(current) {
                continue;
            }
            stack.push((current, true));
            let deps = self.values.get(&current).map(CoValueCore::dependencies).unwrap_or_default();
            for dep in deps.into_iter().rev() {
                if !visited.contains(&dep) {
                    stack.push((dep, false));
                }
            }
        }
        order
    }

    /// True if `id` and every dependency are available and none is streaming.
    pub fn is_completely_downloaded(&self, id: &CoValueId) -> bool {
        self.with_dependencies(id).iter().all(|dep| {
            self.values
                .get(dep)
                .is_some_and(|core| core.is_available() && !core.is_streaming())
        })
    }

    /// Values that directly depend on `id`.
    pub fn dependents_of(&self, id: &CoValueId) -> Vec<CoValueId> {
        self.values
            .values()
            .filter(|core| core.dependencies().contains(id))
            .map(CoValueCore::id)
            .collect()
    }

    /// Every available value, each after its dependencies.
    pub fn available_ids_in_dependency_order(&self) -> Vec<CoValueId> {
        let mut roots: Vec<CoValueId> = self
            .values
            .values()
            .filter(|core| core.is_available())
            .map(CoValueCore::id)
            .collect();
        roots.sort();

        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for root in roots {
            for id in self.with_dependencies(&root) {
                if self.is_available(&id) && seen.insert(id) {
                    order.push(id);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::header::CoValueType;

    #[test]
    fn test_dependencies_come_first() {
        let admin = AgentSecret::generate().id();
        let mut registry = Registry::new();

        let group = CoValueHeader::group(admin);
        let group_id = group.id();
        registry.insert_header(group);
        let map = CoValueHeader::owned_by(CoValueType::Map, group_id, None);
        let map_id = map.id();
        registry.insert_header(map);

        assert_eq!(registry.with_dependencies(&map_id), vec![group_id, map_id]);
        assert_eq!(registry.dependents_of(&group_id), vec![map_id]);
        assert_eq!(registry.available_ids_in_dependency_order(), vec![group_id, map_id]);
    }

    #[test]
    fn test_missing_dependency_blocks_completion() {
        let mut registry = Registry::new();
        let map = CoValueHeader::owned_by(CoValueType::Map, CoValueId([5; 20]), None);
        let map_id = map.id();
        registry.insert_header(map);

        assert_eq!(registry.with_dependencies(&map_id).len(), 2);
        assert!(!registry.is_completely_downloaded(&map_id));
    }
}
