//! Node Store
//!
//! The store is an arena of nodes indexed by [`NodeId`]. Parent and child
//! links are handles into the arena rather than owning pointers, so the tree
//! of observables carries no reference cycles.
//!
//! # Resolution
//!
//! A node's value is resolved by collecting the keys from the node up to its
//! root and following them down through the root's backing value. Writes go
//! through the same path, which keeps every node consistent with its root.

use super::node::{Node, NodeId};
use crate::value::{Key, Path, Value};

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of observable nodes.
pub struct NodeStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl NodeStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Add a node, reusing a free slot when one exists.
    pub fn insert(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.node = Some(node);
            return NodeId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId::new(index, 0)
    }

    /// Get a reference to a node. Stale handles resolve to `None`.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    /// Get a mutable reference to a node.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Walk parent links up to the root.
    pub fn root_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        loop {
            match self.get(current)?.parent() {
                Some(parent) => current = parent,
                None => return Some(current),
            }
        }
    }

    /// Keys leading from the root down to `id`.
    pub fn path_of(&self, id: NodeId) -> Option<Path> {
        let mut path = Path::new();
        let mut current = id;
        loop {
            let node = self.get(current)?;
            match (node.parent(), node.key()) {
                (Some(parent), Some(key)) => {
                    path.insert(0, key.clone());
                    current = parent;
                }
                _ => return Some(path),
            }
        }
    }

    /// Borrow the current value of a node. `None` when the node is stale or
    /// its key is absent from the parent's value.
    pub fn value_ref(&self, id: NodeId) -> Option<&Value> {
        let root = self.root_of(id)?;
        let path = self.path_of(id)?;
        self.get(root)?.backing()?.get_path(&path)
    }

    /// Clone the current value of a node, `Undefined` when absent.
    pub fn value_of(&self, id: NodeId) -> Value {
        self.value_ref(id).cloned().unwrap_or_default()
    }

    /// Replace the value of a node in its root's backing value.
    ///
    /// Returns `false` when the node is stale or a primitive sits on the
    /// path to it.
    pub fn write_value(&mut self, id: NodeId, value: Value) -> bool {
        let (Some(root), Some(path)) = (self.root_of(id), self.path_of(id)) else {
            return false;
        };
        let primitive = !value.is_composite();
        let written = match self.get_mut(root).and_then(Node::backing_mut) {
            Some(backing) => backing.set_path(&path, value),
            None => false,
        };
        if written {
            if let Some(node) = self.get_mut(id) {
                node.set_primitive(primitive);
            }
        }
        written
    }

    /// `key` in the form the parent's current value uses.
    fn normalize_key(&self, parent: NodeId, key: &Key) -> Key {
        match self.value_ref(parent) {
            Some(value) => key.normalized_for(value),
            None => key.normalized_for(&Value::Undefined),
        }
    }

    /// Existing child of `parent` at `key`.
    pub fn child_of(&self, parent: NodeId, key: &Key) -> Option<NodeId> {
        let normalized = self.normalize_key(parent, key);
        self.get(parent)?.child_id(&normalized)
    }

    /// Child of `parent` at `key`, created if it does not exist yet.
    ///
    /// A child is created at most once per (parent, key); later calls return
    /// the cached handle.
    pub fn ensure_child(&mut self, parent: NodeId, key: &Key) -> Option<NodeId> {
        let normalized = self.normalize_key(parent, key);
        if let Some(existing) = self.get(parent)?.child_id(&normalized) {
            return Some(existing);
        }
        let primitive = !self
            .value_ref(parent)
            .and_then(|value| value.get_key(&normalized))
            .is_some_and(Value::is_composite);
        let id = self.insert(Node::child(parent, normalized.clone(), primitive));
        if let Some(parent_node) = self.get_mut(parent) {
            parent_node.insert_child(normalized, id);
        }
        tracing::trace!(node = %id, parent = %parent, "materialized child node");
        Some(id)
    }

    /// Destroy a node and its whole subtree, detaching it from its parent.
    ///
    /// Returns the removed nodes. Their listeners are released when the
    /// caller drops them.
    pub fn destroy(&mut self, id: NodeId) -> Vec<Node> {
        let mut freed = Vec::new();
        let Some(node) = self.get(id) else {
            return freed;
        };
        if let (Some(parent), Some(key)) = (node.parent(), node.key().cloned()) {
            if let Some(parent_node) = self.get_mut(parent) {
                parent_node.remove_child(&key);
            }
        }

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(slot) = self.slots.get_mut(current.index() as usize) else {
                continue;
            };
            if slot.generation != current.generation() {
                continue;
            }
            if let Some(mut node) = slot.node.take() {
                stack.extend(node.take_children().into_values());
                self.free.push(current.index());
                self.live -= 1;
                freed.push(node);
            }
        }
        tracing::trace!(node = %id, freed = freed.len(), "destroyed node subtree");
        freed
    }

    /// A node is locked when it or any ancestor is locked.
    pub fn is_locked(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            match self.get(node_id) {
                Some(node) if node.is_locked() => return true,
                Some(node) => current = node.parent(),
                None => return false,
            }
        }
        false
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(value: serde_json::Value) -> (NodeStore, NodeId) {
        let mut store = NodeStore::new();
        let root = store.insert(Node::root(Value::from(value)));
        (store, root)
    }

    #[test]
    fn add_and_resolve_nodes() {
        let (mut store, root) = store_with(json!({"a": {"b": 1}}));
        let a = store.ensure_child(root, &Key::from("a")).unwrap();
        let b = store.ensure_child(a, &Key::from("b")).unwrap();

        assert_eq!(store.node_count(), 3);
        assert_eq!(store.value_of(b), Value::from(1));
        assert_eq!(store.root_of(b), Some(root));
        assert_eq!(
            store.path_of(b).unwrap().as_slice(),
            &[Key::from("a"), Key::from("b")]
        );
        assert!(store.get(b).unwrap().is_primitive());
        assert!(!store.get(a).unwrap().is_primitive());
    }

    #[test]
    fn ensure_child_is_cached() {
        let (mut store, root) = store_with(json!({"a": {}}));
        let first = store.ensure_child(root, &Key::from("a"));
        let second = store.ensure_child(root, &Key::from("a"));
        assert_eq!(first, second);
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn array_children_use_index_keys() {
        let (mut store, root) = store_with(json!([10, 20]));
        let by_name = store.ensure_child(root, &Key::from("1"));
        let by_index = store.ensure_child(root, &Key::Index(1));
        assert_eq!(by_name, by_index);
        assert_eq!(store.value_of(by_index.unwrap()), Value::from(20));
    }

    #[test]
    fn write_through_child_updates_root() {
        let (mut store, root) = store_with(json!({"a": {"b": 1}}));
        let a = store.ensure_child(root, &Key::from("a")).unwrap();
        let b = store.ensure_child(a, &Key::from("b")).unwrap();

        assert!(store.write_value(b, Value::from(2)));
        assert_eq!(store.value_of(root), Value::from(json!({"a": {"b": 2}})));
    }

    #[test]
    fn destroy_removes_subtree_and_invalidates_handles() {
        let (mut store, root) = store_with(json!({"a": {"b": {"c": 1}}}));
        let a = store.ensure_child(root, &Key::from("a")).unwrap();
        let b = store.ensure_child(a, &Key::from("b")).unwrap();
        let c = store.ensure_child(b, &Key::from("c")).unwrap();

        let freed = store.destroy(a);
        assert_eq!(freed.len(), 3);
        assert!(!store.contains(a));
        assert!(!store.contains(c));
        assert!(store.get(root).unwrap().children().is_empty());
        assert_eq!(store.node_count(), 1);

        // Slot reuse bumps the generation so old handles stay dead.
        let fresh = store.ensure_child(root, &Key::from("a")).unwrap();
        assert_ne!(fresh, a);
        assert!(!store.contains(a));
    }

    #[test]
    fn lock_applies_to_descendants() {
        let (mut store, root) = store_with(json!({"a": 1}));
        let a = store.ensure_child(root, &Key::from("a")).unwrap();
        assert!(!store.is_locked(a));

        store.get_mut(root).unwrap().set_locked(true);
        assert!(store.is_locked(a));
        assert!(store.is_locked(root));
    }
}
