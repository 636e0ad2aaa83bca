//! Graph Nodes
//!
//! This module defines the node type that lives in the node store.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::reactive::{Listener, ListenerId};
use crate::value::{Key, Value};

/// Handle to a node in the store.
///
/// A handle is an arena slot plus the generation the slot had when the node
/// was created. Once the node is destroyed the slot may be reused, and the
/// old handle stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Get the arena slot.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get the generation of the slot this handle was issued for.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Deferred setup run on the first read of a root node.
pub(crate) type Activator = Rc<dyn Fn()>;

/// One observable location in the value graph.
///
/// Only the root of a tree owns a backing [`Value`]. Every other node finds
/// its value by walking its key path down from the root, so a node's value
/// can never drift from what the root holds.
pub struct Node {
    /// Key under the parent, `None` for roots.
    key: Option<Key>,

    /// Owning node, `None` for roots.
    parent: Option<NodeId>,

    /// Backing value. Present on roots only.
    backing: Option<Value>,

    /// Child nodes, created the first time a key is read.
    children: IndexMap<Key, NodeId>,

    /// Registered listeners in registration order.
    listeners: IndexMap<ListenerId, Listener>,

    /// Rejects external writes while set.
    locked: bool,

    /// The node currently wraps a non-composite value.
    primitive: bool,

    /// Root-only hook run on first read (lazy computed values).
    activator: Option<Activator>,
}

impl Node {
    /// Create a root node owning `value`.
    pub fn root(value: Value) -> Self {
        let primitive = !value.is_composite();
        Self {
            key: None,
            parent: None,
            backing: Some(value),
            children: IndexMap::new(),
            listeners: IndexMap::new(),
            locked: false,
            primitive,
            activator: None,
        }
    }

    /// Create a child node under `parent` at `key`.
    pub fn child(parent: NodeId, key: Key, primitive: bool) -> Self {
        Self {
            key: Some(key),
            parent: Some(parent),
            backing: None,
            children: IndexMap::new(),
            listeners: IndexMap::new(),
            locked: false,
            primitive,
            activator: None,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn backing(&self) -> Option<&Value> {
        self.backing.as_ref()
    }

    pub(crate) fn backing_mut(&mut self) -> Option<&mut Value> {
        self.backing.as_mut()
    }

    pub fn child_id(&self, key: &Key) -> Option<NodeId> {
        self.children.get(key).copied()
    }

    pub fn children(&self) -> &IndexMap<Key, NodeId> {
        &self.children
    }

    pub(crate) fn insert_child(&mut self, key: Key, id: NodeId) {
        self.children.insert(key, id);
    }

    pub(crate) fn remove_child(&mut self, key: &Key) -> Option<NodeId> {
        self.children.shift_remove(key)
    }

    pub(crate) fn take_children(&mut self) -> IndexMap<Key, NodeId> {
        std::mem::take(&mut self.children)
    }

    pub fn listeners(&self) -> &IndexMap<ListenerId, Listener> {
        &self.listeners
    }

    pub(crate) fn add_listener(&mut self, listener: Listener) {
        self.listeners.insert(listener.id(), listener);
    }

    pub(crate) fn remove_listener(&mut self, id: ListenerId) -> Option<Listener> {
        self.listeners.shift_remove(&id)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive
    }

    pub(crate) fn set_primitive(&mut self, primitive: bool) {
        self.primitive = primitive;
    }

    pub(crate) fn set_activator(&mut self, activator: Activator) {
        self.activator = Some(activator);
    }

    pub(crate) fn take_activator(&mut self) -> Option<Activator> {
        self.activator.take()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("parent", &self.parent)
            .field("children", &self.children.len())
            .field("listeners", &self.listeners.len())
            .field("locked", &self.locked)
            .field("primitive", &self.primitive)
            .finish()
    }
}
