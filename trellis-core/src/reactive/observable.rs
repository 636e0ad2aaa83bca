//! Observable Handles
//!
//! An [`Observable`] is the accessor through which all reads and writes of
//! engine state go. It is a cheap handle (engine + node id); the value itself
//! lives in the root's backing value inside the node store.
//!
//! # Reads
//!
//! - [`Observable::get`] reads the node's value and, inside a tracking
//!   frame, records a deep dependency on it.
//! - [`Observable::get_shallow`] records a shallow dependency: only writes
//!   to the node itself and keys being added or removed will re-run the
//!   reader.
//! - [`Observable::peek`] never records anything.
//!
//! # Writes
//!
//! Writes through a locked node (or a node below a locked one) are silently
//! ignored and leave the value unchanged. Every successful write notifies
//! inside its own batch, so a write is always delivered as a unit.
//!
//! Collection helpers ([`push`](Observable::push),
//! [`map_insert`](Observable::map_insert), [`set_add`](Observable::set_add),
//! ...) report the whole collection as the new value and the untouched
//! collection as the previous one. They are delivered to optimized
//! listeners.
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Engine, ListenerMode, Value};
//!
//! let engine = Engine::new();
//! let state = engine.observable(Value::from(serde_json::json!({"a": {"b": 1}})));
//!
//! let _sub = state.on_change(ListenerMode::Deep, |event| {
//!     assert_eq!(event.changes()[0].value_at_path, Value::from(2));
//! });
//! state.child("a").child("b").set(2);
//! ```

use std::fmt;

use super::notify::ChangeEvent;
use super::runtime::Engine;
use super::subscriber::{Callback, ListenerMode, Subscription};
use crate::error::Result;
use crate::graph::NodeId;
use crate::sink::Persisted;
use crate::value::{Key, Path, Value};

/// Handle to one node of an engine's value graph.
#[derive(Clone)]
pub struct Observable {
    engine: Engine,
    id: NodeId,
}

/// Result of [`Observable::access`].
#[derive(Debug, Clone)]
pub enum Access {
    /// The key holds a composite value, exposed as its own observable.
    Child(Observable),
    /// The key holds a primitive (or nothing).
    Value(Value),
}

impl Observable {
    pub(crate) fn new(engine: Engine, id: NodeId) -> Self {
        Self { engine, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Get the current value, tracking a deep dependency.
    pub fn get(&self) -> Value {
        self.engine.read(self.id, false)
    }

    /// Get the current value, tracking a shallow dependency.
    pub fn get_shallow(&self) -> Value {
        self.engine.read(self.id, true)
    }

    /// Get the current value without tracking.
    pub fn peek(&self) -> Value {
        self.engine.peek(self.id)
    }

    /// Observable for the value at `key`.
    ///
    /// The child node is created on first access and cached; asking again
    /// for the same key returns a handle to the same node.
    pub fn child(&self, key: impl Into<Key>) -> Observable {
        let key = key.into();
        match self.engine.child(self.id, &key) {
            Some(id) => Observable::new(self.engine.clone(), id),
            // Stale parent: hand back an equally stale handle.
            None => self.clone(),
        }
    }

    /// Tracked read of `key`. Composite values come back as a child
    /// observable, primitives as plain values.
    pub fn access(&self, key: impl Into<Key>) -> Access {
        let key = key.into();
        match self.engine.read_key(self.id, &key) {
            (Some(child), value) if value.is_composite() => {
                Access::Child(Observable::new(self.engine.clone(), child))
            }
            (_, value) => Access::Value(value),
        }
    }

    /// Key of this node under its parent. `None` for roots.
    pub fn key(&self) -> Option<Key> {
        self.engine
            .store()
            .borrow()
            .get(self.id)
            .and_then(|n| n.key().cloned())
    }

    pub fn parent(&self) -> Option<Observable> {
        let parent = self.engine.store().borrow().get(self.id)?.parent()?;
        Some(Observable::new(self.engine.clone(), parent))
    }

    /// Keys from the root down to this node.
    pub fn path(&self) -> Path {
        self.engine
            .store()
            .borrow()
            .path_of(self.id)
            .unwrap_or_default()
    }

    /// `true` when the node currently holds a non-composite value.
    pub fn is_primitive(&self) -> bool {
        self.engine
            .store()
            .borrow()
            .get(self.id)
            .map_or(true, |n| n.is_primitive())
    }

    /// `false` once the node has been destroyed.
    pub fn is_alive(&self) -> bool {
        self.engine.store().borrow().contains(self.id)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Replace the whole value. `Value::Undefined` removes the node's key
    /// from its parent.
    pub fn set(&self, value: impl Into<Value>) -> &Self {
        if self.rejects_write("set") {
            return self;
        }
        let value = value.into();
        let optimized = matches!(
            (&value, self.engine.store().borrow().value_ref(self.id)),
            (Value::Array(_), Some(Value::Array(_)))
        );
        self.engine.write_node(self.id, value, true, optimized);
        self
    }

    /// Replace the value at `key`.
    pub fn set_key(&self, key: impl Into<Key>, value: impl Into<Value>) -> &Self {
        if self.rejects_write("set_key") {
            return self;
        }
        self.engine.write_key(self.id, &key.into(), value.into());
        self
    }

    /// Remove this node's key from its parent.
    pub fn delete(&self) -> &Self {
        self.set(Value::Undefined)
    }

    /// Write each entry of `partial` as a key of this node, then notify
    /// once with the combined result.
    ///
    /// Objects and maps contribute their properties, arrays their indices.
    /// Entries equal to the current value change nothing; if nothing
    /// changed at all, nobody is notified.
    pub fn assign(&self, partial: impl Into<Value>) -> &Self {
        if self.rejects_write("assign") {
            return self;
        }
        let entries: Vec<(Key, Value)> = match partial.into() {
            Value::Object(map) | Value::Map(map) => {
                map.into_iter().map(|(k, v)| (Key::Name(k), v)).collect()
            }
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Key::Index(i), v))
                .collect(),
            other => {
                tracing::debug!(node = %self.id, value = ?other, "assign of a non-container ignored");
                return self;
            }
        };
        self.engine.assign(self.id, entries);
        self
    }

    /// Deep-merge `source` into this node inside one batch.
    ///
    /// Objects merge key by key and arrays index by index, recursing while
    /// both sides have the same shape. `Value::Undefined` deletes and any
    /// other value replaces what was there.
    pub fn merge(&self, source: impl Into<Value>) -> &Self {
        self.merge_all([source.into()])
    }

    /// Merge each of `sources` in turn, all inside one batch.
    pub fn merge_all<I>(&self, sources: I) -> &Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.engine.batch(|| {
            for source in sources {
                merge_into(self, source.into());
            }
        });
        self
    }

    fn rejects_write(&self, op: &'static str) -> bool {
        let locked = self.engine.is_locked(self.id);
        if locked {
            tracing::debug!(node = %self.id, op, "write through locked node ignored");
        }
        locked
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    fn mutate_collection<R>(&self, op: &'static str, f: impl FnOnce(&mut Value) -> R) -> Option<R> {
        if self.rejects_write(op) {
            return None;
        }
        Some(self.engine.mutate(self.id, f))
    }

    /// Append to an array. Returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> usize {
        let value = value.into();
        self.mutate_collection("push", |current| {
            if current.is_nullish() {
                *current = Value::array();
            }
            match current {
                Value::Array(items) => {
                    items.push(value);
                    items.len()
                }
                other => other.len(),
            }
        })
        .unwrap_or(0)
    }

    /// Remove and return the last element of an array.
    pub fn pop(&self) -> Value {
        self.mutate_collection("pop", |current| match current {
            Value::Array(items) => items.pop().unwrap_or_default(),
            _ => Value::Undefined,
        })
        .unwrap_or_default()
    }

    /// Insert into an array at `index`, clamped to the array's length.
    pub fn insert(&self, index: usize, value: impl Into<Value>) {
        let value = value.into();
        self.mutate_collection("insert", |current| {
            if current.is_nullish() {
                *current = Value::array();
            }
            if let Value::Array(items) = current {
                items.insert(index.min(items.len()), value);
            }
        });
    }

    /// Remove and return the array element at `index`.
    pub fn remove(&self, index: usize) -> Value {
        self.mutate_collection("remove", |current| match current {
            Value::Array(items) if index < items.len() => items.remove(index),
            _ => Value::Undefined,
        })
        .unwrap_or_default()
    }

    /// Empty an array, object, map or set.
    pub fn clear(&self) {
        self.mutate_collection("clear", |current| match current {
            Value::Array(items) | Value::Set(items) => items.clear(),
            Value::Object(map) | Value::Map(map) => map.clear(),
            _ => {}
        });
    }

    /// Insert an entry into a map. Returns the previous value for the key.
    pub fn map_insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Value {
        let (key, value) = (key.into(), value.into());
        self.mutate_collection("map_insert", |current| {
            if current.is_nullish() {
                *current = Value::Map(Default::default());
            }
            match current {
                Value::Map(map) | Value::Object(map) => map.insert(key, value).unwrap_or_default(),
                _ => Value::Undefined,
            }
        })
        .unwrap_or_default()
    }

    /// Remove an entry from a map and return it.
    pub fn map_remove(&self, key: &str) -> Value {
        self.mutate_collection("map_remove", |current| match current {
            Value::Map(map) | Value::Object(map) => map.shift_remove(key).unwrap_or_default(),
            _ => Value::Undefined,
        })
        .unwrap_or_default()
    }

    /// Add a member to a set. Returns `false` if it was already present.
    pub fn set_add(&self, member: impl Into<Value>) -> bool {
        let member = member.into();
        self.mutate_collection("set_add", |current| {
            if current.is_nullish() {
                *current = Value::Set(Vec::new());
            }
            match current {
                Value::Set(members) if !members.contains(&member) => {
                    members.push(member);
                    true
                }
                _ => false,
            }
        })
        .unwrap_or(false)
    }

    /// Remove a member from a set. Returns `false` if it was not present.
    pub fn set_remove(&self, member: &Value) -> bool {
        self.mutate_collection("set_remove", |current| match current {
            Value::Set(members) => match members.iter().position(|m| m == member) {
                Some(position) => {
                    members.remove(position);
                    true
                }
                None => false,
            },
            _ => false,
        })
        .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Listening
    // ------------------------------------------------------------------

    /// Register `callback` for changes of this node.
    ///
    /// The listener stays registered until the returned [`Subscription`]
    /// is dropped or the node is destroyed.
    pub fn on_change<F>(&self, mode: ListenerMode, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + 'static,
    {
        self.subscribe(mode, Callback::event(callback))
    }

    /// Register a callback that takes no arguments. No event is built for
    /// it, which saves cloning the node's value on every change.
    pub fn on_change_bare<F>(&self, mode: ListenerMode, callback: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        self.subscribe(mode, Callback::bare(callback))
    }

    fn subscribe(&self, mode: ListenerMode, callback: std::rc::Rc<Callback>) -> Subscription {
        // Listening to a computed starts it.
        self.engine.activate(self.id);
        let listener = self.engine.add_listener(self.id, mode, callback);
        Subscription::new(&self.engine, self.id, listener)
    }

    /// Number of listeners registered directly on this node.
    pub fn listener_count(&self) -> usize {
        self.engine.listener_count(self.id)
    }

    // ------------------------------------------------------------------
    // Locking and persistence
    // ------------------------------------------------------------------

    /// Lock or unlock external writes to this node and its descendants.
    pub fn set_locked(&self, locked: bool) {
        self.engine.set_locked(self.id, locked);
    }

    /// `true` when this node or any ancestor is locked.
    pub fn is_locked(&self) -> bool {
        self.engine.is_locked(self.id)
    }

    /// Forward changes of this node to the engine's change sink under
    /// `table`.
    ///
    /// Fails with [`EngineError::MissingConfiguration`](crate::EngineError)
    /// when no sink was installed with [`Engine::set_sink`].
    pub fn persist(&self, table: impl Into<String>) -> Result<Persisted> {
        Persisted::attach(self, table.into())
    }
}

fn merge_into(target: &Observable, source: Value) {
    let entries: Vec<(Key, Value)> = match (source, target.peek()) {
        (Value::Object(map), Value::Object(_) | Value::Map(_)) => {
            map.into_iter().map(|(k, v)| (Key::Name(k), v)).collect()
        }
        (Value::Array(items), Value::Array(_)) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Key::Index(i), v))
            .collect(),
        (Value::Undefined, Value::Object(_) | Value::Map(_)) => return,
        (other, _) => {
            target.set(other);
            return;
        }
    };

    for (key, value) in entries {
        if matches!(value, Value::Object(_) | Value::Array(_)) {
            merge_into(&target.child(key), value);
        } else {
            target.set_key(key, value);
        }
    }
}

impl PartialEq for Observable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.engine.ptr_eq(&other.engine)
    }
}

impl Eq for Observable {}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.id)
            .field("value", &self.engine.store().borrow().value_of(self.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn json(value: serde_json::Value) -> Value {
        Value::from(value)
    }

    #[test]
    fn child_handles_are_stable() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": {"b": {"c": 1}}})));

        let first = state.child("a").child("b").child("c");
        let second = state.child("a").child("b").child("c");
        assert_eq!(first, second);
        assert_eq!(first.get(), Value::from(1));
    }

    #[test]
    fn access_wraps_composites_only() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": {"b": 1}, "n": 5})));

        match state.access("a") {
            Access::Child(child) => assert_eq!(child.path().as_slice(), &[Key::from("a")]),
            Access::Value(v) => panic!("expected child, got {v:?}"),
        }
        match state.access("n") {
            Access::Value(v) => assert_eq!(v, Value::from(5)),
            Access::Child(_) => panic!("expected plain value"),
        }
    }

    #[test]
    fn deleting_a_key_destroys_the_child_and_notifies_it() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": {"b": 1}, "c": 2})));
        let a = state.child("a");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let _sub = a.on_change(ListenerMode::Deep, move |e| {
            log.borrow_mut().push(e.changes()[0].value_at_path.clone());
        });

        a.delete();

        assert_eq!(*seen.borrow(), vec![Value::Undefined]);
        assert!(!a.is_alive());
        assert_eq!(state.peek(), json(json!({"c": 2})));
        assert_eq!(engine.store().borrow().child_of(state.id(), &Key::from("a")), None);
    }

    #[test]
    fn locked_nodes_reject_external_writes() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": 1})));
        state.set_locked(true);

        state.set(json(json!({"a": 2})));
        state.child("a").set(3);
        state.set_key("b", 1);
        state.push(1);

        assert!(state.child("a").is_locked());
        assert_eq!(state.peek(), json(json!({"a": 1})));

        state.set_locked(false);
        state.child("a").set(3);
        assert_eq!(state.peek(), json(json!({"a": 3})));
    }

    #[test]
    fn assign_notifies_once() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": 1, "b": 2})));
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        let _sub = state.on_change(ListenerMode::Deep, move |e| log.borrow_mut().push(e.clone()));

        state.assign(json(json!({"a": 10, "c": 3})));

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value(), &json(json!({"a": 10, "b": 2, "c": 3})));
        let last = events[0].changes().last().unwrap();
        assert!(last.path.is_empty());
        assert_eq!(last.previous_value_at_path, json(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn merge_recurses_into_nested_objects() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": {"x": 1, "y": 2}, "b": 1})));

        state.merge(json(json!({"a": {"y": 3, "z": 4}, "c": [1]})));
        state.merge(Value::from_pairs([("b", Value::Undefined)]));

        assert_eq!(
            state.peek(),
            json(json!({"a": {"x": 1, "y": 3, "z": 4}, "c": [1]}))
        );
    }

    #[test]
    fn merge_walks_arrays_element_by_element() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"list": [{"a": 1, "b": 2}, {"a": 3}], "n": 1})));

        state.merge(json(json!({"list": [{"a": 5}]})));

        assert_eq!(
            state.peek(),
            json(json!({"list": [{"a": 5, "b": 2}, {"a": 3}], "n": 1}))
        );
    }

    #[test]
    fn merge_all_applies_sources_in_order_once() {
        let engine = Engine::new();
        let state = engine.observable(json(json!({"a": 1, "b": {"x": 1}})));
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        let _sub = state.on_change(ListenerMode::Deep, move |e| log.borrow_mut().push(e.clone()));

        state.merge_all([
            json(json!({"a": 2, "b": {"y": 2}})),
            json(json!({"a": 3})),
            Value::Undefined,
        ]);

        assert_eq!(state.peek(), json(json!({"a": 3, "b": {"x": 1, "y": 2}})));
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn collection_helpers_report_whole_collection() {
        let engine = Engine::new();
        let tags = engine.observable(Value::Set(vec![Value::from("a")]));
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        let _sub = tags.on_change(ListenerMode::Optimized, move |e| log.borrow_mut().push(e.clone()));

        assert!(tags.set_add("b"));
        assert!(!tags.set_add("b"));
        assert!(tags.set_remove(&Value::from("a")));

        let events = events.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].changes()[0].previous_value_at_path,
            Value::Set(vec![Value::from("a")])
        );
        assert_eq!(events[1].value(), &Value::Set(vec![Value::from("b")]));
    }

    #[test]
    fn array_helpers() {
        let engine = Engine::new();
        let list = engine.observable(Value::Undefined);

        assert_eq!(list.push(1), 1);
        assert_eq!(list.push(2), 2);
        list.insert(0, 0);
        assert_eq!(list.remove(1), Value::from(1));
        assert_eq!(list.pop(), Value::from(2));
        assert_eq!(list.peek(), json(json!([0])));
        list.clear();
        assert_eq!(list.peek(), Value::array());
    }

    #[test]
    fn map_helpers() {
        let engine = Engine::new();
        let map = engine.observable(Value::Undefined);

        assert_eq!(map.map_insert("k", 1), Value::Undefined);
        assert_eq!(map.map_insert("k", 2), Value::from(1));
        assert_eq!(map.child("k").get(), Value::from(2));
        assert_eq!(map.map_remove("k"), Value::from(2));
        assert!(map.peek().is_empty());
    }
}
