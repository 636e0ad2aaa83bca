//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects observables,
//! listeners, tracking frames and the batch queue. Every piece of mutable
//! engine state lives in one [`Engine`] instance, so independent engines
//! never see each other's batches or tracking frames.
//!
//! # How It Works
//!
//! 1. An observable is a handle to a node in the engine's node store.
//!
//! 2. Reading a node while a tracking frame is open records the read.
//!
//! 3. Writing a node:
//!    a. opens a batch
//!    b. writes the new value into the root's backing value
//!    c. notifies materialized descendants whose value changed
//!    d. notifies the node and walks up through its ancestors
//!    e. closes the batch, which flushes one call per callback
//!
//! # Thread Safety
//!
//! An engine is single-threaded (`!Send`). State sits behind `RefCell`s that
//! are only ever borrowed for the duration of a store operation; no borrow is
//! held while user callbacks run, so callbacks may freely read and write.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::batch::BatchQueue;
use super::context::{TrackingScope, TrackingStack};
use super::notify::Propagation;
use super::observable::Observable;
use super::subscriber::{Callback, Listener, ListenerId, ListenerMode};
use crate::config::{EngineConfig, SafetyNet};
use crate::error::{EngineError, Result};
use crate::graph::{Node, NodeId, NodeStore};
use crate::sink::ChangeSink;
use crate::value::{Key, PathType, Value};

pub(crate) struct EngineInner {
    config: EngineConfig,
    store: RefCell<NodeStore>,
    tracking: RefCell<TrackingStack>,
    batch: RefCell<BatchQueue>,
    /// Depth of in-progress `assign` calls. Key writes issued by an assign
    /// leave ancestor notification to the assign itself.
    in_assign: Cell<u32>,
    sink: RefCell<Option<Rc<dyn ChangeSink>>>,
}

/// A reactive engine instance.
///
/// Cloning an `Engine` is cheap and yields another handle to the same
/// instance.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

/// Non-owning handle to an [`Engine`].
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Create an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine, checking that the collaborators `config` relies
    /// on are present.
    ///
    /// Fails with [`EngineError::MissingConfiguration`] when the tokio
    /// safety net is selected outside a tokio runtime.
    pub fn try_with_config(config: EngineConfig) -> Result<Self> {
        if config.safety_net == SafetyNet::Tokio && tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::MissingConfiguration {
                what: "tokio runtime",
            });
        }
        Ok(Self::with_config(config))
    }

    /// Create an engine without validating `config`. A tokio safety net
    /// armed outside a runtime degrades to manual ticking.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                config,
                store: RefCell::new(NodeStore::new()),
                tracking: RefCell::new(TrackingStack::default()),
                batch: RefCell::new(BatchQueue::default()),
                in_assign: Cell::new(0),
                sink: RefCell::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// `true` when both handles point at the same engine.
    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Create a new root observable holding `value`.
    pub fn observable(&self, value: impl Into<Value>) -> Observable {
        let id = self.inner.store.borrow_mut().insert(Node::root(value.into()));
        Observable::new(self.clone(), id)
    }

    /// Number of live nodes across all roots of this engine.
    pub fn node_count(&self) -> usize {
        self.inner.store.borrow().node_count()
    }

    /// Install the collaborator that receives persisted changes.
    pub fn set_sink(&self, sink: Rc<dyn ChangeSink>) {
        *self.inner.sink.borrow_mut() = Some(sink);
    }

    pub(crate) fn sink(&self) -> Option<Rc<dyn ChangeSink>> {
        self.inner.sink.borrow().clone()
    }

    pub(crate) fn store(&self) -> &RefCell<NodeStore> {
        &self.inner.store
    }

    pub(crate) fn tracking(&self) -> &RefCell<TrackingStack> {
        &self.inner.tracking
    }

    pub(crate) fn batch_queue(&self) -> &RefCell<BatchQueue> {
        &self.inner.batch
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    /// Open a tracking frame. Reads made until the returned scope is
    /// finished or dropped are recorded in it.
    pub fn begin_tracking(&self) -> TrackingScope {
        TrackingScope::enter(self)
    }

    /// Check if a tracking frame is open.
    pub fn is_tracking(&self) -> bool {
        self.inner.tracking.borrow().is_active()
    }

    /// Run `f` with tracking suspended.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Restore<'a> {
            engine: &'a Engine,
            frames: Option<Vec<super::context::FrameState>>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if let Some(frames) = self.frames.take() {
                    self.engine.tracking().borrow_mut().resume(frames);
                }
            }
        }

        let frames = self.inner.tracking.borrow_mut().suspend();
        let _restore = Restore {
            engine: self,
            frames: Some(frames),
        };
        f()
    }

    fn record_read(&self, node: NodeId, shallow: bool) {
        if !self.is_tracking() {
            return;
        }
        let path = self.inner.store.borrow().path_of(node);
        if let Some(path) = path {
            self.inner.tracking.borrow_mut().record(node, path, shallow);
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Run the root's pending activation, if any.
    pub(crate) fn activate(&self, node: NodeId) {
        let activator = {
            let mut store = self.inner.store.borrow_mut();
            store
                .root_of(node)
                .and_then(|root| store.get_mut(root))
                .and_then(Node::take_activator)
        };
        if let Some(activate) = activator {
            activate();
        }
    }

    /// Tracked read of a node's value.
    pub(crate) fn read(&self, node: NodeId, shallow: bool) -> Value {
        self.activate(node);
        self.record_read(node, shallow);
        self.inner.store.borrow().value_of(node)
    }

    /// Untracked read of a node's value.
    pub(crate) fn peek(&self, node: NodeId) -> Value {
        self.activate(node);
        self.inner.store.borrow().value_of(node)
    }

    /// Child of `node` at `key`, materialized on demand.
    pub(crate) fn child(&self, node: NodeId, key: &Key) -> Option<NodeId> {
        self.inner.store.borrow_mut().ensure_child(node, key)
    }

    /// Tracked read of `key` under `node`. Returns the child handle when
    /// the value is composite or a tracking frame needs a node to record.
    pub(crate) fn read_key(&self, node: NodeId, key: &Key) -> (Option<NodeId>, Value) {
        self.activate(node);
        let value = self
            .inner
            .store
            .borrow()
            .value_ref(node)
            .and_then(|v| v.get_key(&key.normalized_for(v)))
            .cloned()
            .unwrap_or_default();
        if value.is_composite() || self.is_tracking() {
            let child = self.child(node, key);
            if let Some(child) = child {
                self.record_read(child, false);
            }
            (child, value)
        } else {
            (None, value)
        }
    }

    // ------------------------------------------------------------------
    // Node metadata
    // ------------------------------------------------------------------

    pub(crate) fn is_locked(&self, node: NodeId) -> bool {
        self.inner.store.borrow().is_locked(node)
    }

    pub(crate) fn set_locked(&self, node: NodeId, locked: bool) {
        if let Some(n) = self.inner.store.borrow_mut().get_mut(node) {
            n.set_locked(locked);
        }
    }

    pub(crate) fn set_activator(&self, node: NodeId, activator: crate::graph::Activator) {
        if let Some(n) = self.inner.store.borrow_mut().get_mut(node) {
            n.set_activator(activator);
        }
    }

    pub(crate) fn add_listener(
        &self,
        node: NodeId,
        mode: ListenerMode,
        callback: Rc<Callback>,
    ) -> Option<ListenerId> {
        let listener = Listener::new(mode, callback);
        let id = listener.id();
        let mut store = self.inner.store.borrow_mut();
        let target = store.get_mut(node)?;
        target.add_listener(listener);
        Some(id)
    }

    pub(crate) fn remove_listener(&self, node: NodeId, id: ListenerId) {
        let removed = self
            .inner
            .store
            .borrow_mut()
            .get_mut(node)
            .and_then(|n| n.remove_listener(id));
        // Callbacks may own handles whose drop reaches back into the store.
        drop(removed);
    }

    /// Destroy `node` and its subtree.
    pub(crate) fn destroy_node(&self, node: NodeId) {
        let removed = self.inner.store.borrow_mut().destroy(node);
        drop(removed);
    }

    pub(crate) fn listener_count(&self, node: NodeId) -> usize {
        self.inner
            .store
            .borrow()
            .get(node)
            .map_or(0, |n| n.listeners().len())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Replace the value of `node`.
    ///
    /// With `propagate` unset only the node and its descendants hear about
    /// the change; ancestors are left to the caller. `optimized` marks the
    /// change as a bulk replacement for optimized listeners. Returns `true`
    /// when the value changed.
    pub(crate) fn write_node(
        &self,
        node: NodeId,
        value: Value,
        propagate: bool,
        optimized: bool,
    ) -> bool {
        let (prev, parent, key) = {
            let store = self.inner.store.borrow();
            let Some(target) = store.get(node) else {
                return false;
            };
            (store.value_of(node), target.parent(), target.key().cloned())
        };
        if prev == value {
            return false;
        }

        let _batch = self.batch_guard();
        if !self.inner.store.borrow_mut().write_value(node, value.clone()) {
            tracing::debug!(node = %node, "write blocked by a primitive ancestor");
            return false;
        }
        self.notify_descendants(node, &prev, &value, optimized);

        match (parent, key) {
            (Some(parent), Some(key)) if value.is_undefined() || prev.is_undefined() => {
                // The key appeared or disappeared: a structural change of
                // the parent as much as a change of this node.
                let removed = value.is_undefined();
                let path_type = PathType::of(&value);
                self.notify(node, Propagation::own(value.clone(), prev.clone(), optimized));
                if removed {
                    self.destroy_node(node);
                }
                if propagate {
                    self.notify(
                        parent,
                        Propagation::at_key(key, path_type, value, prev, optimized).walk_up(),
                    );
                }
            }
            _ => {
                let change = Propagation::own(value, prev, optimized);
                self.notify(node, if propagate { change.walk_up() } else { change });
            }
        }
        true
    }

    /// Write `value` at `key` under `parent` through the child node for the
    /// key.
    ///
    /// A child materialized only for this write is destroyed again when the
    /// write changes nothing.
    pub(crate) fn write_key(&self, parent: NodeId, key: &Key, value: Value) -> bool {
        let optimized = matches!(value, Value::Array(_));
        let existing = self.inner.store.borrow().child_of(parent, key);
        let Some(child) = existing.or_else(|| self.child(parent, key)) else {
            return false;
        };
        let propagate = self.inner.in_assign.get() == 0;
        let written = self.write_node(child, value, propagate, optimized);
        if !written && existing.is_none() {
            self.destroy_node(child);
        }
        written
    }

    /// Apply `entries` as key writes, then notify `node` and its ancestors
    /// once with the combined result.
    pub(crate) fn assign(&self, node: NodeId, entries: Vec<(Key, Value)>) {
        struct AssignScope<'a>(&'a Cell<u32>);
        impl Drop for AssignScope<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get().saturating_sub(1));
            }
        }

        let prev = self.inner.store.borrow().value_of(node);
        let _batch = self.batch_guard();
        {
            self.inner.in_assign.set(self.inner.in_assign.get() + 1);
            let _scope = AssignScope(&self.inner.in_assign);
            for (key, value) in entries {
                self.write_key(node, &key, value);
            }
        }
        let next = self.inner.store.borrow().value_of(node);
        if next != prev {
            self.notify(node, Propagation::own(next, prev, false).walk_up());
        }
    }

    /// Run `f` on a copy of the node's value and commit the result as one
    /// bulk change: the whole collection is reported as the new value and
    /// the untouched copy as the previous one.
    pub(crate) fn mutate<R>(&self, node: NodeId, f: impl FnOnce(&mut Value) -> R) -> R {
        let mut next = self.inner.store.borrow().value_of(node);
        let result = f(&mut next);
        self.write_node(node, next, true, true);
        result
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.node_count())
            .field("tracking", &self.is_tracking())
            .field("batch_depth", &self.inner.batch.borrow().depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engines_are_independent() {
        let a = Engine::new();
        let b = Engine::new();

        let _scope = a.begin_tracking();
        assert!(a.is_tracking());
        assert!(!b.is_tracking());

        a.begin_batch();
        assert_eq!(a.batch_depth(), 1);
        assert_eq!(b.batch_depth(), 0);
        a.end_batch();
    }

    #[test]
    fn tokio_safety_net_needs_a_runtime() {
        let config = EngineConfig::default().with_safety_net(SafetyNet::Tokio);
        assert_eq!(
            Engine::try_with_config(config).unwrap_err(),
            EngineError::MissingConfiguration {
                what: "tokio runtime"
            }
        );
        assert!(Engine::try_with_config(EngineConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn tokio_safety_net_accepted_inside_a_runtime() {
        let config = EngineConfig::default().with_safety_net(SafetyNet::Tokio);
        let engine = Engine::try_with_config(config).unwrap();
        assert_eq!(engine.config().safety_net, SafetyNet::Tokio);
    }

    #[test]
    fn write_node_skips_equal_values() {
        let engine = Engine::new();
        let state = engine.observable(Value::from(json!({"a": {"b": 1}})));
        let a = engine.child(state.id(), &Key::from("a")).unwrap();

        assert!(!engine.write_node(a, Value::from(json!({"b": 1})), true, false));
        assert!(engine.write_node(a, Value::from(json!({"b": 2})), true, false));
        assert_eq!(state.peek(), Value::from(json!({"a": {"b": 2}})));
    }

    #[test]
    fn removing_a_key_destroys_its_node() {
        let engine = Engine::new();
        let state = engine.observable(Value::from(json!({"a": {"b": 1}})));
        let a = engine.child(state.id(), &Key::from("a")).unwrap();
        let _b = engine.child(a, &Key::from("b")).unwrap();
        assert_eq!(engine.node_count(), 3);

        engine.write_key(state.id(), &Key::from("a"), Value::Undefined);
        assert_eq!(engine.node_count(), 1);
        assert_eq!(state.peek(), Value::object());
    }

    #[test]
    fn no_op_key_writes_leave_no_nodes_behind() {
        let engine = Engine::new();
        let state = engine.observable(Value::from(json!({"n": 1})));

        for i in 0..100 {
            state.set_key(format!("k{i}"), Value::Undefined);
        }
        state.child("n").set_key("x", 1);
        state.set_key("n", 1);
        assert_eq!(engine.node_count(), 2);
        assert_eq!(state.peek(), Value::from(json!({"n": 1})));

        // Handles the caller asked for survive no-op writes.
        let kept = state.child("missing");
        kept.set(Value::Undefined);
        assert!(kept.is_alive());
    }

    #[test]
    fn replacing_a_parent_prunes_missing_children() {
        let engine = Engine::new();
        let state = engine.observable(Value::from(json!({"a": 1, "b": 2})));
        let a = engine.child(state.id(), &Key::from("a")).unwrap();
        let b = engine.child(state.id(), &Key::from("b")).unwrap();

        state.set(Value::from(json!({"b": 3})));
        let store = engine.store().borrow();
        assert!(!store.contains(a));
        assert!(store.contains(b));
        assert_eq!(store.value_of(b), Value::from(3));
    }

    #[test]
    fn mutate_reports_untouched_copy_as_previous() {
        let engine = Engine::new();
        let list = engine.observable(Value::from(json!([1, 2])));
        let pushed = engine.mutate(list.id(), |value| {
            if let Value::Array(items) = value {
                items.push(Value::from(3));
            }
            true
        });
        assert!(pushed);
        assert_eq!(list.peek(), Value::from(json!([1, 2, 3])));
    }
}
