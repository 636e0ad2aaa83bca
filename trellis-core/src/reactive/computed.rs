//! Computed Values
//!
//! A computed value is a locked observable whose value is derived from other
//! observables.
//!
//! # How Computed Values Work
//!
//! 1. Creating a computed allocates a new locked root node. Nothing is
//!    computed yet.
//!
//! 2. The first read of the node (or the first listener registered on it)
//!    activates it: an [`observe`](Engine::observe) effect is installed that
//!    runs the compute function and writes the result into the node.
//!
//! 3. When anything the compute function read changes, the effect re-runs
//!    and writes the new result. Listeners of the computed hear about it
//!    like any other write, and only if the result actually differs.
//!
//! External writes are rejected by the lock; the updater writes beneath the
//! lock check. A compute function that panics leaves the last good value in
//! place.
//!
//! # Async
//!
//! [`Engine::computed_async`] accepts a function returning a future. Each
//! recompute spawns the future on the current `LocalSet` and aborts the one
//! before it; results carry a generation number and stale ones are dropped.
//! Only reads made before the future is returned are tracked.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use super::effect::ObserveHandle;
use super::notify::ChangeEvent;
use super::observable::Observable;
use super::runtime::{Engine, WeakEngine};
use super::subscriber::{ListenerMode, Subscription};
use crate::error::{EngineError, Result};
use crate::graph::NodeId;
use crate::value::{Key, Value};

struct ComputedState {
    engine: WeakEngine,
    node: NodeId,
    effect: RefCell<Option<ObserveHandle>>,
    generation: Cell<u64>,
    task: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

/// A derived, read-only observable.
///
/// The computation stays installed while any clone of this handle is alive.
#[derive(Clone)]
pub struct Computed {
    node: Observable,
    state: Rc<ComputedState>,
}

impl Engine {
    /// Create a computed value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use trellis_core::{Engine, Value};
    ///
    /// let engine = Engine::new();
    /// let a = engine.observable(1);
    /// let b = engine.observable(2);
    ///
    /// let (ra, rb) = (a.clone(), b.clone());
    /// let sum = engine.computed(move || {
    ///     let total = ra.get().as_f64().unwrap_or(0.0) + rb.get().as_f64().unwrap_or(0.0);
    ///     Value::from(total)
    /// });
    ///
    /// assert_eq!(sum.get(), Value::from(3));
    /// a.set(5);
    /// assert_eq!(sum.get(), Value::from(7));
    /// ```
    pub fn computed<F>(&self, compute: F) -> Computed
    where
        F: Fn() -> Value + 'static,
    {
        let computed = Computed::allocate(self);
        let compute = Rc::new(compute);
        let weak = Rc::downgrade(&computed.state);
        self.set_activator(
            computed.node.id(),
            Rc::new(move || {
                let compute = compute.clone();
                ComputedState::activate(&weak, move |state| state.publish(compute()));
            }),
        );
        computed
    }

    /// Create a computed value whose compute function returns a future.
    ///
    /// The value is `Undefined` until the first future resolves. Futures
    /// run on the current `tokio::task::LocalSet`; fails with
    /// [`EngineError::MissingConfiguration`] outside a tokio runtime.
    pub fn computed_async<F, Fut>(&self, compute: F) -> Result<Computed>
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Value> + 'static,
    {
        tokio::runtime::Handle::try_current().map_err(|_| EngineError::MissingConfiguration {
            what: "tokio runtime",
        })?;

        let computed = Computed::allocate(self);
        let compute = Rc::new(compute);
        let weak = Rc::downgrade(&computed.state);
        self.set_activator(
            computed.node.id(),
            Rc::new(move || {
                let compute = compute.clone();
                ComputedState::activate(&weak, move |state| state.spawn(compute()));
            }),
        );
        Ok(computed)
    }
}

impl ComputedState {
    /// Install the updating effect. `run` is called with the state on every
    /// recompute.
    fn activate(weak: &Weak<ComputedState>, run: impl Fn(&Rc<ComputedState>) + 'static) {
        let Some(state) = weak.upgrade() else {
            return;
        };
        let Some(engine) = state.engine.upgrade() else {
            return;
        };
        let target = weak.clone();
        let effect = engine.observe(move |_| {
            if let Some(state) = target.upgrade() {
                run(&state);
            }
        });
        *state.effect.borrow_mut() = Some(effect);
    }

    fn publish(&self, value: Value) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let optimized = matches!(
            (&value, engine.store().borrow().value_ref(self.node)),
            (Value::Array(_), Some(Value::Array(_)))
        );
        engine.write_node(self.node, value, true, optimized);
    }

    fn spawn<Fut>(self: &Rc<Self>, future: Fut)
    where
        Fut: Future<Output = Value> + 'static,
    {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        if let Some(previous) = self.task.borrow_mut().take() {
            previous.abort();
        }

        let weak = Rc::downgrade(self);
        let task = tokio::task::spawn_local(async move {
            let value = future.await;
            let Some(state) = weak.upgrade() else {
                return;
            };
            if state.generation.get() != generation {
                tracing::debug!(
                    generation,
                    current = state.generation.get(),
                    "discarding stale async computed result"
                );
                return;
            }
            state.task.borrow_mut().take();
            state.publish(value);
        });
        *self.task.borrow_mut() = Some(task);
    }
}

impl Drop for ComputedState {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
        if let Some(effect) = self.effect.get_mut().take() {
            effect.dispose();
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.destroy_node(self.node);
        }
    }
}

impl Computed {
    fn allocate(engine: &Engine) -> Self {
        let node = engine.observable(Value::Undefined);
        node.set_locked(true);
        let state = Rc::new(ComputedState {
            engine: engine.downgrade(),
            node: node.id(),
            effect: RefCell::new(None),
            generation: Cell::new(0),
            task: RefCell::new(None),
        });
        Self { node, state }
    }

    /// Current value, tracking a deep dependency. Activates the computation
    /// on first use.
    pub fn get(&self) -> Value {
        self.node.get()
    }

    /// Current value without tracking.
    pub fn peek(&self) -> Value {
        self.node.peek()
    }

    /// Observable for a key of the computed value.
    pub fn child(&self, key: impl Into<Key>) -> Observable {
        self.node.child(key)
    }

    /// The locked node holding the computed value.
    pub fn observable(&self) -> &Observable {
        &self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// `true` once the computation has been activated.
    pub fn is_active(&self) -> bool {
        self.state.effect.borrow().is_some()
    }

    pub fn on_change<F>(&self, mode: ListenerMode, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + 'static,
    {
        self.node.on_change(mode, callback)
    }

    pub fn on_change_bare<F>(&self, mode: ListenerMode, callback: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        self.node.on_change_bare(mode, callback)
    }
}

impl From<&Computed> for Observable {
    fn from(computed: &Computed) -> Self {
        computed.node.clone()
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("node", &self.node.id())
            .field("active", &self.is_active())
            .field("generation", &self.state.generation.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number(value: &Value) -> f64 {
        value.as_f64().unwrap_or(0.0)
    }

    #[test]
    fn computed_is_lazy() {
        let engine = Engine::new();
        let source = engine.observable(1);
        let runs = Rc::new(Cell::new(0));

        let (reader, counter) = (source.clone(), runs.clone());
        let doubled = engine.computed(move || {
            counter.set(counter.get() + 1);
            Value::from(number(&reader.get()) * 2.0)
        });

        assert!(!doubled.is_active());
        assert_eq!(runs.get(), 0);

        assert_eq!(doubled.get(), Value::from(2));
        assert!(doubled.is_active());
        assert_eq!(runs.get(), 1);

        doubled.get();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn computed_rejects_external_writes() {
        let engine = Engine::new();
        let source = engine.observable(1);
        let reader = source.clone();
        let mirror = engine.computed(move || reader.get());

        assert_eq!(mirror.get(), Value::from(1));
        mirror.observable().set(10);
        assert_eq!(mirror.get(), Value::from(1));

        source.set(2);
        assert_eq!(mirror.get(), Value::from(2));
    }

    #[test]
    fn recomputes_only_for_tracked_reads() {
        let engine = Engine::new();
        let state = engine.observable(Value::from(json!({"used": 1, "unused": 1})));
        let runs = Rc::new(Cell::new(0));

        let (reader, counter) = (state.clone(), runs.clone());
        let derived = engine.computed(move || {
            counter.set(counter.get() + 1);
            reader.child("used").get()
        });
        derived.get();

        state.child("unused").set(2);
        assert_eq!(runs.get(), 1);
        state.child("used").set(2);
        assert_eq!(runs.get(), 2);
        assert_eq!(derived.peek(), Value::from(2));
    }

    #[test]
    fn panicking_compute_keeps_last_value() {
        let engine = Engine::new();
        let source = engine.observable(1);
        let reader = source.clone();
        let checked = engine.computed(move || {
            let value = reader.get();
            if number(&value) < 0.0 {
                panic!("negative input");
            }
            value
        });
        assert_eq!(checked.get(), Value::from(1));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            source.set(-1);
        }));
        assert!(result.is_err());
        assert_eq!(checked.peek(), Value::from(1));

        source.set(3);
        assert_eq!(checked.peek(), Value::from(3));
    }

    #[test]
    fn dropping_the_handle_frees_the_node() {
        let engine = Engine::new();
        let source = engine.observable(1);
        let reader = source.clone();
        let mirror = engine.computed(move || reader.get());
        mirror.get();
        assert_eq!(engine.node_count(), 2);
        assert_eq!(source.listener_count(), 1);

        drop(mirror);
        assert_eq!(engine.node_count(), 1);
        assert_eq!(source.listener_count(), 0);
    }

    #[test]
    fn async_computed_requires_a_runtime() {
        let engine = Engine::new();
        let err = engine
            .computed_async(|| async { Value::from(1) })
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::MissingConfiguration {
                what: "tokio runtime"
            }
        );
    }
}
