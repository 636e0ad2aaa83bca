//! Observe Effects
//!
//! An effect is a side-effecting computation that re-runs whenever a node
//! it read during its last run changes.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs immediately inside a fresh tracking
//!    frame.
//!
//! 2. Once the run returns, the effect subscribes to exactly the nodes that
//!    were recorded: a deep listener for deep reads, a shallow listener for
//!    shallow ones. All of those listeners share one callback, so a batch
//!    that touches several dependencies re-runs the effect once.
//!
//! 3. When a dependency changes, the stale subscriptions are dropped and the
//!    effect runs again from scratch. Dependencies are always those of the
//!    latest run, never accumulated.
//!
//! # Re-entrancy
//!
//! A run that writes to one of its own dependencies marks the effect dirty
//! instead of recursing. The effect loops until it settles or until
//! [`EngineConfig::max_rerun_depth`](crate::EngineConfig) runs in a row, at
//! which point the loop is cut and a warning is logged.
//!
//! # Lifetime
//!
//! The listeners keep the effect alive. Dropping the [`ObserveHandle`] does
//! not stop it; call [`ObserveHandle::dispose`] or set
//! [`ObserveEvent::cancel`] from inside the effect.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::runtime::{Engine, WeakEngine};
use super::subscriber::{Callback, ListenerId, ListenerMode};
use crate::graph::NodeId;

/// Passed to the effect function on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveEvent {
    /// Zero-based number of this run.
    pub num: usize,
    /// Set to stop the effect once this run returns.
    pub cancel: bool,
}

type RunFn = Box<dyn FnMut(&mut ObserveEvent)>;

struct EffectState {
    engine: WeakEngine,
    run: RefCell<Option<RunFn>>,
    callback: RefCell<Option<Rc<Callback>>>,
    subscriptions: RefCell<Vec<(NodeId, ListenerId)>>,
    runs: Cell<usize>,
    running: Cell<bool>,
    dirty: Cell<bool>,
    disposed: Cell<bool>,
}

/// Handle to an effect created by [`Engine::observe`].
#[derive(Clone)]
pub struct ObserveHandle {
    state: Rc<EffectState>,
}

impl Engine {
    /// Run `f` now and again whenever something it read changes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    /// use trellis_core::Engine;
    ///
    /// let engine = Engine::new();
    /// let count = engine.observable(1);
    /// let seen = Rc::new(Cell::new(0.0));
    ///
    /// let reader = count.clone();
    /// let sink = seen.clone();
    /// let effect = engine.observe(move |_| sink.set(reader.get().as_f64().unwrap_or(0.0)));
    ///
    /// count.set(5);
    /// assert_eq!(seen.get(), 5.0);
    /// effect.dispose();
    /// ```
    pub fn observe<F>(&self, f: F) -> ObserveHandle
    where
        F: FnMut(&mut ObserveEvent) + 'static,
    {
        let state = Rc::new(EffectState {
            engine: self.downgrade(),
            run: RefCell::new(Some(Box::new(f))),
            callback: RefCell::new(None),
            subscriptions: RefCell::new(Vec::new()),
            runs: Cell::new(0),
            running: Cell::new(false),
            dirty: Cell::new(false),
            disposed: Cell::new(false),
        });

        // The callback owns the state; disposing removes the callback from
        // every node and from the state, which frees both.
        let owner = state.clone();
        *state.callback.borrow_mut() = Some(Callback::bare(move || owner.execute()));

        state.execute();
        ObserveHandle { state }
    }
}

impl EffectState {
    fn execute(&self) {
        if self.disposed.get() {
            return;
        }
        if self.running.get() {
            self.dirty.set(true);
            return;
        }
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        struct Running<'a>(&'a Cell<bool>);
        impl Drop for Running<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }
        self.running.set(true);
        let _running = Running(&self.running);

        let limit = engine.config().max_rerun_depth;
        let mut reruns = 0;
        loop {
            self.dirty.set(false);
            self.run_once(&engine);
            if self.disposed.get() || !self.dirty.get() {
                break;
            }
            reruns += 1;
            if reruns >= limit {
                tracing::warn!(
                    reruns,
                    "effect keeps re-triggering itself; stopping until its next change"
                );
                break;
            }
        }
    }

    fn run_once(&self, engine: &Engine) {
        // Put the function back even if it panics, so a failed run leaves
        // the effect subscribed to its previous dependencies.
        struct Slot<'a> {
            state: &'a EffectState,
            run: Option<RunFn>,
        }
        impl Drop for Slot<'_> {
            fn drop(&mut self) {
                if !self.state.disposed.get() {
                    *self.state.run.borrow_mut() = self.run.take();
                }
            }
        }

        let Some(run) = self.run.borrow_mut().take() else {
            return;
        };
        let mut slot = Slot {
            state: self,
            run: Some(run),
        };

        let mut event = ObserveEvent {
            num: self.runs.get(),
            cancel: false,
        };
        let scope = engine.begin_tracking();
        if let Some(run) = slot.run.as_mut() {
            run(&mut event);
        }
        let reads = scope.finish();
        self.runs.set(self.runs.get() + 1);
        drop(slot);

        if event.cancel {
            self.dispose();
            return;
        }
        if self.disposed.get() {
            return;
        }

        let Some(callback) = self.callback.borrow().clone() else {
            return;
        };
        self.unsubscribe_all(engine);
        let mut subscriptions = Vec::with_capacity(reads.len());
        for read in reads {
            let mode = if read.shallow {
                ListenerMode::Shallow
            } else {
                ListenerMode::Deep
            };
            if let Some(id) = engine.add_listener(read.node, mode, callback.clone()) {
                subscriptions.push((read.node, id));
            }
        }
        *self.subscriptions.borrow_mut() = subscriptions;
    }

    fn unsubscribe_all(&self, engine: &Engine) {
        let stale = std::mem::take(&mut *self.subscriptions.borrow_mut());
        for (node, id) in stale {
            engine.remove_listener(node, id);
        }
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            self.unsubscribe_all(&engine);
        }
        self.subscriptions.borrow_mut().clear();
        // Captured values may call back into the engine when dropped, so
        // release the borrows first.
        let run = self.run.borrow_mut().take();
        let callback = self.callback.borrow_mut().take();
        drop(run);
        drop(callback);
    }
}

impl ObserveHandle {
    /// Stop the effect and drop its subscriptions.
    pub fn dispose(&self) {
        self.state.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.get()
    }

    /// Number of completed runs.
    pub fn run_count(&self) -> usize {
        self.state.runs.get()
    }

    /// Number of nodes the effect is currently subscribed to.
    pub fn dependency_count(&self) -> usize {
        self.state.subscriptions.borrow().len()
    }
}

impl fmt::Debug for ObserveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveHandle")
            .field("runs", &self.state.runs.get())
            .field("dependencies", &self.dependency_count())
            .field("disposed", &self.state.disposed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn effect_runs_immediately_and_on_change() {
        let engine = Engine::new();
        let count = engine.observable(0);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let reader = count.clone();
        let log = seen.clone();
        let effect = engine.observe(move |_| log.borrow_mut().push(reader.get()));

        count.set(1);
        count.set(2);

        assert_eq!(
            *seen.borrow(),
            vec![Value::from(0), Value::from(1), Value::from(2)]
        );
        assert_eq!(effect.run_count(), 3);
    }

    #[test]
    fn dependencies_follow_the_latest_run() {
        let engine = Engine::new();
        let state = engine.observable(Value::from(json!({"flag": true, "a": 1, "b": 1})));
        let runs = Rc::new(Cell::new(0));

        let reader = state.clone();
        let counter = runs.clone();
        let effect = engine.observe(move |_| {
            counter.set(counter.get() + 1);
            if reader.child("flag").get().is_truthy() {
                reader.child("a").get();
            } else {
                reader.child("b").get();
            }
        });
        assert_eq!(runs.get(), 1);

        state.child("b").set(2);
        assert_eq!(runs.get(), 1);

        state.child("flag").set(false);
        assert_eq!(runs.get(), 2);

        // `a` is no longer read.
        state.child("a").set(5);
        assert_eq!(runs.get(), 2);
        state.child("b").set(3);
        assert_eq!(runs.get(), 3);
        assert_eq!(effect.dependency_count(), 2);
    }

    #[test]
    fn one_rerun_per_batch() {
        let engine = Engine::new();
        let a = engine.observable(1);
        let b = engine.observable(2);
        let runs = Rc::new(Cell::new(0));

        let (ra, rb, counter) = (a.clone(), b.clone(), runs.clone());
        let _effect = engine.observe(move |_| {
            ra.get();
            rb.get();
            counter.set(counter.get() + 1);
        });

        engine.batch(|| {
            a.set(10);
            b.set(20);
        });
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn cancel_stops_the_effect() {
        let engine = Engine::new();
        let count = engine.observable(0);
        let runs = Rc::new(Cell::new(0));

        let (reader, counter) = (count.clone(), runs.clone());
        let effect = engine.observe(move |event| {
            counter.set(counter.get() + 1);
            if reader.get().as_f64() == Some(2.0) {
                event.cancel = true;
            }
        });

        count.set(1);
        count.set(2);
        count.set(3);
        assert_eq!(runs.get(), 3);
        assert!(effect.is_disposed());
        assert_eq!(count.listener_count(), 0);
    }

    #[test]
    fn dispose_removes_listeners() {
        let engine = Engine::new();
        let count = engine.observable(0);
        let reader = count.clone();
        let effect = engine.observe(move |_| {
            reader.get();
        });
        assert_eq!(count.listener_count(), 1);

        effect.dispose();
        assert_eq!(count.listener_count(), 0);
        count.set(1);
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn self_triggering_effect_is_cut_off() {
        let engine = Engine::with_config(EngineConfig::default().with_max_rerun_depth(5));
        let count = engine.observable(0);

        let target = count.clone();
        let effect = engine.observe(move |_| {
            let next = target.get().as_f64().unwrap_or(0.0) + 1.0;
            target.set(next);
        });

        // The first run writes before it has subscribed to anything.
        assert_eq!(effect.run_count(), 1);
        assert_eq!(count.peek(), Value::from(1));

        // One run for the change plus four reruns, then the loop is cut.
        count.set(10);
        assert_eq!(effect.run_count(), 6);
        assert_eq!(count.peek(), Value::from(15));
    }

    #[test]
    fn panicking_run_keeps_previous_subscriptions() {
        let engine = Engine::new();
        let count = engine.observable(0);
        let runs = Rc::new(Cell::new(0));

        let (reader, counter) = (count.clone(), runs.clone());
        let effect = engine.observe(move |_| {
            counter.set(counter.get() + 1);
            if reader.get().as_f64() == Some(1.0) {
                panic!("bad value");
            }
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            count.set(1);
        }));
        assert!(result.is_err());
        assert_eq!(engine.batch_depth(), 0);

        count.set(2);
        assert_eq!(runs.get(), 3);
        assert!(!effect.is_disposed());
    }
}
