//! Batch Queue
//!
//! While a batch is open, deliveries are queued instead of invoked. Items
//! are keyed by callback identity: a second delivery to the same callback
//! replaces the queued value and appends its change records, so each
//! callback runs at most once per flush and still sees every change in
//! order.
//!
//! # Flushing
//!
//! Batches nest. Only closing the outermost one flushes. The queue is
//! swapped out before any callback runs, so notifications raised by
//! callbacks start a fresh queue instead of touching the one being drained.
//!
//! # Safety net
//!
//! Opening the outermost batch arms a safety net. If the batch is still
//! open on the next turn of the host's event loop (see [`Engine::tick`]),
//! it is force-closed and an error is logged. This keeps a panic between
//! [`Engine::begin_batch`] and [`Engine::end_batch`] from leaving the engine
//! in a permanently open batch.

use std::collections::HashMap;
use std::rc::Rc;

use super::notify::{ChangeEvent, ChangeRecord};
use super::observable::Observable;
use super::runtime::Engine;
use super::subscriber::{Callback, CallbackFn, CallbackId};
use crate::config::SafetyNet;
use crate::graph::NodeId;
use crate::value::Value;

struct EventPayload {
    node: NodeId,
    latest_value: Value,
    changes: Vec<ChangeRecord>,
}

/// One pending delivery.
pub(crate) struct BatchItem {
    callback: Rc<Callback>,
    payload: Option<EventPayload>,
}

impl BatchItem {
    pub(crate) fn bare(callback: Rc<Callback>) -> Self {
        Self {
            callback,
            payload: None,
        }
    }

    pub(crate) fn event(
        callback: Rc<Callback>,
        node: NodeId,
        latest_value: Value,
        change: ChangeRecord,
    ) -> Self {
        Self {
            callback,
            payload: Some(EventPayload {
                node,
                latest_value,
                changes: vec![change],
            }),
        }
    }

    fn merge(&mut self, later: BatchItem) {
        match (&mut self.payload, later.payload) {
            (Some(existing), Some(later)) => {
                existing.latest_value = later.latest_value;
                existing.changes.extend(later.changes);
            }
            (slot @ None, Some(later)) => *slot = Some(later),
            (_, None) => {}
        }
    }
}

struct SafetyNetToken {
    epoch: u64,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Queue state owned by an engine.
#[derive(Default)]
pub(crate) struct BatchQueue {
    depth: u32,
    items: Vec<BatchItem>,
    index: HashMap<CallbackId, usize>,
    after: Vec<Box<dyn FnOnce()>>,
    safety_net: Option<SafetyNetToken>,
    epoch: u64,
    /// The missing-runtime warning has been logged.
    warned_no_runtime: bool,
}

impl BatchQueue {
    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    fn enqueue(&mut self, item: BatchItem) {
        let id = item.callback.id();
        match self.index.get(&id) {
            Some(&position) => self.items[position].merge(item),
            None => {
                self.index.insert(id, self.items.len());
                self.items.push(item);
            }
        }
    }

    fn drain(&mut self) -> (Vec<BatchItem>, Vec<Box<dyn FnOnce()>>) {
        self.index.clear();
        (
            std::mem::take(&mut self.items),
            std::mem::take(&mut self.after),
        )
    }
}

/// Guard for one batch level.
///
/// Dropping the guard ends the batch. During a panic the batch is left open
/// for the safety net to close.
#[must_use = "the batch ends when the guard is dropped"]
pub struct BatchGuard {
    engine: Engine,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.engine.end_batch();
    }
}

impl Engine {
    /// Open a batch. Batches nest; deliveries wait for the outermost one.
    pub fn begin_batch(&self) {
        let arm = {
            let mut queue = self.batch_queue().borrow_mut();
            queue.depth += 1;
            queue.depth == 1 && queue.safety_net.is_none()
        };
        if arm {
            self.arm_safety_net();
        }
    }

    /// Close a batch, flushing when it was the outermost one.
    pub fn end_batch(&self) {
        self.close_batch(false);
    }

    /// Close every open batch and flush immediately.
    pub fn end_batch_forced(&self) {
        self.close_batch(true);
    }

    /// Open a batch that ends when the returned guard is dropped.
    pub fn batch_guard(&self) -> BatchGuard {
        self.begin_batch();
        BatchGuard {
            engine: self.clone(),
        }
    }

    /// Run `f` inside a batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.batch_guard();
        f()
    }

    /// Run `f` inside a batch and `after` once the outermost batch has
    /// flushed.
    pub fn batch_then<R>(&self, f: impl FnOnce() -> R, after: impl FnOnce() + 'static) -> R {
        let _guard = self.batch_guard();
        self.batch_queue().borrow_mut().after.push(Box::new(after));
        f()
    }

    /// Current batch nesting depth.
    pub fn batch_depth(&self) -> u32 {
        self.batch_queue().borrow().depth
    }

    /// One turn of the host event loop has passed.
    ///
    /// Force-closes a batch left open since it was armed. Hosts using
    /// [`SafetyNet::Manual`] call this between turns.
    pub fn tick(&self) {
        let pending = {
            let queue = self.batch_queue().borrow();
            (queue.depth > 0 && queue.safety_net.is_some()).then(|| queue.items.len())
        };
        if let Some(pending) = pending {
            tracing::error!(
                pending,
                "forcibly completing batch because end_batch was never called; \
                 this may be due to a panic between begin_batch and end_batch"
            );
            self.end_batch_forced();
        }
    }

    fn tick_epoch(&self, epoch: u64) {
        let current = self
            .batch_queue()
            .borrow()
            .safety_net
            .as_ref()
            .map(|token| token.epoch);
        if current == Some(epoch) {
            self.tick();
        }
    }

    fn arm_safety_net(&self) {
        let epoch = {
            let mut queue = self.batch_queue().borrow_mut();
            queue.epoch += 1;
            queue.epoch
        };
        let task = match self.config().safety_net {
            SafetyNet::Manual => None,
            SafetyNet::Tokio if tokio::runtime::Handle::try_current().is_err() => {
                let warned =
                    std::mem::replace(&mut self.batch_queue().borrow_mut().warned_no_runtime, true);
                if !warned {
                    tracing::warn!(
                        "tokio safety net armed outside a tokio runtime; falling back to manual ticks"
                    );
                }
                None
            }
            SafetyNet::Tokio => {
                let engine = self.downgrade();
                Some(tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    if let Some(engine) = engine.upgrade() {
                        engine.tick_epoch(epoch);
                    }
                }))
            }
        };
        self.batch_queue().borrow_mut().safety_net = Some(SafetyNetToken { epoch, task });
    }

    fn close_batch(&self, force: bool) {
        let (items, after) = {
            let mut queue = self.batch_queue().borrow_mut();
            queue.depth = queue.depth.saturating_sub(1);
            if queue.depth > 0 && !force {
                return;
            }
            queue.depth = 0;
            if let Some(task) = queue.safety_net.take().and_then(|token| token.task) {
                task.abort();
            }
            queue.drain()
        };

        tracing::trace!(items = items.len(), "flushing batch");
        for item in items {
            self.invoke(item);
        }
        for callback in after {
            callback();
        }
    }

    /// Deliver `item` now, or queue it if a batch is open.
    pub(crate) fn batch_notify(&self, item: BatchItem) {
        let immediate = {
            let mut queue = self.batch_queue().borrow_mut();
            if queue.depth == 0 {
                Some(item)
            } else {
                queue.enqueue(item);
                None
            }
        };
        if let Some(item) = immediate {
            self.invoke(item);
        }
    }

    fn invoke(&self, item: BatchItem) {
        match (item.callback.func(), item.payload) {
            (CallbackFn::Bare(f), _) => f(),
            (CallbackFn::Event(f), Some(payload)) => {
                let event = ChangeEvent {
                    value: payload.latest_value,
                    changes: payload.changes,
                    node: Observable::new(self.clone(), payload.node),
                };
                f(&event);
            }
            (CallbackFn::Event(_), None) => {}
        }
    }
}
