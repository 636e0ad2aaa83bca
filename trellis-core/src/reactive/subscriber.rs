//! Listener types for the reactive system.
//!
//! A Listener is a registration on one node: a callback plus the mode that
//! decides which changes reach it. Several listeners may share one
//! [`Callback`]; the batch queue uses the callback's identity to deliver at
//! most once per flush.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::notify::ChangeEvent;
use super::runtime::{Engine, WeakEngine};
use crate::graph::NodeId;

/// Unique identifier for a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a callback, used as the merge key of the batch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Generate a new unique callback ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallbackId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which changes a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerMode {
    /// Changes at this node and anywhere below it.
    #[default]
    Deep,
    /// Changes to this node itself: whole-value writes and keys being added
    /// or removed.
    Shallow,
    /// Like `Shallow`, but only for bulk replacements flagged as optimized
    /// (collection mutations, array replacement).
    Optimized,
}

impl ListenerMode {
    /// Decide whether a change `level` steps below the node reaches this mode.
    pub fn accepts(self, level: usize, optimized: bool) -> bool {
        match self {
            ListenerMode::Deep => true,
            ListenerMode::Shallow => level == 0,
            ListenerMode::Optimized => optimized && level == 0,
        }
    }
}

/// The function a callback invokes.
#[derive(Clone)]
pub(crate) enum CallbackFn {
    /// Receives the full change event.
    Event(Rc<dyn Fn(&ChangeEvent)>),
    /// Takes no arguments, so no event is ever built for it.
    Bare(Rc<dyn Fn()>),
}

/// A callback with a stable identity.
pub(crate) struct Callback {
    id: CallbackId,
    func: CallbackFn,
}

impl Callback {
    pub(crate) fn event<F>(f: F) -> Rc<Self>
    where
        F: Fn(&ChangeEvent) + 'static,
    {
        Rc::new(Self {
            id: CallbackId::new(),
            func: CallbackFn::Event(Rc::new(f)),
        })
    }

    pub(crate) fn bare<F>(f: F) -> Rc<Self>
    where
        F: Fn() + 'static,
    {
        Rc::new(Self {
            id: CallbackId::new(),
            func: CallbackFn::Bare(Rc::new(f)),
        })
    }

    pub(crate) fn id(&self) -> CallbackId {
        self.id
    }

    pub(crate) fn func(&self) -> &CallbackFn {
        &self.func
    }

    /// `true` when the callback takes no arguments.
    pub(crate) fn requires_no_args(&self) -> bool {
        matches!(self.func, CallbackFn::Bare(_))
    }
}

/// A callback registered on a node.
#[derive(Clone)]
pub struct Listener {
    id: ListenerId,
    mode: ListenerMode,
    callback: Rc<Callback>,
}

impl Listener {
    pub(crate) fn new(mode: ListenerMode, callback: Rc<Callback>) -> Self {
        Self {
            id: ListenerId::new(),
            mode,
            callback,
        }
    }

    /// Get the listener's unique ID.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn mode(&self) -> ListenerMode {
        self.mode
    }

    /// Identity of the callback behind this listener.
    pub fn callback_id(&self) -> CallbackId {
        self.callback.id()
    }

    pub(crate) fn callback(&self) -> &Rc<Callback> {
        &self.callback
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("callback", &self.callback.id)
            .field("no_args", &self.callback.requires_no_args())
            .finish()
    }
}

/// Handle to a listener registration.
///
/// Dropping this handle unsubscribes the listener. Call
/// [`Subscription::detach`] to keep it registered for the lifetime of the
/// node instead.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    engine: WeakEngine,
    node: NodeId,
    listener: Option<ListenerId>,
}

impl Subscription {
    /// `listener` is `None` when the node was already gone at registration;
    /// the handle is then inert.
    pub(crate) fn new(engine: &Engine, node: NodeId, listener: Option<ListenerId>) -> Self {
        Self {
            engine: engine.downgrade(),
            node,
            listener,
        }
    }

    /// `true` while the listener is registered through this handle.
    pub fn is_active(&self) -> bool {
        self.listener.is_some()
    }

    /// The node the listener is registered on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Leave the listener registered and give up the handle.
    pub fn detach(mut self) {
        self.listener = None;
    }

    fn release(&mut self) {
        if let (Some(id), Some(engine)) = (self.listener.take(), self.engine.upgrade()) {
            engine.remove_listener(self.node, id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("node", &self.node)
            .field("listener", &self.listener)
            .finish()
    }
}
