//! Reactive Primitives
//!
//! This module implements the reactive engine: observable handles, dependency
//! tracking, change notification, batching, and the derived primitives built
//! on top of them.
//!
//! # Concepts
//!
//! ## Observables
//!
//! An [`Observable`] is a handle to one location in a tree of nested values.
//! Reading it inside a tracking frame records a dependency; writing it
//! notifies the listeners of the node and of every ancestor, each with the
//! path of the change relative to itself.
//!
//! ## Listeners
//!
//! A listener is registered on a node with a [`ListenerMode`]. Deep
//! listeners hear about changes anywhere below the node, shallow listeners
//! only about the node itself, optimized listeners only about bulk
//! collection changes of the node.
//!
//! ## Batches
//!
//! Inside a batch, deliveries are queued and merged per callback. When the
//! outermost batch closes, every callback runs once with all of its change
//! records.
//!
//! ## Derived values
//!
//! - [`Engine::observe`] runs an effect and re-runs it when what it read
//!   changes.
//! - [`Engine::computed`] keeps a locked observable in sync with a compute
//!   function, lazily.
//! - [`Engine::when`] waits once for a selector to become truthy.
//!
//! # Implementation Notes
//!
//! All state is owned by an [`Engine`] instance rather than by thread-locals,
//! so independent engines never interfere. Values live in an arena node
//! store (see [`crate::graph`]); handles are plain indices.

mod batch;
mod computed;
mod context;
mod effect;
mod notify;
mod observable;
mod runtime;
mod subscriber;
mod when;

pub use batch::BatchGuard;
pub use computed::Computed;
pub use context::{TrackedRead, TrackingScope};
pub use effect::{ObserveEvent, ObserveHandle};
pub use notify::{format_path, ChangeEvent, ChangeRecord};
pub use observable::{Access, Observable};
pub use runtime::{Engine, WeakEngine};
pub use subscriber::{CallbackId, Listener, ListenerId, ListenerMode, Subscription};
pub use when::{Selector, When};
