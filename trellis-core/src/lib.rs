//! Trellis Core
//!
//! This crate provides the core of the Trellis reactive state engine. It
//! wraps nested data (objects, arrays, maps, sets, primitives) in a graph of
//! observable nodes so that:
//!
//! - Reads made inside a tracked computation are recorded automatically
//! - Writes notify exactly the listeners whose nodes changed, with the path
//!   and the before/after value of every change
//! - Notifications raised inside a batch are delivered once per listener
//! - Derived values (`computed`), effects (`observe`) and one-shot waits
//!   (`when`) stay up to date on their own
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: the dynamically typed [`Value`] held by observables, plus paths
//! - `graph`: the arena node store that backs every observable
//! - `reactive`: observables, tracking, notification, batching and the
//!   derived primitives
//! - `sink`: the seam through which a persistence layer receives changes
//! - `wire`: encodings of change records
//! - `config` / `error`: engine settings and error types
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use trellis_core::{Engine, Key, ListenerMode, Value};
//!
//! let engine = Engine::new();
//! let root = engine.observable(Value::from(serde_json::json!({"a": {"b": 1}})));
//!
//! let paths = Rc::new(RefCell::new(Vec::new()));
//! let log = paths.clone();
//! let _sub = root.on_change(ListenerMode::Deep, move |event| {
//!     for change in event.changes() {
//!         log.borrow_mut().push(change.path.to_vec());
//!     }
//! });
//!
//! root.child("a").child("b").set(2);
//! assert_eq!(*paths.borrow(), vec![vec![Key::from("a"), Key::from("b")]]);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod sink;
pub mod value;
pub mod wire;

pub use config::{EngineConfig, SafetyNet};
pub use error::{EngineError, Result};
pub use reactive::{
    Access, ChangeEvent, ChangeRecord, Computed, Engine, ListenerMode, ObserveEvent,
    ObserveHandle, Observable, Selector, Subscription, When,
};
pub use sink::{ChangeSink, PendingChange, PendingChanges, Persisted};
pub use value::{Key, Path, PathType, Value};
