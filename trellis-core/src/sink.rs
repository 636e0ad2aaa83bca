//! Change sink seam.
//!
//! The engine does not persist anything itself. A persistence layer plugs in
//! by implementing [`ChangeSink`] and installing it with
//! [`Engine::set_sink`](crate::Engine::set_sink); an observable is then
//! connected to it with [`Observable::persist`](crate::Observable::persist).
//!
//! Every delivery to the sink carries the node's latest value and the change
//! records behind it. Until the sink confirms a save, the affected paths are
//! tracked as pending: the value before the first unsaved change and the
//! latest value. The pending set is handed to
//! [`ChangeSink::update_pending`] whenever it changes, so a sink can store it
//! as metadata and replay it after a restart.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::reactive::{format_path, ChangeRecord, ListenerMode, Observable, Subscription};
use crate::value::{PathTypes, Value};

/// Receiver of persisted changes.
pub trait ChangeSink {
    /// Store the latest value of `table`. `changes` describes what changed
    /// since the previous delivery, oldest first.
    fn save(&self, table: &str, value: &Value, changes: &[ChangeRecord]) -> Result<()>;

    /// The set of unsaved changes of `table` changed.
    fn update_pending(&self, _table: &str, _pending: &PendingChanges) {}
}

/// One unsaved location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Value before the first unsaved change.
    #[serde(rename = "p")]
    pub previous: Value,
    /// Latest value.
    #[serde(rename = "v")]
    pub value: Value,
    #[serde(rename = "t")]
    pub path_types: PathTypes,
}

/// Unsaved changes keyed by path (`a/b/0`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingChanges(IndexMap<String, PendingChange>);

impl PendingChanges {
    /// Note `change`. The first previous value of a path is kept.
    pub fn record(&mut self, change: &ChangeRecord) {
        self.0
            .entry(format_path(&change.path))
            .and_modify(|pending| {
                pending.value = change.value_at_path.clone();
                pending.path_types = change.path_types.clone();
            })
            .or_insert_with(|| PendingChange {
                previous: change.previous_value_at_path.clone(),
                value: change.value_at_path.clone(),
                path_types: change.path_types.clone(),
            });
    }

    /// Forget the pending change at `path`.
    pub fn resolve(&mut self, path: &str) -> Option<PendingChange> {
        self.0.shift_remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&PendingChange> {
        self.0.get(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PendingChange)> {
        self.0.iter().map(|(path, change)| (path.as_str(), change))
    }
}

/// An observable connected to the engine's change sink.
///
/// Changes stop flowing to the sink when this handle is dropped.
pub struct Persisted {
    table: String,
    observable: Observable,
    pending: Rc<RefCell<PendingChanges>>,
    _subscription: Subscription,
}

impl Persisted {
    pub(crate) fn attach(observable: &Observable, table: String) -> Result<Self> {
        let sink = observable
            .engine()
            .sink()
            .ok_or(EngineError::MissingConfiguration { what: "change sink" })?;

        let pending = Rc::new(RefCell::new(PendingChanges::default()));
        let tracked = pending.clone();
        let name = table.clone();
        let subscription = observable.on_change(ListenerMode::Deep, move |event| {
            for change in event.changes() {
                tracked.borrow_mut().record(change);
            }
            sink.update_pending(&name, &tracked.borrow());

            match sink.save(&name, event.value(), event.changes()) {
                Ok(()) => {
                    {
                        let mut tracked = tracked.borrow_mut();
                        for change in event.changes() {
                            tracked.resolve(&format_path(&change.path));
                        }
                    }
                    sink.update_pending(&name, &tracked.borrow());
                }
                Err(err) => {
                    tracing::warn!(table = %name, error = %err, "save failed; changes stay pending");
                }
            }
        });

        Ok(Self {
            table,
            observable: observable.clone(),
            pending,
            _subscription: subscription,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn observable(&self) -> &Observable {
        &self.observable
    }

    /// Snapshot of the changes the sink has not confirmed yet.
    pub fn pending(&self) -> PendingChanges {
        self.pending.borrow().clone()
    }
}

impl fmt::Debug for Persisted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persisted")
            .field("table", &self.table)
            .field("node", &self.observable.id())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}
