//! Notification Engine
//!
//! Given a node that changed, the notification engine builds a
//! [`ChangeRecord`] for each listener that wants it and hands the delivery
//! to the batch queue.
//!
//! # Walking up
//!
//! A change is first dispatched at the node where it happened (level 0).
//! It then moves to the parent: the node's key is prepended to the record's
//! path and the node's structural type to its path types, and the level is
//! incremented. A listener registered several levels up therefore receives
//! the full relative path of the change and never has to diff.
//!
//! # Walking down
//!
//! Replacing a composite value changes every materialized node beneath it.
//! Those nodes are visited before the walk up: each one whose value differs
//! is dispatched at its own level 0, and nodes whose key disappeared are
//! destroyed afterwards.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::batch::BatchItem;
use super::observable::Observable;
use super::runtime::Engine;
use super::subscriber::Callback;
use crate::error::{EngineError, Result};
use crate::graph::NodeId;
use crate::value::{Key, Path, PathType, PathTypes, Value};

/// One mutation, described relative to the node that receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Keys from the receiving node down to the mutated location.
    pub path: Path,
    /// Structural type of the value at each step of `path`.
    pub path_types: PathTypes,
    /// New value at the mutated location.
    pub value_at_path: Value,
    /// Value at the mutated location before the change.
    pub previous_value_at_path: Value,
}

/// What a listener receives when the node it watches changes.
#[derive(Clone)]
pub struct ChangeEvent {
    pub(crate) value: Value,
    pub(crate) changes: Vec<ChangeRecord>,
    pub(crate) node: Observable,
}

impl ChangeEvent {
    /// Latest value of the listener's node.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Every change behind this delivery, oldest first.
    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    /// The node the listener is registered on.
    pub fn node(&self) -> &Observable {
        &self.node
    }

    /// Rebuild the node's value as it was before these changes.
    ///
    /// Computed on demand by undoing the change records newest first.
    pub fn previous(&self) -> Result<Value> {
        let mut previous = self.value.clone();
        for change in self.changes.iter().rev() {
            if !previous.set_path(&change.path, change.previous_value_at_path.clone()) {
                return Err(EngineError::PreviousValue {
                    path: format_path(&change.path),
                });
            }
        }
        Ok(previous)
    }
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("node", &self.node.id())
            .field("value", &self.value)
            .field("changes", &self.changes)
            .finish()
    }
}

/// Render a path as `a/b/0`.
pub fn format_path(path: &[Key]) -> String {
    path.iter()
        .map(|k| k.as_name().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A change on its way through the node graph.
#[derive(Debug, Clone)]
pub(crate) struct Propagation {
    path: Path,
    path_types: PathTypes,
    value_at_path: Value,
    previous_value_at_path: Value,
    level: usize,
    optimized: bool,
    walk_up: bool,
}

impl Propagation {
    /// A change of the receiving node's own value.
    pub(crate) fn own(value: Value, previous: Value, optimized: bool) -> Self {
        Self {
            path: Path::new(),
            path_types: PathTypes::new(),
            value_at_path: value,
            previous_value_at_path: previous,
            level: 0,
            optimized,
            walk_up: false,
        }
    }

    /// A change of the member at `key` of the receiving node, dispatched as
    /// a change of the node itself.
    pub(crate) fn at_key(
        key: Key,
        path_type: PathType,
        value: Value,
        previous: Value,
        optimized: bool,
    ) -> Self {
        let mut change = Self::own(value, previous, optimized);
        change.path.push(key);
        change.path_types.push(path_type);
        change
    }

    /// Continue through the ancestors after the first node.
    pub(crate) fn walk_up(mut self) -> Self {
        self.walk_up = true;
        self
    }

    fn record(&self) -> ChangeRecord {
        ChangeRecord {
            path: self.path.clone(),
            path_types: self.path_types.clone(),
            value_at_path: self.value_at_path.clone(),
            previous_value_at_path: self.previous_value_at_path.clone(),
        }
    }
}

impl Engine {
    /// Dispatch `change` at `node`, then at each ancestor when the change
    /// walks up.
    pub(crate) fn notify(&self, node: NodeId, mut change: Propagation) {
        let mut current = Some(node);
        while let Some(id) = current {
            let (callbacks, parent, key, path_type, value) = {
                let store = self.store().borrow();
                let Some(target) = store.get(id) else {
                    return;
                };
                let callbacks: Vec<Rc<Callback>> = target
                    .listeners()
                    .values()
                    .filter(|l| l.mode().accepts(change.level, change.optimized))
                    .map(|l| l.callback().clone())
                    .collect();
                let path_type = store.value_ref(id).map_or(PathType::Object, PathType::of);
                let value = if callbacks.iter().any(|c| !c.requires_no_args()) {
                    store.value_of(id)
                } else {
                    Value::Undefined
                };
                (callbacks, target.parent(), target.key().cloned(), path_type, value)
            };

            if !callbacks.is_empty() {
                let record = change.record();
                for callback in callbacks {
                    let item = if callback.requires_no_args() {
                        BatchItem::bare(callback)
                    } else {
                        BatchItem::event(callback, id, value.clone(), record.clone())
                    };
                    self.batch_notify(item);
                }
            }

            if !change.walk_up {
                return;
            }
            match (parent, key) {
                (Some(parent), Some(key)) => {
                    change.path.insert(0, key);
                    change.path_types.insert(0, path_type);
                    change.level += 1;
                    current = Some(parent);
                }
                _ => current = None,
            }
        }
    }

    /// Visit the materialized descendants of `node` after its value went
    /// from `old` to `new`.
    pub(crate) fn notify_descendants(&self, node: NodeId, old: &Value, new: &Value, optimized: bool) {
        let children: Vec<(Key, NodeId)> = match self.store().borrow().get(node) {
            Some(n) => n.children().iter().map(|(k, id)| (k.clone(), *id)).collect(),
            None => return,
        };

        for (key, child) in children {
            let old_child = old.get_key(&key).cloned().unwrap_or_default();
            let new_child = new.get_key(&key).cloned().unwrap_or_default();
            if old_child == new_child {
                continue;
            }
            if let Some(n) = self.store().borrow_mut().get_mut(child) {
                n.set_primitive(!new_child.is_composite());
            }

            self.notify(
                child,
                Propagation::own(new_child.clone(), old_child.clone(), optimized),
            );
            self.notify_descendants(child, &old_child, &new_child, optimized);

            if new_child.is_undefined() {
                self.destroy_node(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::ListenerMode;
    use serde_json::json;
    use std::cell::RefCell;

    fn collect(state: &Observable, mode: ListenerMode) -> (Rc<RefCell<Vec<ChangeEvent>>>, crate::Subscription) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let sub = state.on_change(mode, move |e| sink.borrow_mut().push(e.clone()));
        (events, sub)
    }

    #[test]
    fn nested_change_reaches_root_with_full_path() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(json!({"a": {"b": 1}})));
        let (events, _sub) = collect(&root, ListenerMode::Deep);

        root.child("a").child("b").set(2);

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        let change = &events[0].changes()[0];
        assert_eq!(change.path.as_slice(), &[Key::from("a"), Key::from("b")]);
        assert_eq!(
            change.path_types.as_slice(),
            &[PathType::Object, PathType::Object]
        );
        assert_eq!(change.value_at_path, Value::from(2));
        assert_eq!(change.previous_value_at_path, Value::from(1));
        assert_eq!(events[0].value(), &Value::from(json!({"a": {"b": 2}})));
    }

    #[test]
    fn array_steps_are_typed_as_arrays() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(json!({"list": [{"n": 1}]})));
        let (events, _sub) = collect(&root, ListenerMode::Deep);

        root.child("list").child(Key::Index(0)).child("n").set(5);

        let events = events.borrow();
        let change = &events[0].changes()[0];
        assert_eq!(
            change.path.as_slice(),
            &[Key::from("list"), Key::Index(0), Key::from("n")]
        );
        assert_eq!(
            change.path_types.as_slice(),
            &[PathType::Array, PathType::Object, PathType::Object]
        );
    }

    #[test]
    fn shallow_listener_ignores_nested_changes() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(json!({"a": {"b": 1}})));
        let (events, _sub) = collect(&root, ListenerMode::Shallow);

        root.child("a").child("b").set(2);
        assert!(events.borrow().is_empty());

        // Adding a key is a change of the root itself.
        root.set_key("c", 3);
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(events.borrow()[0].changes()[0].path.as_slice(), &[Key::from("c")]);
    }

    #[test]
    fn optimized_listener_only_hears_bulk_changes() {
        let engine = Engine::new();
        let list = engine.observable(Value::from(json!([1, 2])));
        let (events, _sub) = collect(&list, ListenerMode::Optimized);

        list.child(Key::Index(0)).set(10);
        assert!(events.borrow().is_empty());

        list.push(3);
        assert_eq!(events.borrow().len(), 1);
        let binding = events.borrow();
        let change = &binding[0].changes()[0];
        assert!(change.path.is_empty());
        assert_eq!(change.value_at_path, Value::from(json!([10, 2, 3])));
        assert_eq!(change.previous_value_at_path, Value::from(json!([10, 2])));
    }

    #[test]
    fn replacing_a_parent_notifies_descendant_listeners() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(json!({"a": {"b": 1, "c": 1}})));
        let (b_events, _b) = collect(&root.child("a").child("b"), ListenerMode::Deep);
        let (c_events, _c) = collect(&root.child("a").child("c"), ListenerMode::Deep);

        root.set(Value::from(json!({"a": {"b": 2, "c": 1}})));

        assert_eq!(b_events.borrow().len(), 1);
        assert_eq!(b_events.borrow()[0].value(), &Value::from(2));
        assert!(c_events.borrow().is_empty());
    }

    #[test]
    fn previous_value_undoes_changes() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(json!({"a": 1, "b": {"c": 2}})));
        let (events, _sub) = collect(&root, ListenerMode::Deep);

        engine.batch(|| {
            root.child("a").set(10);
            root.child("b").child("c").set(20);
            root.set_key("d", 4);
        });

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].previous().unwrap(),
            Value::from(json!({"a": 1, "b": {"c": 2}}))
        );
    }

    #[test]
    fn previous_value_drops_appended_elements() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(json!({"list": [1]})));
        let (events, _sub) = collect(&root, ListenerMode::Deep);

        engine.batch(|| {
            root.child("list").child(Key::Index(1)).set(5);
            root.child("list").child(Key::Index(3)).set(7);
        });

        let events = events.borrow();
        assert_eq!(events[0].previous().unwrap(), Value::from(json!({"list": [1]})));
    }

    #[test]
    fn previous_value_reports_unreachable_paths() {
        let engine = Engine::new();
        let root = engine.observable(Value::from(5));
        let event = ChangeEvent {
            value: Value::from(5),
            changes: vec![ChangeRecord {
                path: [Key::from("a")].into_iter().collect(),
                path_types: [PathType::Object].into_iter().collect(),
                value_at_path: Value::from(1),
                previous_value_at_path: Value::from(0),
            }],
            node: root,
        };
        assert_eq!(
            event.previous(),
            Err(EngineError::PreviousValue { path: "a".into() })
        );
    }
}
