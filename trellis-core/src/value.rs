//! Value Model
//!
//! Observable state is a tree of [`Value`]s: primitives, objects, arrays,
//! keyed maps and sets. The engine never hands out references into this
//! tree; reads clone the addressed sub-value and writes replace it.
//!
//! Two values are equal when they are structurally equal. Object and map
//! entries compare without regard to insertion order, which is what the
//! notification layer relies on to suppress no-op writes.

use std::borrow::Cow;
use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// How far past the end of an array a single write may reach. The gap is
/// filled with `Undefined`.
pub const MAX_ARRAY_GAP: usize = 1024;

/// A single step into a composite value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Position in an array.
    Index(usize),
    /// Property of an object or entry of a map.
    Name(String),
}

impl Key {
    /// The key as a property name. Indices are rendered in decimal.
    pub fn as_name(&self) -> Cow<'_, str> {
        match self {
            Key::Name(name) => Cow::Borrowed(name.as_str()),
            Key::Index(index) => Cow::Owned(index.to_string()),
        }
    }

    /// The key as an array position, if it is one or parses as one.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Key::Index(index) => Some(*index),
            Key::Name(name) => name.parse().ok(),
        }
    }

    /// Rewrite the key into the form used by `container`: indices for
    /// arrays, names for everything else.
    pub(crate) fn normalized_for(&self, container: &Value) -> Key {
        match (container, self) {
            (Value::Array(_), Key::Name(_)) => match self.as_index() {
                Some(index) => Key::Index(index),
                None => self.clone(),
            },
            (Value::Array(_), Key::Index(_)) => self.clone(),
            (_, Key::Index(index)) => Key::Name(index.to_string()),
            (_, Key::Name(_)) => self.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Name(name) => f.write_str(name),
            Key::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

/// Structural type of the value found at one step of a change path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    Object,
    Array,
}

impl PathType {
    /// Arrays are `Array`; everything else, primitives included, is `Object`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Array(_) => PathType::Array,
            _ => PathType::Object,
        }
    }
}

/// Sequence of keys leading from a node down to a nested location.
pub type Path = SmallVec<[Key; 4]>;

/// Structural types matching a [`Path`] step for step.
pub type PathTypes = SmallVec<[PathType; 4]>;

/// A dynamically typed value held by an observable.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value. Writing `Undefined` to a key removes the key.
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    /// Keyed collection. Behaves like an object for reads and key writes,
    /// but bulk mutations notify the whole collection.
    Map(IndexMap<String, Value>),
    /// Collection of unique values. Members are not individually addressable.
    Set(Vec<Value>),
}

impl Value {
    /// An empty object.
    pub fn object() -> Self {
        Value::Object(IndexMap::new())
    }

    /// An empty array.
    pub fn array() -> Self {
        Value::Array(Vec::new())
    }

    /// Build an object from key/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// `Undefined` or `Null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Objects, arrays, maps and sets. Composite values get their own node
    /// when read through a parent.
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Object(_) | Value::Map(_) | Value::Set(_)
        )
    }

    /// Composite values whose members can be addressed by [`Key`].
    pub fn is_keyed(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_) | Value::Map(_))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Number of members of a composite value, zero for primitives.
    pub fn len(&self) -> usize {
        match self {
            Value::Array(items) | Value::Set(items) => items.len(),
            Value::Object(map) | Value::Map(map) => map.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of an addressable composite, in order.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Value::Array(items) => (0..items.len()).map(Key::Index).collect(),
            Value::Object(map) | Value::Map(map) => {
                map.keys().map(|k| Key::Name(k.clone())).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Member at `key`, if present.
    pub fn get_key(&self, key: &Key) -> Option<&Value> {
        match self {
            Value::Array(items) => key.as_index().and_then(|i| items.get(i)),
            Value::Object(map) | Value::Map(map) => map.get(key.as_name().as_ref()),
            _ => None,
        }
    }

    fn get_key_mut(&mut self, key: &Key) -> Option<&mut Value> {
        match self {
            Value::Array(items) => key.as_index().and_then(move |i| items.get_mut(i)),
            Value::Object(map) | Value::Map(map) => map.get_mut(key.as_name().as_ref()),
            _ => None,
        }
    }

    /// Member reached by following `path`, if every step exists.
    pub fn get_path(&self, path: &[Key]) -> Option<&Value> {
        path.iter().try_fold(self, |value, key| value.get_key(key))
    }

    /// Write `value` at `key` and return what was there before.
    ///
    /// `Undefined` removes the key from objects and maps, and drops the
    /// trailing slots of an array when written at its end. Nullish values
    /// are promoted to an empty container first (an array when `key` is an
    /// index). Writes into primitives and sets, and array writes more than
    /// [`MAX_ARRAY_GAP`] slots past the end, are ignored.
    pub fn set_key(&mut self, key: &Key, value: Value) -> Value {
        self.try_set_key(key, value).unwrap_or_default()
    }

    /// Like [`set_key`](Value::set_key), but `None` when the write was
    /// ignored.
    fn try_set_key(&mut self, key: &Key, value: Value) -> Option<Value> {
        if self.is_nullish() {
            if value.is_undefined() {
                return Some(Value::Undefined);
            }
            *self = match key {
                Key::Index(_) => Value::array(),
                Key::Name(_) => Value::object(),
            };
        }
        match self {
            Value::Array(items) => {
                let index = key.as_index()?;
                if value.is_undefined() {
                    if index >= items.len() {
                        return Some(Value::Undefined);
                    }
                    let previous = std::mem::take(&mut items[index]);
                    while items.last().is_some_and(Value::is_undefined) {
                        items.pop();
                    }
                    return Some(previous);
                }
                if index < items.len() {
                    return Some(std::mem::replace(&mut items[index], value));
                }
                if index - items.len() > MAX_ARRAY_GAP {
                    tracing::debug!(index, len = items.len(), "array write too far past the end ignored");
                    return None;
                }
                items.resize(index, Value::Undefined);
                items.push(value);
                Some(Value::Undefined)
            }
            Value::Object(map) | Value::Map(map) => {
                let name = key.as_name();
                Some(if value.is_undefined() {
                    map.shift_remove(name.as_ref()).unwrap_or_default()
                } else {
                    map.insert(name.into_owned(), value).unwrap_or_default()
                })
            }
            _ => None,
        }
    }

    /// Write `value` at `path`, creating intermediate containers through
    /// nullish steps. Returns `false` when the write was ignored, e.g. a
    /// primitive blocks the path.
    pub fn set_path(&mut self, path: &[Key], value: Value) -> bool {
        let Some((last, parents)) = path.split_last() else {
            *self = value;
            return true;
        };
        let mut target = self;
        for (i, key) in parents.iter().enumerate() {
            if target.get_key(key).is_none() {
                if value.is_undefined() {
                    return true;
                }
                let next = match path[i + 1] {
                    Key::Index(_) => Value::array(),
                    Key::Name(_) => Value::object(),
                };
                if target.try_set_key(key, next).is_none() {
                    return false;
                }
            }
            match target.get_key_mut(key) {
                Some(next) => target = next,
                None => return false,
            }
        }
        target.try_set_key(last, value).is_some()
    }

    /// Convert into a `serde_json::Value`. `Undefined` becomes `null`,
    /// maps become objects and sets become arrays.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) | Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) | Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Build a value that holds `value` at `path` and nothing else.
///
/// `path_types[i]` gives the shape of the container found at `path[..=i]`;
/// the outermost container is an array when the first key is an index.
pub fn construct_with_path(path: &[Key], path_types: &[PathType], value: Value) -> Value {
    let Some(first) = path.first() else {
        return value;
    };
    let mut acc = value;
    for i in (0..path.len() - 1).rev() {
        let mut container = match path_types.get(i) {
            Some(PathType::Array) => Value::array(),
            Some(PathType::Object) => Value::object(),
            None => match path[i + 1] {
                Key::Index(_) => Value::array(),
                Key::Name(_) => Value::object(),
            },
        };
        container.set_key(&path[i + 1], acc);
        acc = container;
    }
    let mut root = match first {
        Key::Index(_) => Value::array(),
        Key::Name(_) => Value::object(),
    };
    root.set_key(first, acc);
    root
}

/// Read the value at `path`, `Undefined` when any step is missing.
pub fn deconstruct_with_path(path: &[Key], value: &Value) -> Value {
    value.get_path(path).cloned().unwrap_or_default()
}

macro_rules! impl_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(n: $ty) -> Self {
                    Value::Number(n as f64)
                }
            }
        )*
    };
}

impl_from_number!(i8, i16, i32, i64, u8, u16, u32, u64, usize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Undefined)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Serde
// ----------------------------------------------------------------------------

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) | Value::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) | Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON-like value")
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Number(n as f64))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        Ok(Value::Number(n as f64))
    }

    fn visit_f64<E: de::Error>(self, n: f64) -> Result<Value, E> {
        Ok(Value::Number(n))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::String(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::String(s))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Deserialize::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((k, v)) = access.next_entry::<String, Value>()? {
            map.insert(k, v);
        }
        Ok(Value::Object(map))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_equality_ignores_key_order() {
        let a = Value::from(json!({"x": 1, "y": 2}));
        let b = Value::from(json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn set_key_undefined_removes_property() {
        let mut value = Value::from(json!({"a": 1, "b": 2}));
        let prev = value.set_key(&Key::from("a"), Value::Undefined);
        assert_eq!(prev, Value::from(1));
        assert_eq!(value, Value::from(json!({"b": 2})));
    }

    #[test]
    fn set_path_creates_intermediate_containers() {
        let mut value = Value::Undefined;
        assert!(value.set_path(&[Key::from("a"), Key::Index(1)], Value::from("x")));
        assert_eq!(
            value,
            Value::from_pairs([("a", Value::Array(vec![Value::Undefined, Value::from("x")]))])
        );
    }

    #[test]
    fn set_path_stops_at_primitives() {
        let mut value = Value::from(json!({"a": 5}));
        assert!(!value.set_path(&[Key::from("a"), Key::from("b")], Value::from(1)));
        assert_eq!(value, Value::from(json!({"a": 5})));
    }

    #[test]
    fn far_array_writes_are_ignored() {
        let mut value = Value::from(json!([1]));
        assert_eq!(value.set_key(&Key::Index(usize::MAX), Value::from(2)), Value::Undefined);
        assert!(!value.set_path(&[Key::from("4000000000")], Value::from(2)));
        assert_eq!(value, Value::from(json!([1])));

        assert!(value.set_path(&[Key::Index(3)], Value::from(4)));
        assert_eq!(value.len(), 4);
    }

    #[test]
    fn undefined_at_array_end_drops_trailing_slots() {
        let mut value = Value::from(json!([1]));
        value.set_key(&Key::Index(2), Value::from(3));
        assert_eq!(value.len(), 3);

        assert_eq!(value.set_key(&Key::Index(2), Value::Undefined), Value::from(3));
        assert_eq!(value, Value::from(json!([1])));

        // Holes in the middle stay.
        let mut value = Value::from(json!([1, 2, 3]));
        value.set_key(&Key::Index(1), Value::Undefined);
        assert_eq!(value, Value::Array(vec![Value::from(1), Value::Undefined, Value::from(3)]));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::object().is_truthy());
    }

    #[test]
    fn key_normalization_follows_container() {
        let arr = Value::array();
        let obj = Value::object();
        assert_eq!(Key::from("2").normalized_for(&arr), Key::Index(2));
        assert_eq!(Key::Index(2).normalized_for(&obj), Key::from("2"));
    }

    #[test]
    fn construct_and_deconstruct_path() {
        let path = [Key::from("list"), Key::Index(1), Key::from("name")];
        let types = [PathType::Array, PathType::Object, PathType::Object];
        let built = construct_with_path(&path, &types, Value::from("bob"));
        assert_eq!(
            built,
            Value::from_pairs([(
                "list",
                Value::Array(vec![
                    Value::Undefined,
                    Value::from_pairs([("name", "bob")]),
                ]),
            )])
        );
        assert_eq!(deconstruct_with_path(&path, &built), Value::from("bob"));
    }

    #[test]
    fn serializes_integers_without_fraction() {
        let text = serde_json::to_string(&Value::from(json!({"n": 3}))).unwrap();
        assert_eq!(text, r#"{"n":3}"#);
    }
}
