//! Wire encoding of change records.
//!
//! Change records are the contract between the engine and whatever stores or
//! ships its changes. Two encodings are provided:
//!
//! - MessagePack, with named fields, for compact transport.
//! - JSON, for logs and debugging.
//!
//! Both use the record's field names `path`, `pathTypes`, `valueAtPath` and
//! `previousValueAtPath`. An absent value (`Value::Undefined`) is encoded as
//! nil and decodes as `Value::Null`.

use crate::error::{EngineError, Result};
use crate::reactive::ChangeRecord;

/// Encode change records as MessagePack.
pub fn encode_changes(changes: &[ChangeRecord]) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(changes).map_err(|e| EngineError::Encode(e.to_string()))
}

/// Decode change records produced by [`encode_changes`].
pub fn decode_changes(bytes: &[u8]) -> Result<Vec<ChangeRecord>> {
    rmp_serde::from_slice(bytes).map_err(|e| EngineError::Decode(e.to_string()))
}

/// Render change records as JSON.
pub fn changes_to_json(changes: &[ChangeRecord]) -> Result<serde_json::Value> {
    serde_json::to_value(changes).map_err(|e| EngineError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Key, PathType, Value};
    use serde_json::json;

    fn sample() -> ChangeRecord {
        ChangeRecord {
            path: [Key::from("items"), Key::Index(2)].into_iter().collect(),
            path_types: [PathType::Array, PathType::Object].into_iter().collect(),
            value_at_path: Value::from(json!({"done": true})),
            previous_value_at_path: Value::from(json!({"done": false})),
        }
    }

    #[test]
    fn messagepack_preserves_records() {
        let changes = vec![sample()];
        let bytes = encode_changes(&changes).unwrap();
        assert_eq!(decode_changes(&bytes).unwrap(), changes);
    }

    #[test]
    fn json_uses_camel_case_fields() {
        let rendered = changes_to_json(&[sample()]).unwrap();
        assert_eq!(
            rendered,
            json!([{
                "path": ["items", 2],
                "pathTypes": ["array", "object"],
                "valueAtPath": {"done": true},
                "previousValueAtPath": {"done": false},
            }])
        );
    }

    #[test]
    fn undefined_decodes_as_null() {
        let mut change = sample();
        change.value_at_path = Value::Undefined;
        let bytes = encode_changes(&[change]).unwrap();
        assert_eq!(decode_changes(&bytes).unwrap()[0].value_at_path, Value::Null);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode_changes(&[0xc1]),
            Err(EngineError::Decode(_))
        ));
    }
}
