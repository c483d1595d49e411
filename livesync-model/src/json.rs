//! `serde_json::Value` payloads with object-level shallow merge.

use crate::Payload;
use serde_json::{Map, Value};

/// A partial JSON object: the top-level fields to overwrite.
pub type JsonPatch = Map<String, Value>;

/// Builds a [`JsonPatch`] from a JSON object literal.
///
/// Non-object values yield an empty patch.
pub fn json_patch(value: Value) -> JsonPatch {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Payload for Value {
    type Patch = JsonPatch;

    /// Top-level fields of `patch` replace those of `self`; nested objects are
    /// replaced wholesale, not merged. A non-object base is treated as empty.
    fn apply_patch(&self, patch: &JsonPatch) -> Value {
        let mut merged = match self {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (field, value) in patch {
            merged.insert(field.clone(), value.clone());
        }
        Value::Object(merged)
    }

    fn merge_patches(earlier: &JsonPatch, later: &JsonPatch) -> JsonPatch {
        let mut merged = earlier.clone();
        for (field, value) in later {
            merged.insert(field.clone(), value.clone());
        }
        merged
    }
}
