//! JSON merge patches
//!
//! Twin documents are exchanged as JSON merge patches: objects merge
//! recursively, `null` deletes a key, anything else replaces.

use serde_json::{Map, Value};

/// Apply `patch` onto `target` in place
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

/// Smallest merge patch that turns `from` into `to`.
///
/// Returns an empty object when both documents are equal.
pub fn merge_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from_map), Value::Object(to_map)) => {
            let mut patch = Map::new();

            for (key, to_value) in to_map {
                match from_map.get(key) {
                    Some(from_value) if from_value == to_value => {}
                    Some(from_value) if from_value.is_object() && to_value.is_object() => {
                        patch.insert(key.clone(), merge_diff(from_value, to_value));
                    }
                    _ => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                }
            }

            for key in from_map.keys() {
                if !to_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }

            Value::Object(patch)
        }
        _ if from == to => Value::Object(Map::new()),
        _ => to.clone(),
    }
}

/// True when a patch carries no changes
pub fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}
