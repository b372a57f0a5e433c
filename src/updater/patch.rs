//! JSON merge patch (RFC 7386) computation

use serde_json::{Map, Value};

/// Two-way merge patch that turns `original` into `modified`.
///
/// Keys missing from `modified` become `null`; arrays and scalars are replaced
/// wholesale. Returns `None` when the two documents are equal.
pub fn merge_diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for (key, new_value) in modi {
                match orig.get(key) {
                    Some(old_value) => {
                        if let Some(sub) = merge_diff(old_value, new_value) {
                            patch.insert(key.clone(), sub);
                        }
                    }
                    None if new_value.is_null() => {}
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for (key, old_value) in orig {
                if !modi.contains_key(key) && !old_value.is_null() {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if original == modified => None,
        _ => Some(modified.clone()),
    }
}

/// Apply a merge patch to `target` in place
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_documents_produce_no_patch() {
        let doc = json!({"data": {"a": "1"}, "list": [1, 2]});
        assert_eq!(merge_diff(&doc, &doc), None);
    }

    #[test]
    fn test_changed_added_and_removed_keys() {
        let orig = json!({"data": {"a": "1", "b": "2"}});
        let modi = json!({"data": {"a": "9", "c": "3"}});
        let patch = merge_diff(&orig, &modi).unwrap();
        assert_eq!(patch, json!({"data": {"a": "9", "b": null, "c": "3"}}));
    }

    #[test]
    fn test_arrays_replace_wholesale() {
        let orig = json!({"ports": [{"port": 80}, {"port": 443}]});
        let modi = json!({"ports": [{"port": 443}]});
        assert_eq!(
            merge_diff(&orig, &modi).unwrap(),
            json!({"ports": [{"port": 443}]})
        );
    }

    #[test]
    fn test_diff_then_apply_converges() {
        let orig = json!({"spec": {"replicas": 1, "template": {"x": 1, "y": {"z": 2}}}});
        let modi = json!({"spec": {"replicas": 3, "template": {"y": {"z": 2, "w": 4}}}});
        let patch = merge_diff(&orig, &modi).unwrap();
        let mut target = orig.clone();
        apply_merge_patch(&mut target, &patch);
        assert_eq!(target, modi);
    }

    #[test]
    fn test_null_in_modified_when_absent_is_noop() {
        let orig = json!({"a": 1});
        let modi = json!({"a": 1, "b": null});
        assert_eq!(merge_diff(&orig, &modi), None);
    }
}
