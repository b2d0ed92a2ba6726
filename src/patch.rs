//! JSON merge-patch (RFC 7386) for shared state.
use serde_json::{Map, Value};

/// Apply `patch` to `target` in place.
///
/// Object patches merge key by key: a `null` member removes the key, an object
/// member merges recursively, anything else replaces. A non-object patch
/// replaces the target outright.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            map.remove(key);
            continue;
        }
        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_deletes_and_objects_merge() {
        let mut doc = json!({"a": 1, "b": {"c": 1}});
        merge_patch(&mut doc, &json!({"b": {"c": null, "d": 2}}));
        assert_eq!(doc, json!({"a": 1, "b": {"d": 2}}));
    }

    #[test]
    fn non_objects_replace() {
        let mut doc = json!({"a": "x", "b": [1, 2], "c": {"keep": true}});
        merge_patch(&mut doc, &json!({"a": {"nested": 1}, "b": [3], "c": 7, "new": {"x": null}}));
        assert_eq!(doc, json!({"a": {"nested": 1}, "b": [3], "c": 7, "new": {}}));

        let mut doc = json!({"a": 1});
        merge_patch(&mut doc, &json!(["replaced"]));
        assert_eq!(doc, json!(["replaced"]));
    }

    #[test]
    fn empty_patch_is_a_no_op() {
        let mut doc = json!({"app_prefix": "demo-"});
        merge_patch(&mut doc, &json!({}));
        assert_eq!(doc, json!({"app_prefix": "demo-"}));
    }
}
