//! Dotted-path helpers over `serde_json::Value` trees.

use serde_json::{Map, Value};

pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;

    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let index = part.parse::<usize>().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Overlay `overlay` onto `base`; objects merge key by key, anything else
/// is replaced.
pub fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Write `value` at `path`, creating (or replacing non-object) intermediates.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Dotted keys of every leaf below `value`, each prefixed with `prefix`.
pub fn leaf_keys(value: &Value, prefix: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                leaf_keys(child, &path, out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push(prefix.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_path() {
        let tree = json!({"Q1": {"setting": {"LO": 4.35e9}, "couplers": ["C1", "C2"]}});
        assert_eq!(extract_path(&tree, "Q1.setting.LO"), Some(&json!(4.35e9)));
        assert_eq!(extract_path(&tree, "Q1.couplers.1"), Some(&json!("C2")));
        assert_eq!(extract_path(&tree, "Q1.setting.POW"), None);
        assert_eq!(extract_path(&tree, "Q1.setting.LO.x"), None);
    }

    #[test]
    fn test_merge_values() {
        let base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let overlay = json!({"a": {"b": 10}, "e": 5});
        assert_eq!(
            merge_values(base, overlay),
            json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 5})
        );
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut tree = json!({"a": 1});
        set_path(&mut tree, "a.b.c", json!(true));
        set_path(&mut tree, "x", json!("y"));
        assert_eq!(tree, json!({"a": {"b": {"c": true}}, "x": "y"}));
    }

    #[test]
    fn test_leaf_keys() {
        let tree = json!({"Q1": {"setting": {"LO": 1, "POW": 2}}, "station": "Test"});
        let mut keys = Vec::new();
        leaf_keys(&tree, "", &mut keys);
        assert_eq!(keys, vec!["Q1.setting.LO", "Q1.setting.POW", "station"]);
    }
}
