//! Per-backend request body adjustments.

use crate::core::config::BodyQuirks;
use serde_json::Value;

/// Apply `quirks` to a JSON request body in place.
///
/// Strip runs before set. Non-object bodies are left alone. Returns whether
/// the body changed.
pub fn apply_quirks(body: &mut Value, quirks: &BodyQuirks) -> bool {
    let Some(object) = body.as_object_mut() else {
        return false;
    };

    let mut changed = false;
    for field in &quirks.strip_fields {
        changed |= object.remove(field).is_some();
    }
    for (key, value) in &quirks.set_fields {
        if object.get(key) != Some(value) {
            object.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quirks(strip: &[&str], set: Value) -> BodyQuirks {
        BodyQuirks {
            strip_fields: strip.iter().map(|s| s.to_string()).collect(),
            set_fields: set.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_strip_then_set() {
        let mut body = json!({"model": "m", "top_k": 5, "stream_options": {}, "stream": true});
        let changed = apply_quirks(
            &mut body,
            &quirks(&["top_k", "stream_options", "absent"], json!({"stream": false})),
        );
        assert!(changed);
        assert_eq!(body, json!({"model": "m", "stream": false}));
    }

    #[test]
    fn test_set_overrides_stripped_field() {
        let mut body = json!({"temperature": 2.0});
        apply_quirks(
            &mut body,
            &quirks(&["temperature"], json!({"temperature": 1.0})),
        );
        assert_eq!(body, json!({"temperature": 1.0}));
    }

    #[test]
    fn test_non_object_body_untouched() {
        let mut body = json!(["not", "an", "object"]);
        assert!(!apply_quirks(&mut body, &quirks(&["x"], json!({"y": 1}))));
        assert_eq!(body, json!(["not", "an", "object"]));
    }

    #[test]
    fn test_no_change_reported() {
        let mut body = json!({"stream": false});
        assert!(!apply_quirks(&mut body, &quirks(&[], json!({"stream": false}))));
    }
}
