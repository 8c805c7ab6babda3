//! Secret redaction for audit `args`/`result` snapshots (§4.9, §8 law).
//!
//! Object keys whose final path segment looks secret-shaped are replaced with
//! `"[REDACTED]"` regardless of the original value; long strings are truncated;
//! recursion is bounded so a hostile or accidentally-cyclic-looking payload can't
//! blow the stack.

use serde_json::Value;

/// Case-insensitive markers that make a key "secret-shaped".
///
/// A `/secret|token|password|key|auth|credential/i`-equivalent check implemented as
/// a substring test rather than a compiled regex — the set is fixed and small.
const SECRET_MARKERS: &[&str] = &["secret", "token", "password", "key", "auth", "credential"];

/// Strings longer than this are truncated before being written.
const MAX_STRING_LEN: usize = 200;

/// Maximum object/array nesting the redactor will descend into.
const MAX_DEPTH: usize = 3;

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn truncate_string(s: &str) -> Value {
    if s.chars().count() > MAX_STRING_LEN {
        let truncated: String = s.chars().take(MAX_STRING_LEN).collect();
        Value::String(format!("{truncated}... [truncated]"))
    } else {
        Value::String(s.to_string())
    }
}

/// Recursively redact secret-shaped keys and truncate long strings in `value`.
#[must_use]
pub fn redact(value: &Value) -> Value {
    redact_at_depth(value, 0)
}

fn redact_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return match value {
            Value::Object(_) | Value::Array(_) => Value::String("[depth-limit]".to_string()),
            other => other.clone(),
        };
    }

    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_secret_key(k) {
                    out.insert(k.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    out.insert(k.clone(), redact_at_depth(v, depth + 1));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| redact_at_depth(v, depth + 1)).collect())
        }
        Value::String(s) => truncate_string(s),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_secret_shaped_keys() {
        let input = json!({"password": "p", "apiKey": "k", "data": "ok"});
        let out = redact(&input);
        assert_eq!(out["password"], json!("[REDACTED]"));
        assert_eq!(out["apiKey"], json!("[REDACTED]"));
        assert_eq!(out["data"], json!("ok"));
    }

    #[test]
    fn redacts_regardless_of_value_length() {
        let input = json!({"token": ""});
        let out = redact(&input);
        assert_eq!(out["token"], json!("[REDACTED]"));
    }

    #[test]
    fn truncates_long_strings() {
        let long = "x".repeat(250);
        let input = json!({"data": long});
        let out = redact(&input);
        let s = out["data"].as_str().unwrap();
        assert!(s.ends_with("... [truncated]"));
        assert!(s.len() < 250);
    }

    #[test]
    fn bounds_recursion_depth() {
        let input = json!({"a": {"b": {"c": {"secret": "deep"}}}});
        let out = redact(&input);
        // depth 0 = a, 1 = b, 2 = c -> at depth 3 the object is collapsed
        assert_eq!(out["a"]["b"]["c"], json!("[depth-limit]"));
    }

    #[test]
    fn redacts_inside_arrays() {
        let input = json!([{"auth": "bearer xyz"}, {"data": "fine"}]);
        let out = redact(&input);
        assert_eq!(out[0]["auth"], json!("[REDACTED]"));
        assert_eq!(out[1]["data"], json!("fine"));
    }
}
