//! Request fingerprints.
//!
//! Two requests carry the same fingerprint when they have the same method,
//! the same path, and bodies that differ only in JSON key order or
//! whitespace.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 hex of `METHOD\npath\ncanonical_body`.
pub fn fingerprint(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_body(body));
    format!("{:x}", hasher.finalize())
}

/// Sorted, compact JSON when the body parses as JSON; otherwise the raw bytes
/// with ASCII whitespace removed.
pub fn canonical_body(body: &[u8]) -> Vec<u8> {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => serde_json::to_vec(&sort_keys(value)).unwrap_or_else(|_| strip_whitespace(body)),
        Err(_) => strip_whitespace(body),
    }
}

fn strip_whitespace(body: &[u8]) -> Vec<u8> {
    body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect()
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_and_whitespace_do_not_matter() {
        let a = fingerprint("POST", "/bookings", br#"{"b": 1, "a": {"y": [1, 2], "x": null}}"#);
        let b = fingerprint("post", "/bookings", br#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_method_path_and_values_matter() {
        let base = fingerprint("POST", "/bookings", br#"{"a":1}"#);
        assert_ne!(base, fingerprint("PUT", "/bookings", br#"{"a":1}"#));
        assert_ne!(base, fingerprint("POST", "/bookings/1", br#"{"a":1}"#));
        assert_ne!(base, fingerprint("POST", "/bookings", br#"{"a":2}"#));
        assert_ne!(base, fingerprint("POST", "/bookings", br#"[{"a":1}]"#));
    }

    #[test]
    fn test_non_json_bodies_ignore_whitespace() {
        assert_eq!(canonical_body(b"name = x\n&id=1 "), b"name=x&id=1".to_vec());
        assert_eq!(
            fingerprint("POST", "/upload", b"a b"),
            fingerprint("POST", "/upload", b"ab")
        );
        assert_eq!(canonical_body(b""), Vec::<u8>::new());
    }
}
