//! Deterministic JSON canonicalization
//!
//! Canonical form: object keys sorted byte-wise, no insignificant
//! whitespace, numbers rendered exactly as serde_json renders them. The
//! output is locale-independent and stable across processes, which is
//! what makes chain hashes reproducible by offline verifiers.

use serde::Serialize;
use serde_json::Value;

use crate::{CryptoError, CryptoResult};

/// Canonicalize a JSON value into deterministic bytes
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

/// Canonicalize any serializable value into deterministic bytes
pub fn canonicalize<T: Serialize>(value: &T) -> CryptoResult<Vec<u8>> {
    let json = serde_json::to_value(value)
        .map_err(|e| CryptoError::CanonicalizationFailed(e.to_string()))?;
    Ok(canonical_bytes(&json))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            // serde_json's string escaping is deterministic
            let escaped = serde_json::to_string(s).unwrap_or_default();
            out.extend_from_slice(escaped.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let escaped = serde_json::to_string(key).unwrap_or_default();
                out.extend_from_slice(escaped.as_bytes());
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a = json!({"b": 1, "a": {"y": true, "x": null}});
        let b = json!({"a": {"x": null, "y": true}, "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn test_canonical_form_is_compact_and_sorted() {
        let v = json!({"beta": [1, 2], "alpha": "hi"});
        let bytes = canonical_bytes(&v);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"alpha":"hi","beta":[1,2]}"#
        );
    }

    #[test]
    fn test_string_escaping_is_stable() {
        let v = json!({"s": "line\nbreak \"quoted\""});
        let first = canonical_bytes(&v);
        let second = canonical_bytes(&v);
        assert_eq!(first, second);
    }

    #[test]
    fn test_different_values_differ() {
        let a = json!({"amount": 100});
        let b = json!({"amount": 101});
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }
}
