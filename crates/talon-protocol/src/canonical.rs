//! Canonical JSON form shared by token signing and audit hashing.
//!
//! The canonical form is compact UTF-8 JSON with recursively sorted object
//! keys. `serde_json`'s default `Map` is a `BTreeMap`, so routing any
//! serializable value through `Value` yields sorted keys at every level; no
//! crate in this workspace may enable `preserve_order`.

use serde::Serialize;

/// Serialize `value` to its canonical JSON string.
///
/// The same bytes come out for any two values that are structurally equal,
/// regardless of struct field declaration order or map insertion order. Both
/// the token signature and the audit hash chain are computed over this form,
/// in issue/append and verify/validate alike.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize)]
    struct Unsorted {
        zulu: u32,
        alpha: u32,
        mike: u32,
    }

    #[test]
    fn object_keys_are_sorted_recursively() {
        let value = json!({
            "z": {"b": 1, "a": 2},
            "a": [{"y": true, "x": false}],
        });
        let canon = canonical_json(&value).unwrap();
        assert_eq!(canon, r#"{"a":[{"x":false,"y":true}],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn struct_field_order_does_not_leak() {
        let canon = canonical_json(&Unsorted {
            zulu: 1,
            alpha: 2,
            mike: 3,
        })
        .unwrap();
        assert_eq!(canon, r#"{"alpha":2,"mike":3,"zulu":1}"#);
    }

    #[test]
    fn no_insignificant_whitespace() {
        let canon = canonical_json(&json!({"k": [1, 2, 3]})).unwrap();
        assert!(!canon.contains(' '));
    }

    // The hash chain recomputes hashes over deserialized events, so the
    // canonical form must survive a serialize -> deserialize -> serialize
    // cycle byte-for-byte, timestamps included.
    #[test]
    fn canonical_form_is_roundtrip_stable() {
        #[derive(Serialize, Deserialize)]
        struct Stamped {
            ts: chrono::DateTime<chrono::Utc>,
            data: serde_json::Value,
        }

        let original = Stamped {
            ts: chrono::Utc::now(),
            data: json!({"nested": {"b": 1.5, "a": "text"}, "n": null}),
        };
        let first = canonical_json(&original).unwrap();
        let reparsed: Stamped = serde_json::from_str(&first).unwrap();
        let second = canonical_json(&reparsed).unwrap();
        assert_eq!(first, second);
    }
}
