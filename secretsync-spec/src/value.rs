//! The JSON value model and the deep-merge primitive.
//!
//! Merge semantics: maps merge recursively, sequences append, scalars and
//! type conflicts are overridden by the right-hand side. A `null` on the
//! right-hand side preserves the left-hand value rather than clearing it;
//! callers that want deletion must delete explicitly. This surprises most
//! readers on first contact, but downstream tooling depends on it.

use crate::path::SecretPath;
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// A flat map from logical leaf path to secret document. This is the shape
/// of a source read, a merge-store entry, and a destination inventory.
pub type SecretTree = BTreeMap<SecretPath, Value>;

/// Deep-merge `src` into `dst` and return the result.
///
/// Both inputs are consumed, so the result can never alias storage that a
/// caller might later mutate. Runs in time linear in the total node count.
pub fn deep_merge(dst: Value, src: Value) -> Value {
    match (dst, src) {
        (Value::Object(mut dst_map), Value::Object(src_map)) => {
            for (key, src_val) in src_map {
                match dst_map.remove(&key) {
                    Some(dst_val) => {
                        dst_map.insert(key, deep_merge(dst_val, src_val));
                    }
                    None => {
                        dst_map.insert(key, src_val);
                    }
                }
            }
            Value::Object(dst_map)
        }
        (Value::Array(mut dst_seq), Value::Array(src_seq)) => {
            dst_seq.extend(src_seq);
            Value::Array(dst_seq)
        }
        // null on the right preserves the left-hand value.
        (dst, Value::Null) => dst,
        (_, src) => src,
    }
}

/// Merge `src` into `dst` at the tree level: shared paths deep-merge their
/// documents, new paths are inserted.
pub fn merge_tree(mut dst: SecretTree, src: SecretTree) -> SecretTree {
    for (path, src_doc) in src {
        match dst.remove(&path) {
            Some(dst_doc) => {
                dst.insert(path, deep_merge(dst_doc, src_doc));
            }
            None => {
                dst.insert(path, src_doc);
            }
        }
    }
    dst
}

/// Structural JSON equality: map key order is irrelevant, sequence order is
/// significant, numbers compare by value (`1.0 == 1`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, va)| y.get(k).is_some_and(|vb| values_equal(va, vb)))
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(va, vb)| values_equal(va, vb))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Compare two opaque payloads: when both parse as JSON the comparison is
/// structural, otherwise byte-for-byte.
pub fn blobs_equal(a: &[u8], b: &[u8]) -> bool {
    match (
        serde_json::from_slice::<Value>(a),
        serde_json::from_slice::<Value>(b),
    ) {
        (Ok(va), Ok(vb)) => values_equal(&va, &vb),
        _ => a == b,
    }
}

/// Encode a tree as canonical JSON: UTF-8, object keys in ascending order at
/// every level, so byte-equal encodings indicate logical equality.
pub fn canonical_json(tree: &SecretTree) -> String {
    // BTreeMap keys iterate in ascending order, and serde_json's default
    // object map is itself ordered, so plain serialization is canonical.
    serde_json::to_string(tree).expect("secret trees always serialize")
}

/// Decode a merge-store payload back into a tree.
pub fn decode_tree(bytes: &[u8]) -> serde_json::Result<SecretTree> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_merge_recursively() {
        let dst = json!({"api_keys": {"stripe": "sk_old"}, "tags": ["prod"]});
        let src = json!({"api_keys": {"datadog": "dd_key"}, "tags": ["v2"]});
        let merged = deep_merge(dst, src);
        assert_eq!(
            merged,
            json!({
                "api_keys": {"stripe": "sk_old", "datadog": "dd_key"},
                "tags": ["prod", "v2"],
            })
        );
    }

    #[test]
    fn sequences_append_without_dedup() {
        let merged = deep_merge(json!(["a", "b"]), json!(["c", "a"]));
        assert_eq!(merged, json!(["a", "b", "c", "a"]));
    }

    #[test]
    fn scalars_override_and_are_not_commutative() {
        assert_eq!(deep_merge(json!("1.0"), json!("2.0")), json!("2.0"));
        assert_eq!(deep_merge(json!("2.0"), json!("1.0")), json!("1.0"));
    }

    #[test]
    fn type_conflict_takes_src() {
        assert_eq!(deep_merge(json!(["a"]), json!("scalar")), json!("scalar"));
        assert_eq!(deep_merge(json!({"k": 1}), json!([2])), json!([2]));
    }

    #[test]
    fn null_src_preserves_dst() {
        assert_eq!(deep_merge(json!("keep"), Value::Null), json!("keep"));
        let merged = deep_merge(json!({"keep": "old", "other": 1}), json!({"keep": null}));
        assert_eq!(merged, json!({"keep": "old", "other": 1}));
    }

    #[test]
    fn null_dst_yields_src() {
        assert_eq!(deep_merge(Value::Null, json!({"a": 1})), json!({"a": 1}));
        assert_eq!(deep_merge(Value::Null, Value::Null), Value::Null);
    }

    #[test]
    fn empty_collections_are_identities() {
        assert_eq!(deep_merge(json!({"a": 1}), json!({})), json!({"a": 1}));
        assert_eq!(deep_merge(json!(["a"]), json!([])), json!(["a"]));
    }

    #[test]
    fn map_union_over_disjoint_keys() {
        let merged = deep_merge(json!({"a": 1}), json!({"b": 2}));
        let obj = merged.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj.contains_key("a") && obj.contains_key("b"));
    }

    #[test]
    fn merge_is_associative_on_maps() {
        let a = json!({"x": {"p": 1}, "list": [1]});
        let b = json!({"x": {"q": 2}, "list": [2]});
        let c = json!({"x": {"p": 3}, "list": [3]});
        let left = deep_merge(deep_merge(a.clone(), b.clone()), c.clone());
        let right = deep_merge(a, deep_merge(b, c));
        assert!(values_equal(&left, &right));
    }

    #[test]
    fn equality_ignores_key_order_but_not_sequence_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert!(values_equal(&a, &b));
        assert!(!values_equal(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(values_equal(&json!(1.0), &json!(1)));
        assert!(!values_equal(&json!(1.5), &json!(1)));
    }

    #[test]
    fn blob_comparison_falls_back_to_bytes() {
        assert!(blobs_equal(br#"{"a":1,"b":2}"#, br#"{"b":2,"a":1}"#));
        assert!(blobs_equal(b"plain text", b"plain text"));
        assert!(!blobs_equal(b"plain text", b"other text"));
    }

    #[test]
    fn canonical_encoding_round_trips() {
        let mut tree = SecretTree::new();
        tree.insert(
            SecretPath::parse("b/nested").unwrap(),
            json!({"z": 1, "a": [true, null]}),
        );
        tree.insert(SecretPath::parse("a/first").unwrap(), json!("v"));

        let encoded = canonical_json(&tree);
        // Ascending key order at the top level.
        assert!(encoded.find("a/first").unwrap() < encoded.find("b/nested").unwrap());

        let decoded = decode_tree(encoded.as_bytes()).expect("decode");
        assert_eq!(decoded, tree);
    }

    #[test]
    fn tree_merge_folds_shared_paths() {
        let path = SecretPath::parse("svc/creds").unwrap();
        let mut dst = SecretTree::new();
        dst.insert(path.clone(), json!({"user": "admin"}));
        let mut src = SecretTree::new();
        src.insert(path.clone(), json!({"pass": "s3cret"}));
        src.insert(SecretPath::parse("svc/extra").unwrap(), json!(true));

        let merged = merge_tree(dst, src);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[&path], json!({"user": "admin", "pass": "s3cret"}));
    }
}
