//! Deterministic cache keys for parameterized queries.

use std::collections::BTreeMap;

use serde_json::Value;

/// BLAKE3 hash of the query text and its canonical parameter JSON, hex encoded.
///
/// Parameters live in a `BTreeMap` and nested objects in `serde_json::Map`
/// (sorted), so equal inputs always serialize to equal bytes.
pub fn cache_key(text: &str, parameters: &BTreeMap<String, Value>) -> serde_json::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    hasher.update(&[0]);
    serde_json::to_writer(&mut hasher, parameters)?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn same_inputs_same_key() {
        let a = cache_key("MATCH (n) RETURN n", &params(&[("id", json!("42"))])).unwrap();
        let b = cache_key("MATCH (n) RETURN n", &params(&[("id", json!("42"))])).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = cache_key("q", &params(&[("a", json!(1)), ("b", json!({"y": 1, "x": 2}))])).unwrap();
        let b = cache_key("q", &params(&[("b", json!({"x": 2, "y": 1})), ("a", json!(1))])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn text_and_params_are_separated() {
        // "ab" + {} must not collide with "a" + {"b": ...}-like concatenations.
        let a = cache_key("ab", &BTreeMap::new()).unwrap();
        let b = cache_key("a", &params(&[("b", json!(null))])).unwrap();
        assert_ne!(a, b);
        assert_ne!(
            cache_key("q", &params(&[("id", json!("1"))])).unwrap(),
            cache_key("q", &params(&[("id", json!(1))])).unwrap()
        );
    }
}
