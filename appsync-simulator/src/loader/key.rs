//! Canonical cache keys.
//!
//! Two invocation keys built by different template renders may carry the same
//! properties in a different insertion order. They must land in the same
//! cache slot, so object keys are sorted before the key is serialized.

use std::fmt;
use std::path::PathBuf;

use itertools::Itertools;
use serde_json_bytes::Value;

use crate::json_ext::Object;

/// The identity of a key inside a [`BatchCache`](super::BatchCache).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keys that can be loaded through a [`BatchCache`](super::BatchCache).
pub trait CacheKey: Clone + Send + Sync + 'static {
    fn canonical_key(&self) -> CanonicalKey;
}

impl CacheKey for Value {
    /// Scalars keep their own JSON text. Objects are rebuilt with their
    /// properties sorted by code point, at every depth, then written as
    /// compact JSON.
    fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey(sorted(self).to_string())
    }
}

impl CacheKey for PathBuf {
    /// Built from the path components, so spellings that compare equal as
    /// paths (`dir/./file`, `dir//file`, `dir/file`) share a key.
    fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey(self.components().collect::<PathBuf>().display().to_string())
    }
}

impl CacheKey for String {
    fn canonical_key(&self) -> CanonicalKey {
        CanonicalKey(self.clone())
    }
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut ordered = Object::new();
            for (key, value) in object
                .iter()
                .sorted_by(|a, b| a.0.as_str().cmp(b.0.as_str()))
            {
                ordered.insert(key.clone(), sorted(value));
            }
            Value::Object(ordered)
        }
        Value::Array(values) => Value::Array(values.iter().map(sorted).collect()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn property_order_does_not_matter() {
        let a = json!({ "id": "42", "name": "Alice", "age": 7 });
        let b = json!({ "name": "Alice", "age": 7, "id": "42" });
        let c = json!({ "age": 7, "id": "42", "name": "Alice" });

        assert_eq!(a.canonical_key(), b.canonical_key());
        assert_eq!(b.canonical_key(), c.canonical_key());
        assert_eq!(
            a.canonical_key().as_str(),
            r#"{"age":7,"id":"42","name":"Alice"}"#
        );
    }

    #[test]
    fn nested_objects_are_sorted() {
        let a = json!({ "filter": { "b": 1, "a": 2 }, "ids": [{ "y": 1, "x": 2 }] });
        let b = json!({ "ids": [{ "x": 2, "y": 1 }], "filter": { "a": 2, "b": 1 } });

        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn sorting_uses_code_points() {
        let key = json!({ "b": 1, "B": 2, "a": 3, "_": 4 });
        assert_eq!(key.canonical_key().as_str(), r#"{"B":2,"_":4,"a":3,"b":1}"#);
    }

    #[test]
    fn different_values_stay_distinct() {
        assert_ne!(
            json!({ "id": "1" }).canonical_key(),
            json!({ "id": "2" }).canonical_key()
        );
        // a string and a number with the same text are different keys
        assert_ne!(json!("1").canonical_key(), json!(1).canonical_key());
        // list order is significant
        assert_ne!(json!([1, 2]).canonical_key(), json!([2, 1]).canonical_key());
    }

    #[test]
    fn scalars_keep_their_value() {
        assert_eq!(json!("book-1").canonical_key().as_str(), r#""book-1""#);
        assert_eq!(json!(12).canonical_key().as_str(), "12");
        assert_eq!(Value::Null.canonical_key().as_str(), "null");
    }

    #[test]
    fn equal_paths_share_a_key() {
        let plain = PathBuf::from("service/mapping-templates/book.rhai");
        for spelling in [
            "service/./mapping-templates/book.rhai",
            "service//mapping-templates/book.rhai",
            "service/mapping-templates/./book.rhai",
        ] {
            let spelling = PathBuf::from(spelling);
            assert_eq!(spelling, plain);
            assert_eq!(spelling.canonical_key(), plain.canonical_key());
        }
        assert_ne!(
            PathBuf::from("service/other/book.rhai").canonical_key(),
            plain.canonical_key()
        );
    }

    #[test]
    fn paths_use_their_text() {
        let path = PathBuf::from("mapping-templates/book-request.rhai");
        assert_eq!(
            path.canonical_key().as_str(),
            "mapping-templates/book-request.rhai"
        );
    }
}
