//! JSON helpers shared by the mapper, the loaders and the GraphQL error types.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
pub use serde_json_bytes::Value;

/// A JSON object.
pub type Object = Map<ByteString, Value>;

/// A path into the result document of a GraphQL response.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

/// One segment of a [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index in a list.
    Index(usize),
    /// A field name.
    Key(String),
}

impl Path {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Returns a new path with `key` appended.
    pub fn join(&self, key: impl Into<String>) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement::Key(key.into()));
        Self(elements)
    }

    /// Returns a new path with `index` appended.
    pub fn index(&self, index: usize) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement::Index(index));
        Self(elements)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.0 {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

impl<'a> FromIterator<&'a str> for Path {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|key| match key.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(key.to_string()),
                })
                .collect(),
        )
    }
}

/// Converts an HTTP header map into the JSON object mapping templates see
/// under `context.request.headers`.
///
/// Header names are lowercase. Values that are not valid UTF-8 are skipped,
/// repeated headers keep their last value.
pub(crate) fn headers_to_object(headers: &http::HeaderMap) -> Object {
    let mut object = Object::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            object.insert(
                ByteString::from(name.as_str()),
                Value::String(ByteString::from(value)),
            );
        }
    }
    object
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn path_display() {
        let path: Path = ["book", "authors", "1", "name"].into_iter().collect();
        assert_eq!(path.to_string(), "/book/authors/1/name");
        assert_eq!(
            serde_json_bytes::to_value(&path).unwrap(),
            json!(["book", "authors", 1, "name"])
        );
    }

    #[test]
    fn paths_are_built_one_element_at_a_time() {
        let path = Path::empty().join("books").index(2).join("author");
        assert_eq!(
            path,
            Path(vec![
                PathElement::Key("books".to_string()),
                PathElement::Index(2),
                PathElement::Key("author".to_string()),
            ])
        );
        assert_eq!(path.to_string(), "/books/2/author");
    }

    #[test]
    fn headers_become_an_object() {
        let mut headers = http::HeaderMap::new();
        headers.insert("Authorization", "Bearer abc".parse().unwrap());
        headers.insert("x-api-key", "key".parse().unwrap());

        assert_eq!(
            Value::Object(headers_to_object(&headers)),
            json!({ "authorization": "Bearer abc", "x-api-key": "key" })
        );
    }
}
