//! The GraphQL-side types the resolver core exchanges with the host executor.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use crate::json_ext::Object;
use crate::json_ext::Path;

/// A [GraphQL error](https://spec.graphql.org/October2021/#sec-Errors)
/// reported for a single field.
///
/// Converted to (or from) JSON with serde.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct Error {
    /// The error message.
    pub message: String,

    /// The JSON path to the field that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,

    /// The optional GraphQL extensions for this error.
    #[serde(skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Error {
    /// Returns a builder that builds a GraphQL [`Error`] from its components.
    ///
    /// Builder methods:
    ///
    /// * `.message(impl Into<`[`String`]`>)`
    ///   Required.
    ///
    /// * `.path(impl Into<`[`Path`]`>)`
    ///   Optional.
    ///
    /// * `.extension(impl Into<`[`ByteString`]`>, impl Into<`[`Value`]`>)`
    ///   Optional, may be called multiple times.
    ///
    /// * `.extension_code(impl Into<`[`String`]`>)`
    ///   Optional.
    ///   Sets the "code" in the extension map. Will be ignored if extension already has this key
    ///   set.
    #[builder(visibility = "pub")]
    fn new(
        message: String,
        path: Option<Path>,
        extension_code: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor's map special-casing
        mut extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        if let Some(code) = extension_code {
            extensions
                .entry("code")
                .or_insert(Value::String(ByteString::from(code)));
        }
        Self {
            message,
            path,
            extensions,
        }
    }

    /// Extract the error code from [`Error::extensions`] as a String if it is set.
    pub fn extension_code(&self) -> Option<String> {
        self.extensions.get("code").and_then(|c| match c {
            Value::String(s) => Some(s.as_str().to_owned()),
            Value::Number(n) => Some(n.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) | Value::Bool(_) => None,
        })
    }
}

/// Displays (only) the error message.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

/// Trait used to get extension type from an error
pub(crate) trait ErrorExtension {
    fn extension_code(&self) -> String;
}

/// What the executor knows about the field being resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveInfo {
    /// The name of the object type the field belongs to.
    pub parent_type: String,
    pub field_name: String,
    /// Where the field sits in the response.
    pub path: Path,
}

impl ResolveInfo {
    pub fn new(parent_type: impl Into<String>, field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            parent_type: parent_type.into(),
            path: Path::empty().join(field_name.clone()),
            field_name,
        }
    }

    /// Sets the response path of the field.
    pub fn with_path(mut self, path: Path) -> Self {
        self.path = path;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn builder_sets_the_code_once() {
        let error = Error::builder()
            .message("boom")
            .extension("code", "FIRST")
            .extension_code("SECOND")
            .build();
        assert_eq!(error.extension_code().as_deref(), Some("FIRST"));
    }

    #[test]
    fn serializes_like_a_response_error() {
        let error = Error::builder()
            .message("cannot find resolver for Query: books")
            .path(Path::from_iter(["books", "0", "title"]))
            .extension_code("RESOLVER_NOT_FOUND")
            .build();

        assert_eq!(
            serde_json_bytes::to_value(&error).unwrap(),
            json!({
                "message": "cannot find resolver for Query: books",
                "path": ["books", 0, "title"],
                "extensions": { "code": "RESOLVER_NOT_FOUND" }
            })
        );
    }

    #[test]
    fn resolve_info_defaults_its_path_to_the_field() {
        let info = ResolveInfo::new("Query", "book");
        assert_eq!(info.path.to_string(), "/book");

        let nested = ResolveInfo::new("Book", "author")
            .with_path(Path::empty().join("books").index(0).join("author"));
        assert_eq!(nested.path.to_string(), "/books/0/author");
        assert_eq!(nested.field_name, "author");
    }
}
