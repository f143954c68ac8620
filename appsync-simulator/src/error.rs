//! Resolver errors.
use displaydoc::Display;
use thiserror::Error;

use crate::graphql::Error;
use crate::graphql::ErrorExtension;
use crate::json_ext::Path;
use crate::loader::LoadError;

/// Error types for configuration.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// no {kind} mapping template configured for {type_name}.{field_name}
    TemplateMissing {
        /// `request` or `response`.
        kind: TemplateKind,
        type_name: String,
        field_name: String,
    },

    /// cannot find resolver for {type_name}: {field_name}
    ResolverNotFound {
        type_name: String,
        field_name: String,
    },

    /// data source '{name}' is not defined
    DataSourceNotFound { name: String },

    /// function '{name}' used by data source '{data_source}' is not defined
    FunctionNotFound { name: String, data_source: String },

    /// no template renderer was provided and none is compiled in
    NoTemplateRenderer,

    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
}

/// Which of the two mapping templates of a resolver.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum TemplateKind {
    /// request
    Request,
    /// response
    Response,
}

/// Error types for mapping templates.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateError {
    /// mapping template {path} does not render valid JSON. {reason}
    InvalidJson { path: String, reason: String },

    /// mapping template {path} failed to render: {reason}
    Render { path: String, reason: String },

    /// could not load mapping template {path}: {reason}
    Load { path: String, reason: String },
}

/// Error types for the invocation envelope.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// unknown version '{version}', only 2017-02-28 is supported
    UnknownProtocolVersion { version: String },

    /// unknown operation '{operation}', expected Invoke or BatchInvoke
    InvalidOperation { operation: String },
}

/// Everything that can fail while resolving one field.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResolverError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The backend function (or the batch it belonged to) failed.
    #[error(transparent)]
    Invocation(#[from] LoadError),
}

impl ResolverError {
    /// Convert the resolver error to a GraphQL field error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut error = Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extension_code(self.extension_code())
            .build();
        if let ResolverError::Template(
            TemplateError::InvalidJson { path, .. }
            | TemplateError::Render { path, .. }
            | TemplateError::Load { path, .. },
        ) = self
        {
            error
                .extensions
                .insert("template", path.clone().into());
        }
        error
    }
}

impl ErrorExtension for ResolverError {
    fn extension_code(&self) -> String {
        match self {
            ResolverError::Configuration(ConfigurationError::TemplateMissing { .. }) => {
                "TEMPLATE_MISSING"
            }
            ResolverError::Configuration(ConfigurationError::ResolverNotFound { .. }) => {
                "RESOLVER_NOT_FOUND"
            }
            ResolverError::Configuration(_) => "INVALID_CONFIGURATION",
            ResolverError::Template(TemplateError::Load { .. }) => "TEMPLATE_LOAD_ERROR",
            ResolverError::Template(_) => "TEMPLATE_RENDER_ERROR",
            ResolverError::Protocol(ProtocolError::UnknownProtocolVersion { .. }) => {
                "UNKNOWN_PROTOCOL_VERSION"
            }
            ResolverError::Protocol(ProtocolError::InvalidOperation { .. }) => "INVALID_OPERATION",
            ResolverError::Invocation(LoadError::ArityMismatch { .. }) => "BATCH_ARITY_MISMATCH",
            ResolverError::Invocation(_) => "FUNCTION_INVOCATION_ERROR",
        }
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn messages() {
        assert_eq!(
            ConfigurationError::ResolverNotFound {
                type_name: "Query".into(),
                field_name: "books".into(),
            }
            .to_string(),
            "cannot find resolver for Query: books"
        );
        assert_eq!(
            TemplateError::InvalidJson {
                path: "mapping-templates/book.response.rhai".into(),
                reason: "expected value at line 1 column 1".into(),
            }
            .to_string(),
            "mapping template mapping-templates/book.response.rhai does not render valid JSON. expected value at line 1 column 1"
        );
        assert_eq!(
            ConfigurationError::TemplateMissing {
                kind: TemplateKind::Request,
                type_name: "Query".into(),
                field_name: "book".into(),
            }
            .to_string(),
            "no request mapping template configured for Query.book"
        );
    }

    #[test]
    fn graphql_errors_carry_a_code() {
        let error = ResolverError::from(ProtocolError::InvalidOperation {
            operation: "Delete".into(),
        })
        .to_graphql_error(Some(Path::from_iter(["book"])));

        assert_eq!(
            serde_json_bytes::to_value(&error).unwrap(),
            json!({
                "message": "unknown operation 'Delete', expected Invoke or BatchInvoke",
                "path": ["book"],
                "extensions": { "code": "INVALID_OPERATION" }
            })
        );
    }

    #[test]
    fn template_errors_name_the_template() {
        let error = ResolverError::from(TemplateError::InvalidJson {
            path: "templates/a.rhai".into(),
            reason: "eof".into(),
        })
        .to_graphql_error(None);

        assert_eq!(error.extension_code().as_deref(), Some("TEMPLATE_RENDER_ERROR"));
        assert_eq!(error.extensions.get("template"), Some(&json!("templates/a.rhai")));
        assert!(error.path.is_none());
    }

    #[test]
    fn invocation_errors() {
        let error = ResolverError::from(LoadError::from(tower::BoxError::from("crashed")));
        assert_eq!(error.to_string(), "crashed");
        assert_eq!(error.extension_code(), "FUNCTION_INVOCATION_ERROR");
    }
}
