//! Mapping template rendering.
//!
//! The simulator does not care which template language is in use: a
//! [`TemplateRenderer`] turns template text and a [`TemplateContext`] into
//! text that must then parse as JSON.

use serde::Serialize;
use serde_json_bytes::Value;
use tower::BoxError;

use crate::json_ext::headers_to_object;
use crate::json_ext::Object;

#[cfg(feature = "rhai")]
mod rhai;
pub mod util;

#[cfg(feature = "rhai")]
pub use self::rhai::RhaiRenderer;
pub use self::util::TemplateUtil;

/// Renders mapping templates.
pub trait TemplateRenderer: Send + Sync + 'static {
    /// Renders `template` against `context`.
    fn render(&self, template: &str, context: &TemplateContext) -> Result<String, BoxError>;
}

impl<F> TemplateRenderer for F
where
    F: Fn(&str, &TemplateContext) -> Result<String, BoxError> + Send + Sync + 'static,
{
    fn render(&self, template: &str, context: &TemplateContext) -> Result<String, BoxError> {
        self(template, context)
    }
}

/// Everything a mapping template can see.
///
/// Serializes as `{"context": {...}}`; the helper functions are exposed by
/// the renderer under `util` and `utils`.
#[derive(Clone, Debug, Serialize)]
pub struct TemplateContext {
    pub context: ContextValues,
    #[serde(skip)]
    pub util: TemplateUtil,
}

/// The `context` object of a mapping template.
#[derive(Clone, Debug, Serialize)]
pub struct ContextValues {
    pub arguments: Object,
    pub source: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub identity: Value,
    pub request: RequestValues,
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestValues {
    pub headers: Object,
}

impl TemplateContext {
    /// Context for a request mapping template.
    pub fn from_request(
        source: &Value,
        arguments: &Object,
        identity: &Value,
        headers: &http::HeaderMap,
    ) -> Self {
        Self {
            context: ContextValues {
                arguments: arguments.clone(),
                source: source.clone(),
                result: None,
                identity: identity.clone(),
                request: RequestValues {
                    headers: headers_to_object(headers),
                },
            },
            util: TemplateUtil,
        }
    }

    /// Context for a response mapping template: the request context plus the
    /// function result.
    pub fn from_result(
        result: &Value,
        source: &Value,
        arguments: &Object,
        identity: &Value,
        headers: &http::HeaderMap,
    ) -> Self {
        let mut context = Self::from_request(source, arguments, identity, headers);
        context.context.result = Some(result.clone());
        context
    }

    /// The context as a JSON value, for renderers working on plain data.
    pub fn to_value(&self) -> Value {
        serde_json_bytes::to_value(self).unwrap_or_default()
    }

    /// Looks up a dotted path such as `context.arguments.id`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut current = self.to_value();
        for segment in path.split('.') {
            current = match current {
                Value::Object(mut object) => object.remove(segment)?,
                Value::Array(mut values) => {
                    let index = segment.parse::<usize>().ok()?;
                    if index >= values.len() {
                        return None;
                    }
                    values.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }
}
