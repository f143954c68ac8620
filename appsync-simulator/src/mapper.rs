//! Request/response mapping around a Lambda invocation.
//!
//! A [`TemplateMapper`] resolves one GraphQL field: it renders the request
//! template into an [`InvocationEnvelope`], invokes the function through the
//! request's [`InvocationConnector`] and renders the response template with
//! the function result.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json_bytes::Value;

use crate::configuration::MappingConfig;
use crate::connector::InvocationConnector;
use crate::dispatcher::RequestContext;
use crate::error::ConfigurationError;
use crate::error::ProtocolError;
use crate::error::ResolverError;
use crate::error::TemplateError;
use crate::error::TemplateKind;
use crate::files::FileLoader;
use crate::graphql::ResolveInfo;
use crate::json_ext::Object;
use crate::loader::Load;
use crate::loader::LoadError;
use crate::template::TemplateContext;
use crate::template::TemplateRenderer;

/// The only envelope version functions understand.
pub const PROTOCOL_VERSION: &str = "2017-02-28";

/// What a request template asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// One function call per distinct payload.
    Invoke,
    /// The payload joins the current batch for the function.
    BatchInvoke,
}

/// The rendered output of a request mapping template.
///
/// Kept as raw JSON until it is checked, so a template producing a wrong
/// version or operation is reported as such rather than as unparseable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationEnvelope {
    pub version: Value,
    pub operation: Value,
    pub payload: Value,
}

impl InvocationEnvelope {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut object) => Self {
                version: object.remove("version").unwrap_or_default(),
                operation: object.remove("operation").unwrap_or_default(),
                payload: object.remove("payload").unwrap_or_default(),
            },
            _ => Self::default(),
        }
    }

    /// Checks the version first, then the operation.
    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        if self.version.as_str() != Some(PROTOCOL_VERSION) {
            return Err(ProtocolError::UnknownProtocolVersion {
                version: display(&self.version),
            });
        }
        match self.operation.as_str() {
            Some("Invoke") => Ok(Operation::Invoke),
            Some("BatchInvoke") => Ok(Operation::BatchInvoke),
            _ => Err(ProtocolError::InvalidOperation {
                operation: display(&self.operation),
            }),
        }
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.as_str().to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// A template file, loaded on first use.
enum TemplateSlot {
    Unloaded,
    Loading(Load<Arc<str>>),
    Loaded(Arc<str>),
    Invalid(LoadError),
}

/// Resolves one GraphQL field through a Lambda function.
///
/// Mappers are built per request, together with the connector they share with
/// the other fields of the same data source.
pub struct TemplateMapper {
    mapping: MappingConfig,
    connector: Arc<InvocationConnector>,
    files: FileLoader,
    renderer: Arc<dyn TemplateRenderer>,
    request: Mutex<TemplateSlot>,
    response: Mutex<TemplateSlot>,
}

impl fmt::Debug for TemplateMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateMapper")
            .field("mapping", &self.mapping)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

#[buildstructor::buildstructor]
impl TemplateMapper {
    #[builder(visibility = "pub")]
    fn new(
        mapping: MappingConfig,
        connector: Arc<InvocationConnector>,
        files: FileLoader,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            mapping,
            connector,
            files,
            renderer,
            request: Mutex::new(TemplateSlot::Unloaded),
            response: Mutex::new(TemplateSlot::Unloaded),
        }
    }

    pub fn mapping(&self) -> &MappingConfig {
        &self.mapping
    }

    /// Renders the request template into an invocation envelope.
    pub async fn render_request(
        &self,
        parent: &Value,
        arguments: &Object,
        identity: &Value,
        headers: &http::HeaderMap,
    ) -> Result<InvocationEnvelope, ResolverError> {
        let context = TemplateContext::from_request(parent, arguments, identity, headers);
        let output = self.render(TemplateKind::Request, &context).await?;
        Ok(InvocationEnvelope::from_value(output))
    }

    /// Renders the response template with the function `result`.
    pub async fn render_response(
        &self,
        result: &Value,
        parent: &Value,
        arguments: &Object,
        identity: &Value,
        headers: &http::HeaderMap,
    ) -> Result<Value, ResolverError> {
        let context = TemplateContext::from_result(result, parent, arguments, identity, headers);
        self.render(TemplateKind::Response, &context).await
    }

    /// Resolves the field: request template, invocation, response template.
    pub async fn resolve(
        &self,
        parent: &Value,
        arguments: &Object,
        context: &RequestContext,
        info: &ResolveInfo,
    ) -> Result<Value, ResolverError> {
        let headers = context.headers();
        let identity = context.identity();

        let envelope = self
            .render_request(parent, arguments, identity, headers)
            .await?;
        let operation = envelope.operation()?;
        tracing::debug!(
            parent: context.span(),
            type_name = %info.parent_type,
            field_name = %info.field_name,
            function = %self.connector.function().key,
            ?operation,
            "invoking function for field"
        );

        let result = match operation {
            Operation::Invoke => self.connector.invoke(envelope.payload),
            Operation::BatchInvoke => self.connector.invoke_batch(envelope.payload),
        }
        .await?;

        self.render_response(&result, parent, arguments, identity, headers)
            .await
    }

    async fn render(
        &self,
        kind: TemplateKind,
        context: &TemplateContext,
    ) -> Result<Value, ResolverError> {
        let (path, template) = self.template(kind).await?;
        let path = path.display().to_string();

        let output = self
            .renderer
            .render(&template, context)
            .map_err(|e| TemplateError::Render {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        serde_json::from_str(&output).map_err(|e| {
            TemplateError::InvalidJson {
                path,
                reason: e.to_string(),
            }
            .into()
        })
    }

    async fn template(&self, kind: TemplateKind) -> Result<(&Path, Arc<str>), ResolverError> {
        let (path, slot) = match kind {
            TemplateKind::Request => (&self.mapping.request_template, &self.request),
            TemplateKind::Response => (&self.mapping.response_template, &self.response),
        };
        let path: &Path = path
            .as_deref()
            .ok_or_else(|| ConfigurationError::TemplateMissing {
                kind,
                type_name: self.mapping.type_name.clone(),
                field_name: self.mapping.field_name.clone(),
            })?;
        let load_error = |error: &LoadError| TemplateError::Load {
            path: path.display().to_string(),
            reason: error.to_string(),
        };

        let load = {
            let mut slot = slot.lock();
            let pending = match &*slot {
                TemplateSlot::Loaded(text) => return Ok((path, text.clone())),
                TemplateSlot::Invalid(error) => return Err(load_error(error).into()),
                TemplateSlot::Loading(load) => Some(load.clone()),
                TemplateSlot::Unloaded => None,
            };
            match pending {
                Some(load) => load,
                None => {
                    let load = self.files.load(path.to_path_buf());
                    *slot = TemplateSlot::Loading(load.clone());
                    load
                }
            }
        };

        let loaded = load.await;
        let mut slot = slot.lock();
        match loaded {
            Ok(text) => {
                *slot = TemplateSlot::Loaded(text.clone());
                Ok((path, text))
            }
            Err(error) => {
                let template_error = load_error(&error);
                *slot = TemplateSlot::Invalid(error);
                Err(template_error.into())
            }
        }
    }
}
