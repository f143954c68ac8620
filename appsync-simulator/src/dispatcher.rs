//! Per-request resolver dispatch.
//!
//! Every inbound GraphQL request gets its own [`RequestContext`] with a fresh
//! [`ResolverDispatcher`]: new connectors, new invocation caches and new
//! template slots. Nothing cached while resolving one request is visible to
//! another.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json_bytes::json;
use serde_json_bytes::Value;
use tracing::Span;

use crate::configuration::FunctionConfig;
use crate::configuration::MappingConfig;
use crate::connector::InvocationConnector;
use crate::connector::InvocationTransport;
use crate::error::ConfigurationError;
use crate::error::ResolverError;
use crate::files::FileLoader;
use crate::graphql::ResolveInfo;
use crate::json_ext::Object;
use crate::mapper::TemplateMapper;
use crate::template::TemplateRenderer;

/// A Lambda data source backed by a local function, with the fields it
/// resolves.
#[derive(Clone, Debug)]
pub(crate) struct LambdaResolvers {
    pub(crate) data_source: String,
    pub(crate) function: Arc<FunctionConfig>,
    pub(crate) mappings: Vec<MappingConfig>,
}

/// Maps `(type name, field name)` to the mapper resolving that field.
#[derive(Debug, Default)]
pub struct ResolverDispatcher {
    mappers: HashMap<(String, String), Arc<TemplateMapper>>,
}

impl ResolverDispatcher {
    /// Builds the dispatch table of one request.
    ///
    /// Each data source gets one connector, shared by all of its fields.
    pub(crate) fn for_request(
        sources: &[LambdaResolvers],
        transport: &Arc<dyn InvocationTransport>,
        files: &FileLoader,
        renderer: &Arc<dyn TemplateRenderer>,
        span: &Span,
    ) -> Self {
        let mut dispatcher = Self::default();
        for source in sources {
            tracing::trace!(
                parent: span,
                data_source = %source.data_source,
                fields = source.mappings.len(),
                "connecting data source"
            );
            let connector = Arc::new(
                InvocationConnector::builder()
                    .transport(transport.clone())
                    .function(source.function.clone())
                    .span(span.clone())
                    .build(),
            );
            for mapping in &source.mappings {
                dispatcher.insert(
                    TemplateMapper::builder()
                        .mapping(mapping.clone())
                        .connector(connector.clone())
                        .files(files.clone())
                        .renderer(renderer.clone())
                        .build(),
                );
            }
        }
        dispatcher
    }

    /// Registers `mapper` for the field of its mapping, replacing any previous
    /// mapper for that field.
    pub fn insert(&mut self, mapper: TemplateMapper) {
        let mapping = mapper.mapping();
        let key = (mapping.type_name.clone(), mapping.field_name.clone());
        self.mappers.insert(key, Arc::new(mapper));
    }

    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&Arc<TemplateMapper>> {
        self.mappers
            .get(&(type_name.to_string(), field_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

/// The state of one inbound GraphQL request.
#[derive(Debug)]
pub struct RequestContext {
    headers: http::HeaderMap,
    identity: Value,
    span: Span,
    resolvers: ResolverDispatcher,
}

#[buildstructor::buildstructor]
impl RequestContext {
    /// Returns a builder for a request context.
    ///
    /// * `.headers(http::HeaderMap)` Optional, the inbound request headers.
    /// * `.identity(Value)` Optional, defaults to `{"username": "default"}`.
    /// * `.span(Span)` Optional, defaults to the current span.
    /// * `.resolvers(ResolverDispatcher)` Optional, defaults to an empty table.
    #[builder(visibility = "pub")]
    fn new(
        headers: Option<http::HeaderMap>,
        identity: Option<Value>,
        span: Option<Span>,
        resolvers: Option<ResolverDispatcher>,
    ) -> Self {
        Self {
            headers: headers.unwrap_or_default(),
            identity: identity.unwrap_or_else(|| json!({ "username": "default" })),
            span: span.unwrap_or_else(Span::current),
            resolvers: resolvers.unwrap_or_default(),
        }
    }

    pub fn headers(&self) -> &http::HeaderMap {
        &self.headers
    }

    pub fn identity(&self) -> &Value {
        &self.identity
    }

    /// The request span, handed to the transport as its logger.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn resolvers(&self) -> &ResolverDispatcher {
        &self.resolvers
    }

    /// Resolves a field with this request's dispatch table.
    pub async fn resolve_field(
        &self,
        parent: &Value,
        arguments: &Object,
        info: &ResolveInfo,
    ) -> Result<Value, ResolverError> {
        resolve_field(parent, arguments, self, info).await
    }
}

/// The generic field resolver installed on every mapped field.
///
/// Looks the field up in the request's dispatch table and lets its mapper
/// resolve it.
pub async fn resolve_field(
    parent: &Value,
    arguments: &Object,
    context: &RequestContext,
    info: &ResolveInfo,
) -> Result<Value, ResolverError> {
    let mapper = context
        .resolvers
        .get(&info.parent_type, &info.field_name)
        .ok_or_else(|| ConfigurationError::ResolverNotFound {
            type_name: info.parent_type.clone(),
            field_name: info.field_name.clone(),
        })?;
    mapper.resolve(parent, arguments, context, info).await
}
