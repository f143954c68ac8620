//! Startup wiring.
//!
//! The simulator is built once from the configuration. It owns everything that
//! lives for the whole process: resolved data sources and mappings, the
//! template file cache and its watchers. Each inbound request then gets its own
//! [`RequestContext`] from [`AppSyncSimulator::request_context`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json_bytes::Value;
use tokio::task::JoinHandle;

use crate::configuration::Capabilities;
use crate::configuration::Configuration;
use crate::configuration::DataSourceKind;
use crate::configuration::MappingConfig;
use crate::connector::InvocationTransport;
use crate::dispatcher::LambdaResolvers;
use crate::dispatcher::RequestContext;
use crate::dispatcher::ResolverDispatcher;
use crate::error::ConfigurationError;
use crate::files::FileLoader;
use crate::template::TemplateRenderer;

/// The fields to install the generic resolver on, by type name.
pub type ResolverMap = BTreeMap<String, BTreeSet<String>>;

/// A configured simulator, ready to serve requests.
pub struct AppSyncSimulator {
    capabilities: Capabilities,
    sources: Vec<LambdaResolvers>,
    mappings: Vec<MappingConfig>,
    identity: Value,
    transport: Arc<dyn InvocationTransport>,
    renderer: Arc<dyn TemplateRenderer>,
    files: FileLoader,
    watchers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for AppSyncSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSyncSimulator")
            .field("capabilities", &self.capabilities)
            .field("sources", &self.sources)
            .field("files", &self.files)
            .field("watchers", &self.watchers.len())
            .finish_non_exhaustive()
    }
}

#[buildstructor::buildstructor]
impl AppSyncSimulator {
    /// Returns a builder for the simulator.
    ///
    /// * `.configuration(Configuration)` Required.
    /// * `.transport(Arc<dyn InvocationTransport>)` Required, runs the functions.
    /// * `.renderer(Arc<dyn TemplateRenderer>)` Optional, defaults to the Rhai
    ///   renderer when it is compiled in.
    ///
    /// Template watchers are spawned on the current Tokio runtime when the
    /// configuration enables them.
    #[builder(visibility = "pub")]
    fn new(
        configuration: Configuration,
        transport: Arc<dyn InvocationTransport>,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Result<Self, ConfigurationError> {
        let capabilities = Capabilities::detect();
        let renderer = match renderer {
            Some(renderer) => renderer,
            None => default_renderer(capabilities)?,
        };

        let identity = configuration.identity();
        if !identity.is_object() {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "default_identity must be a map",
                error: identity.to_string(),
            });
        }

        let mappings = configuration.mappings();
        for mapping in &mappings {
            if !configuration
                .data_sources
                .contains_key(&mapping.data_source_name)
            {
                return Err(ConfigurationError::DataSourceNotFound {
                    name: mapping.data_source_name.clone(),
                });
            }
        }

        let mut sources = Vec::new();
        for (name, data_source) in &configuration.data_sources {
            let DataSourceKind::AwsLambda { .. } = data_source.kind else {
                tracing::debug!(
                    data_source = %name,
                    region = data_source.kind.region(&configuration.service),
                    "only Lambda data sources are simulated"
                );
                continue;
            };
            let Some(function_name) = data_source.kind.local_function() else {
                tracing::warn!(
                    data_source = %name,
                    "Lambda data source has no local function name, its fields will not resolve"
                );
                continue;
            };
            let function = configuration.function_config(function_name).ok_or_else(|| {
                ConfigurationError::FunctionNotFound {
                    name: function_name.to_string(),
                    data_source: name.clone(),
                }
            })?;
            sources.push(LambdaResolvers {
                data_source: name.clone(),
                function: Arc::new(function),
                mappings: mappings
                    .iter()
                    .filter(|mapping| &mapping.data_source_name == name)
                    .cloned()
                    .collect(),
            });
        }

        let files = FileLoader::new();
        let mut watchers = Vec::new();
        if configuration.watch_templates {
            let paths: HashSet<_> = mappings
                .iter()
                .flat_map(MappingConfig::template_paths)
                .collect();
            for path in paths {
                match files.watch(path) {
                    Ok(watcher) => watchers.push(watcher),
                    Err(error) => tracing::warn!(
                        path = %path.display(),
                        %error,
                        "cannot watch mapping template"
                    ),
                }
            }
        }

        tracing::info!(
            data_sources = sources.len(),
            fields = mappings.len(),
            watched = watchers.len(),
            "AppSync simulator ready"
        );

        Ok(Self {
            capabilities,
            sources,
            identity,
            mappings,
            transport,
            renderer,
            files,
            watchers,
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The process-wide template file cache.
    pub fn files(&self) -> &FileLoader {
        &self.files
    }

    /// Every mapped field by type name, for building the executable schema.
    pub fn resolvers(&self) -> ResolverMap {
        let mut resolvers = ResolverMap::new();
        for mapping in &self.mappings {
            resolvers
                .entry(mapping.type_name.clone())
                .or_default()
                .insert(mapping.field_name.clone());
        }
        resolvers
    }

    /// Builds the context of one inbound request.
    ///
    /// The context owns new connectors for every data source, so nothing is
    /// cached across requests.
    pub fn request_context<B>(&self, request: &http::Request<B>) -> RequestContext {
        let span = tracing::info_span!(
            "graphql_request",
            http.method = %request.method(),
            http.target = %request.uri().path()
        );
        let resolvers = ResolverDispatcher::for_request(
            &self.sources,
            &self.transport,
            &self.files,
            &self.renderer,
            &span,
        );
        RequestContext::builder()
            .headers(request.headers().clone())
            .identity(self.identity.clone())
            .span(span)
            .resolvers(resolvers)
            .build()
    }
}

impl Drop for AppSyncSimulator {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

#[cfg(feature = "rhai")]
fn default_renderer(
    capabilities: Capabilities,
) -> Result<Arc<dyn TemplateRenderer>, ConfigurationError> {
    if capabilities.rhai_templates {
        Ok(Arc::new(crate::template::RhaiRenderer::new()))
    } else {
        Err(ConfigurationError::NoTemplateRenderer)
    }
}

#[cfg(not(feature = "rhai"))]
fn default_renderer(
    _capabilities: Capabilities,
) -> Result<Arc<dyn TemplateRenderer>, ConfigurationError> {
    Err(ConfigurationError::NoTemplateRenderer)
}
