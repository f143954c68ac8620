//! Simulator configuration.
//!
//! Deserialized from YAML. Describes the service the functions belong to, the
//! functions themselves, the data sources and the mapping templates binding
//! GraphQL fields to data sources.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The configuration for the simulator.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Service-wide settings and function defaults.
    #[serde(default)]
    pub service: Service,

    /// Functions by name.
    #[serde(default)]
    pub functions: BTreeMap<String, Function>,

    /// The GraphQL schema file, relative to the service path.
    /// default: "schema.graphql"
    #[serde(default = "default_schema")]
    pub schema: PathBuf,

    /// Where mapping template files live, relative to the service path.
    /// default: "mapping-templates"
    #[serde(default = "default_mapping_templates_location")]
    pub mapping_templates_location: PathBuf,

    /// Data sources by name.
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSource>,

    /// One entry per resolved GraphQL field.
    #[serde(default)]
    pub mapping_templates: Vec<MappingTemplate>,

    /// The identity mapping templates see as `context.identity`.
    /// default: { "username": "default" }
    #[serde(default = "default_identity")]
    pub default_identity: serde_json::Value,

    /// Clear cached template files when they change on disk.
    /// enabled by default
    #[serde(default = "default_watch_templates")]
    pub watch_templates: bool,
}

fn default_schema() -> PathBuf {
    PathBuf::from("schema.graphql")
}

fn default_mapping_templates_location() -> PathBuf {
    PathBuf::from("mapping-templates")
}

fn default_identity() -> serde_json::Value {
    serde_json::json!({ "username": "default" })
}

fn default_watch_templates() -> bool {
    true
}

/// Parse configuration from a string in YAML syntax
impl FromStr for Configuration {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            service: Service::default(),
            functions: BTreeMap::new(),
            schema: default_schema(),
            mapping_templates_location: default_mapping_templates_location(),
            data_sources: BTreeMap::new(),
            mapping_templates: Vec::new(),
            default_identity: default_identity(),
            watch_templates: default_watch_templates(),
        }
    }
}

impl Configuration {
    /// The resolved configuration of the function called `name`, merged with
    /// the service defaults.
    pub fn function_config(&self, name: &str) -> Option<FunctionConfig> {
        let function = self.functions.get(name)?;
        let service = &self.service;

        let mut environment = service.environment.clone();
        environment.extend(function.environment.clone());

        Some(
            FunctionConfig::builder()
                .service_name(service.name.clone())
                .service_path(service.path.clone())
                .and_dist(service.dist.clone())
                .and_project_name(service.project_name.clone())
                .region(service.region.clone())
                .stage(service.stage.clone())
                .function_name(name)
                .handler(function.handler.clone())
                .and_memory_size(function.memory_size.or(service.memory_size))
                .and_timeout(function.timeout.or(service.timeout))
                .and_runtime(function.runtime.clone().or_else(|| service.runtime.clone()))
                .and_environment(Some(environment))
                .build(),
        )
    }

    /// Every mapping template entry with its template paths resolved.
    pub fn mappings(&self) -> Vec<MappingConfig> {
        let location = self.service.path.join(&self.mapping_templates_location);
        self.mapping_templates
            .iter()
            .map(|template| MappingConfig {
                data_source_name: template.data_source.clone(),
                type_name: template.type_name.clone(),
                field_name: template.field.clone(),
                request_template: template.request.as_ref().map(|file| location.join(file)),
                response_template: template.response.as_ref().map(|file| location.join(file)),
            })
            .collect()
    }

    /// The GraphQL schema file.
    pub fn schema_path(&self) -> PathBuf {
        self.service.path.join(&self.schema)
    }

    /// The identity used for requests that do not carry one.
    pub fn identity(&self) -> crate::json_ext::Value {
        crate::json_ext::Value::from(self.default_identity.clone())
    }
}

/// Generate the JSON schema for the configuration.
pub fn generate_config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Configuration)
}

/// Service-wide settings.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Service {
    /// default: "service"
    #[serde(default = "default_service_name")]
    pub name: String,

    /// default: "dev"
    #[serde(default = "default_stage")]
    pub stage: String,

    /// default: "us-east-1"
    #[serde(default = "default_region")]
    pub region: String,

    /// Default runtime for functions that do not set one.
    #[serde(default)]
    pub runtime: Option<String>,

    /// Default memory size in MB for functions that do not set one.
    #[serde(default)]
    pub memory_size: Option<u32>,

    /// Default timeout in seconds for functions that do not set one.
    #[serde(default)]
    pub timeout: Option<u32>,

    /// Environment shared by every function. Function environments take
    /// precedence.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// The service directory.
    /// default: "."
    #[serde(default = "default_service_path")]
    pub path: PathBuf,

    /// Sub-directory holding the built handlers.
    #[serde(default)]
    pub dist: Option<String>,

    /// Project name of the local container setup.
    #[serde(default)]
    pub project_name: Option<String>,
}

fn default_service_name() -> String {
    "service".to_string()
}

fn default_stage() -> String {
    "dev".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_service_path() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Service {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            stage: default_stage(),
            region: default_region(),
            runtime: None,
            memory_size: None,
            timeout: None,
            environment: BTreeMap::new(),
            path: default_service_path(),
            dist: None,
            project_name: None,
        }
    }
}

/// A function definition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Function {
    /// The handler, e.g. `handler.getBook`.
    pub handler: String,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub memory_size: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// A data source fields are resolved against.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct DataSource {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub service_role_arn: Option<String>,

    #[serde(flatten)]
    pub kind: DataSourceKind,
}

/// The supported data source types, with their type-specific configuration
/// under `config`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", content = "config")]
pub enum DataSourceKind {
    /// A Lambda function. Only functions with a local `lambda_function_name`
    /// are simulated.
    #[serde(rename = "AWS_LAMBDA")]
    AwsLambda {
        #[serde(default)]
        lambda_function_arn: Option<String>,
        #[serde(default)]
        lambda_function_name: Option<String>,
    },

    #[serde(rename = "AMAZON_DYNAMODB")]
    AmazonDynamoDb {
        /// Defaults to the service region.
        #[serde(default)]
        region: Option<String>,
        table_name: String,
        #[serde(default)]
        use_caller_credentials: bool,
    },

    #[serde(rename = "AMAZON_ELASTICSEARCH")]
    AmazonElasticsearch {
        /// Defaults to the service region.
        #[serde(default)]
        region: Option<String>,
        endpoint: String,
    },

    #[serde(rename = "NONE")]
    None,
}

impl DataSourceKind {
    /// The name of the local function backing a Lambda data source.
    pub fn local_function(&self) -> Option<&str> {
        match self {
            DataSourceKind::AwsLambda {
                lambda_function_name,
                ..
            } => lambda_function_name.as_deref(),
            _ => None,
        }
    }

    /// The AWS region of a DynamoDB or Elasticsearch data source, falling back
    /// to the service region when it sets none.
    pub fn region<'a>(&'a self, service: &'a Service) -> Option<&'a str> {
        match self {
            DataSourceKind::AmazonDynamoDb { region, .. }
            | DataSourceKind::AmazonElasticsearch { region, .. } => {
                Some(region.as_deref().unwrap_or(&service.region))
            }
            _ => None,
        }
    }
}

/// Binds one GraphQL field to a data source through a pair of templates.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MappingTemplate {
    pub data_source: String,
    /// The GraphQL type name, e.g. `Query`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// The GraphQL field name, e.g. `books`.
    pub field: String,
    /// The request template file name, relative to the templates location.
    #[serde(default)]
    pub request: Option<String>,
    /// The response template file name, relative to the templates location.
    #[serde(default)]
    pub response: Option<String>,
}

/// A resolved mapping template entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingConfig {
    pub data_source_name: String,
    pub type_name: String,
    pub field_name: String,
    pub request_template: Option<PathBuf>,
    pub response_template: Option<PathBuf>,
}

impl MappingConfig {
    /// Both template paths, when configured.
    pub fn template_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.request_template
            .iter()
            .chain(self.response_template.iter())
    }
}

/// Everything the invocation transport needs to know about a function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionConfig {
    /// `<service>-<stage>-<function>`
    pub key: String,
    pub service_name: String,
    pub service_path: PathBuf,
    /// `/<dist>` or empty.
    pub dist_path: String,
    /// Lowercase alphanumerics only.
    pub project_name: Option<String>,
    pub region: String,
    pub stage: String,
    pub function_name: String,
    pub handler: String,
    pub memory_size: Option<u32>,
    pub timeout: Option<u32>,
    pub runtime: Option<String>,
    pub environment: BTreeMap<String, String>,
}

#[buildstructor::buildstructor]
impl FunctionConfig {
    #[builder(visibility = "pub")]
    #[allow(clippy::too_many_arguments)] // Used through a builder, not directly
    fn new(
        function_name: String,
        service_name: Option<String>,
        service_path: Option<PathBuf>,
        dist: Option<String>,
        project_name: Option<String>,
        region: Option<String>,
        stage: Option<String>,
        handler: Option<String>,
        memory_size: Option<u32>,
        timeout: Option<u32>,
        runtime: Option<String>,
        environment: Option<BTreeMap<String, String>>,
    ) -> Self {
        let service_name = service_name.unwrap_or_else(default_service_name);
        let stage = stage.unwrap_or_else(default_stage);
        Self {
            key: format!("{service_name}-{stage}-{function_name}"),
            service_name,
            service_path: service_path.unwrap_or_else(default_service_path),
            dist_path: dist.map(|dist| format!("/{dist}")).unwrap_or_default(),
            project_name: project_name.as_deref().map(normalize_project_name),
            region: region.unwrap_or_else(default_region),
            stage,
            handler: handler.unwrap_or_default(),
            function_name,
            memory_size,
            timeout,
            runtime,
            environment: environment.unwrap_or_default(),
        }
    }
}

fn normalize_project_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// What this build of the simulator can do, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Mapping templates can be rendered with the built-in Rhai renderer.
    pub rhai_templates: bool,
}

impl Capabilities {
    pub fn detect() -> Self {
        Self {
            rhai_templates: cfg!(feature = "rhai"),
        }
    }
}
