//! Local simulation of AppSync Lambda resolvers.
//!
//! Every mapped GraphQL field is resolved by rendering a request mapping
//! template into an invocation envelope, invoking a backend function and
//! rendering a response mapping template with the function result.
//! Invocations issued while resolving one request are deduplicated, cached and
//! optionally batched per scheduling tick. Nothing is shared between requests
//! except the template file cache.
//!
//! A host builds one [`AppSyncSimulator`] at startup, installs
//! [`resolve_field`] on every field listed by [`AppSyncSimulator::resolvers`]
//! and creates a [`RequestContext`] per inbound request.

#![warn(unreachable_pub)]

pub mod configuration;
pub mod connector;
pub mod dispatcher;
pub mod error;
mod files;
pub mod graphql;
pub mod json_ext;
pub mod loader;
pub mod mapper;
mod simulator;
pub mod template;

pub use configuration::Configuration;
pub use connector::InvocationConnector;
pub use connector::InvocationTransport;
pub use dispatcher::resolve_field;
pub use dispatcher::RequestContext;
pub use dispatcher::ResolverDispatcher;
pub use error::ResolverError;
pub use files::FileLoader;
pub use mapper::TemplateMapper;
pub use simulator::AppSyncSimulator;
pub use simulator::ResolverMap;
#[cfg(feature = "rhai")]
pub use template::RhaiRenderer;
pub use template::TemplateContext;
pub use template::TemplateRenderer;
