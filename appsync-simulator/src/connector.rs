//! Lambda invocation connector.
//!
//! A connector is bound to one function and lives for exactly one GraphQL
//! request. It owns two caches: one for `Invoke` operations, dispatched per
//! key, and one for `BatchInvoke` operations, grouped per scheduling tick.

use std::fmt;
use std::sync::Arc;

use serde_json_bytes::Value;
use tower::BoxError;
use tracing::Span;

use crate::configuration::FunctionConfig;
use crate::loader::BatchCache;
use crate::loader::BatchFn;
use crate::loader::Load;

/// Runs a backend function.
///
/// This is the seam to whatever actually executes the Lambda handler: a local
/// process, a container, an HTTP endpoint.
#[async_trait::async_trait]
pub trait InvocationTransport: Send + Sync + 'static {
    /// Invokes `function` with a single event and returns its result.
    async fn invoke(
        &self,
        function: &FunctionConfig,
        event: Value,
        span: &Span,
    ) -> Result<Value, BoxError>;

    /// Invokes `function` once with a list of events.
    ///
    /// The result list has the same length and order as `events`. By default
    /// the list is sent as the event payload and the function must answer
    /// with a list.
    async fn invoke_batch(
        &self,
        function: &FunctionConfig,
        events: Vec<Value>,
        span: &Span,
    ) -> Result<Vec<Value>, BoxError> {
        match self.invoke(function, Value::Array(events), span).await? {
            Value::Array(results) => Ok(results),
            _ => Err(format!(
                "function {} must return a list for a BatchInvoke operation",
                function.function_name
            )
            .into()),
        }
    }
}

/// Request-scoped access to one function.
pub struct InvocationConnector {
    function: Arc<FunctionConfig>,
    batched: BatchCache<Value, Value>,
    single: BatchCache<Value, Value>,
}

impl fmt::Debug for InvocationConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationConnector")
            .field("function", &self.function.key)
            .field("batched", &self.batched)
            .field("single", &self.single)
            .finish()
    }
}

#[buildstructor::buildstructor]
impl InvocationConnector {
    /// Returns a builder for a connector.
    ///
    /// * `.transport(Arc<dyn InvocationTransport>)` Required.
    /// * `.function(Arc<FunctionConfig>)` Required.
    /// * `.span(Span)` Optional, the request span handed to the transport.
    ///   Defaults to the current span.
    #[builder(visibility = "pub")]
    fn new(
        transport: Arc<dyn InvocationTransport>,
        function: Arc<FunctionConfig>,
        span: Option<Span>,
    ) -> Self {
        let span = span.unwrap_or_else(Span::current);
        let batched = BatchCache::batched(
            "invoke_batch",
            BatchInvoke {
                transport: transport.clone(),
                function: function.clone(),
                span: span.clone(),
            },
        );
        let single = BatchCache::single(
            "invoke",
            SingleInvoke {
                transport,
                function: function.clone(),
                span,
            },
        );
        Self {
            function,
            batched,
            single,
        }
    }

    pub fn function(&self) -> &FunctionConfig {
        &self.function
    }

    /// Invokes the function with `event`, once per distinct event in this
    /// request.
    pub fn invoke(&self, event: Value) -> Load<Value> {
        self.single.load(event)
    }

    /// Queues `event` into the current tick's batch for this function.
    pub fn invoke_batch(&self, event: Value) -> Load<Value> {
        self.batched.load(event)
    }
}

struct BatchInvoke {
    transport: Arc<dyn InvocationTransport>,
    function: Arc<FunctionConfig>,
    span: Span,
}

#[async_trait::async_trait]
impl BatchFn<Value, Value> for BatchInvoke {
    async fn load(&self, events: Vec<Value>) -> Result<Vec<Value>, BoxError> {
        tracing::debug!(
            parent: &self.span,
            function = %self.function.key,
            size = events.len(),
            "invoking function with a batch"
        );
        self.transport
            .invoke_batch(&self.function, events, &self.span)
            .await
    }
}

struct SingleInvoke {
    transport: Arc<dyn InvocationTransport>,
    function: Arc<FunctionConfig>,
    span: Span,
}

#[async_trait::async_trait]
impl BatchFn<Value, Value> for SingleInvoke {
    async fn load(&self, events: Vec<Value>) -> Result<Vec<Value>, BoxError> {
        futures::future::try_join_all(events.into_iter().map(|event| {
            tracing::debug!(parent: &self.span, function = %self.function.key, "invoking function");
            self.transport.invoke(&self.function, event, &self.span)
        }))
        .await
    }
}
