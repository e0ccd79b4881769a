//! Handler contract and the Handler Registry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::StreamerError;
use crate::queue::AsyncRequest;
use crate::reporter::ProgressReporter;

/// Cooperative cancellation + deadline passed to every handler invocation
/// Handlers must treat cancellation as hard cancellation, not a hint.
#[derive(Clone)]
pub struct HandlerContext {
    pub request_id: String,
    cancel: tokio_util::sync::CancellationToken,
}

impl HandlerContext {
    pub fn new(request_id: impl Into<String>, cancel: tokio_util::sync::CancellationToken) -> Self {
        Self {
            request_id: request_id.into(),
            cancel,
        }
    }

    /// Resolves once the invocation's deadline has been reached or cancellation requested.
    pub async fn done(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// User-supplied code implementing a single action.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Pure; MUST NOT perform I/O.
    fn validate(&self, req: &AsyncRequest) -> Result<(), StreamerError>;

    /// Used only by the Router for sync/async classification.
    fn estimated_duration(&self) -> Duration;

    /// Used on the sync path.
    async fn process(&self, ctx: &HandlerContext, req: &AsyncRequest) -> Result<Value, StreamerError>;

    /// Used on the async path; progress calls are advisory, not back-pressured
    /// by the network. Default implementation calls `process` and emits a
    /// synthetic 0%/100% pair.
    async fn process_with_progress(
        &self,
        ctx: &HandlerContext,
        req: &AsyncRequest,
        reporter: &ProgressReporter,
    ) -> Result<Value, StreamerError> {
        reporter.report(0, "starting", None).await;
        let result = self.process(ctx, req).await?;
        reporter.report(100, "done", None).await;
        Ok(result)
    }

    /// Whether this handler overrides the default `process_with_progress`.
    /// Handlers that do should return `true` so the Executor can skip the
    /// synthetic 0/100 pair in favor of the handler's own granular reports.
    fn supports_progress(&self) -> bool {
        false
    }
}

/// Action → handler map shared by Router and Executor.
/// Immutable after startup; readers require no synchronization.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
}

pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(action).cloned()
    }
}

impl HandlerRegistryBuilder {
    /// Registration after startup is not supported; the registry is
    /// frozen into an `Arc<HashMap>` once `build()` is called.
    pub fn register(mut self, action: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(action.into(), handler);
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
