//! Observability seam
//!
//! A `Metrics` trait gives the metrics sink — an external collaborator —
//! a concrete seam without inventing a fake StatsD/Prometheus client.
//! `TracingMetrics` emits the counters as `tracing` events, the way the
//! rest of the crate reports structured logs.

/// Named events the sink receives counter/histogram updates for.
pub trait Metrics: Send + Sync {
    fn connection_opened(&self) {}
    fn connection_closed(&self) {}
    fn auth_failure(&self) {}
    fn request_queued(&self) {}
    fn request_sync_processed(&self) {}
    fn request_async_completed(&self) {}
    fn request_async_failed(&self) {}
    fn request_retried(&self) {}
    fn progress_emitted(&self) {}
    fn send_failure(&self) {}
    fn circuit_breaker_opened(&self, endpoint: &str) {
        let _ = endpoint;
    }
    fn circuit_breaker_closed(&self, endpoint: &str) {
        let _ = endpoint;
    }
    fn stage_latency(&self, stage: &str, millis: u64) {
        let _ = (stage, millis);
    }
}

/// Default no-op sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Emits every counter/histogram as a `tracing` event at `debug` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn connection_opened(&self) {
        tracing::debug!(metric = "connection_opened");
    }

    fn connection_closed(&self) {
        tracing::debug!(metric = "connection_closed");
    }

    fn auth_failure(&self) {
        tracing::debug!(metric = "auth_failure");
    }

    fn request_queued(&self) {
        tracing::debug!(metric = "request_queued");
    }

    fn request_sync_processed(&self) {
        tracing::debug!(metric = "request_sync_processed");
    }

    fn request_async_completed(&self) {
        tracing::debug!(metric = "request_async_completed");
    }

    fn request_async_failed(&self) {
        tracing::debug!(metric = "request_async_failed");
    }

    fn request_retried(&self) {
        tracing::debug!(metric = "request_retried");
    }

    fn progress_emitted(&self) {
        tracing::debug!(metric = "progress_emitted");
    }

    fn send_failure(&self) {
        tracing::debug!(metric = "send_failure");
    }

    fn circuit_breaker_opened(&self, endpoint: &str) {
        tracing::debug!(metric = "circuit_breaker_opened", endpoint);
    }

    fn circuit_breaker_closed(&self, endpoint: &str) {
        tracing::debug!(metric = "circuit_breaker_closed", endpoint);
    }

    fn stage_latency(&self, stage: &str, millis: u64) {
        tracing::debug!(metric = "stage_latency", stage, millis);
    }
}
