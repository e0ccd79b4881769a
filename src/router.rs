//! Router — entry point for a socket frame
//!
//! Stateless beyond its handler registry and queue/registry handles; every
//! frame runs through parse → resolve connection → lookup handler →
//! validate → classify sync-vs-async.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ErrorCode, StreamerError};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::metrics::Metrics;
use crate::protocol::{RequestFrame, ResponseFrame};
use crate::queue::{AsyncRequest, EnqueueError, RequestQueue};
use crate::registry::ConnectionRegistry;

pub struct Router {
    registry: Arc<dyn ConnectionRegistry>,
    queue: Arc<dyn RequestQueue>,
    handlers: HandlerRegistry,
    metrics: Arc<dyn Metrics>,
    config: Arc<Config>,
}

impl Router {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        queue: Arc<dyn RequestQueue>,
        handlers: HandlerRegistry,
        metrics: Arc<dyn Metrics>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            queue,
            handlers,
            metrics,
            config,
        }
    }

    /// Route one inbound frame, returning the immediate reply (`ack`, `result`, or `error`).
    /// `remaining_budget` is what's left of the inbound-timeout window (~29s).
    pub async fn route(&self, connection_id: &str, bytes: &[u8], remaining_budget: Duration) -> ResponseFrame {
        let span = tracing::info_span!("streamer.route", connection_id, request_id = tracing::field::Empty);
        let _enter = span.enter();

        let frame = match RequestFrame::decode(bytes) {
            Ok(f) => f,
            Err(e) => return ResponseFrame::error(None, &e),
        };
        span.record("request_id", frame.id.as_str());

        let conn = match self.registry.get(connection_id).await {
            Some(c) => c,
            None => {
                let e = StreamerError::unauthorized("unknown connection");
                return ResponseFrame::error(Some(frame.id), &e);
            }
        };

        let handler = match self.handlers.get(&frame.action) {
            Some(h) => h,
            None => {
                let e = StreamerError::invalid_action(&frame.action);
                return ResponseFrame::error(Some(frame.id), &e);
            }
        };

        let request_id = if frame.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            frame.id.clone()
        };

        let req = AsyncRequest::new(
            request_id.clone(),
            connection_id,
            &conn.user_id,
            &conn.tenant_id,
            &frame.action,
            frame.payload.clone(),
            self.config.max_retries,
            self.config.request_ttl_secs as i64,
        );

        if let Err(e) = handler.validate(&req) {
            return ResponseFrame::error(Some(frame.id), &e);
        }

        let estimated = handler.estimated_duration();
        if estimated <= self.config.async_threshold() {
            let safety_margin = self.config.router_safety_margin();
            let deadline = remaining_budget
                .saturating_sub(safety_margin)
                .min(estimated.saturating_mul(2));

            let cancel = CancellationToken::new();
            let guard = cancel.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                guard.cancel();
            });
            let ctx = HandlerContext::new(request_id.clone(), cancel);

            let started = std::time::Instant::now();
            let outcome = handler.process(&ctx, &req).await;
            timer.abort();
            self.metrics.stage_latency("router.sync_process", started.elapsed().as_millis() as u64);
            self.metrics.request_sync_processed();
            return match outcome {
                Ok(data) => ResponseFrame::result(frame.id, data),
                Err(e) => ResponseFrame::error(Some(frame.id), &e),
            };
        }

        match self.queue.enqueue(req).await {
            Ok(()) => {
                self.metrics.request_queued();
                ResponseFrame::ack_queued(frame.id, &request_id)
            }
            Err(EnqueueError::Conflict(_)) => {
                let e = StreamerError::new(ErrorCode::ValidationError, "duplicate request_id");
                ResponseFrame::error(Some(frame.id), &e)
            }
            Err(EnqueueError::Backend(msg)) => {
                let e = StreamerError::service_unavailable(msg);
                ResponseFrame::error(Some(frame.id), &e)
            }
        }
    }
}
