//! Async Executor
//!
//! Drains the queue's change-stream, dispatches a bounded worker pool,
//! invokes handlers with bounded retries, and emits progress/result through
//! the Notifier. The worker-pool/retry shape is grounded on
//! `activity_queue::{worker, retry}`: a fixed number of spawned workers
//! consuming a channel, with a `Stats`-style atomic counter set here
//! repurposed as `ExecutorStats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::metrics::Metrics;
use crate::notifier::Notifier;
use crate::queue::{AsyncRequest, ChangeEvent, RequestQueue, RequestStatus};
use crate::registry::now_secs;
use crate::reporter::ProgressReporter;

/// Pending/running/completed/failed counters, mirroring `activity_queue::Stats`.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub running: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
}

pub struct Executor {
    queue: Arc<dyn RequestQueue>,
    handlers: HandlerRegistry,
    notifier: Arc<Notifier>,
    metrics: Arc<dyn Metrics>,
    config: Arc<Config>,
    pool_limit: Arc<Semaphore>,
    stats: Arc<ExecutorStats>,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        handlers: HandlerRegistry,
        notifier: Arc<Notifier>,
        metrics: Arc<dyn Metrics>,
        config: Arc<Config>,
    ) -> Self {
        let pool_size = config.executor_pool_size;
        Self {
            queue,
            handlers,
            notifier,
            metrics,
            config,
            pool_limit: Arc::new(Semaphore::new(pool_size)),
            stats: Arc::new(ExecutorStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> Arc<ExecutorStats> {
        self.stats.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consume the change-stream until shutdown; dispatch a worker task per
    /// eligible record.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut changes = self.queue.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => {
                        tracing::info!("executor shutting down");
                        break;
                    }
                    event = changes.recv() => {
                        match event {
                            Ok(event) => this.clone().dispatch(event),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                tracing::warn!(skipped, "executor change-stream lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    fn dispatch(self: Arc<Self>, event: ChangeEvent) {
        let record = event.record().clone();
        // Ignore records not in PENDING, unless a retry scheduler re-flagged
        // them for another attempt.
        if record.status != RequestStatus::Pending {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let permit = this.pool_limit.clone().acquire_owned().await.unwrap();
            this.stats.running.fetch_add(1, Ordering::Relaxed);
            this.process_one(record).await;
            this.stats.running.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    async fn process_one(&self, record: AsyncRequest) {
        let span = tracing::info_span!("streamer.execute", request_id = %record.request_id, action = %record.action);
        let _enter = span.enter();

        let handler = match self.handlers.get(&record.action) {
            Some(h) => h,
            None => {
                let _ = self
                    .queue
                    .fail_request(&record.request_id, "no handler registered for action")
                    .await;
                self.metrics.request_async_failed();
                return;
            }
        };

        // Transition PENDING -> PROCESSING via the conditional status write;
        // a record is never processed by two workers simultaneously.
        if self
            .queue
            .update_status(&record.request_id, RequestStatus::Processing, None)
            .await
            .is_err()
        {
            return;
        }

        let estimated = handler.estimated_duration();
        // 1.5x the handler's estimated duration, capped at 60s.
        let deadline = (estimated * 3 / 2).min(Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            guard.cancel();
        });
        let ctx = HandlerContext::new(record.request_id.clone(), cancel);

        let (reporter, reporter_handle) = ProgressReporter::spawn_with_metrics(
            record.request_id.clone(),
            record.connection_id.clone(),
            self.notifier.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );

        let started = std::time::Instant::now();
        let outcome = if handler.supports_progress() {
            handler.process_with_progress(&ctx, &record, &reporter).await
        } else {
            // Handler only implements `process`: emit the synthetic 0%/100%
            // pair the default `process_with_progress` would have produced.
            reporter.report(0, "starting", None).await;
            handler.process(&ctx, &record).await
        };
        timer.abort();
        self.metrics.stage_latency("executor.process", started.elapsed().as_millis() as u64);

        match outcome {
            Ok(result) => {
                let _ = self.queue.complete_request(&record.request_id, result.clone()).await;
                reporter.complete(result).await;
                self.metrics.request_async_completed();
            }
            Err(err) => {
                let retryable = err.is_retryable();
                if retryable && record.retry_count < record.max_retries {
                    let attempt = record.retry_count + 1;
                    let backoff = (self.config.retry_backoff_base() * attempt).min(self.config.retry_backoff_cap());
                    let _ = self
                        .queue
                        .update_status(
                            &record.request_id,
                            RequestStatus::Retrying,
                            Some(err.message.clone()),
                        )
                        .await;
                    self.metrics.request_retried();
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    schedule_retry(self.queue.clone(), record.request_id.clone(), backoff);
                    reporter.shutdown(Duration::from_millis(50)).await;
                } else {
                    let _ = self.queue.fail_request(&record.request_id, &err.message).await;
                    reporter.fail(err).await;
                    self.metrics.request_async_failed();
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // The batcher exits on its own once it processes the terminal command
        // above; wait for that instead of racing an abort against its send.
        if tokio::time::timeout(Duration::from_secs(2), reporter_handle)
            .await
            .is_err()
        {
            tracing::warn!(request_id = %record.request_id, "progress batcher did not exit in time");
        }
    }
}

/// Re-surfaces a retrying record as PENDING once `backoff` elapses, standing
/// in for a periodic scanner over `(status=RETRYING, retry_after <= now)`.
fn schedule_retry(queue: Arc<dyn RequestQueue>, request_id: String, backoff: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(backoff).await;
        let retry_after = now_secs();
        if let Err(e) = queue.schedule_retry(&request_id, retry_after).await {
            tracing::warn!(request_id, error = %e, "failed to re-surface retrying request");
        }
    });
}
