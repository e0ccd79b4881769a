//! Progress Reporter — per-request batching layer over the Notifier
//!
//! Wraps the Notifier for a single `(request_id, connection_id)` pair.
//! Buffered updates flush on the earliest of a timer, a batch-size cap, a
//! percentage threshold, or an explicit `Complete`/`Fail`/`Shutdown` — the
//! same batch-or-flush shape as MCP progress notification types,
//! generalized from a fire-and-forget notification to a rate-limited,
//! back-pressured send path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::error::StreamerError;
use crate::metrics::{Metrics, NoopMetrics};
use crate::notifier::Notifier;
use crate::protocol::ResponseFrame;
use crate::registry::now_secs;

#[derive(Debug, Clone)]
enum ReportCommand {
    Report {
        percentage: u8,
        message: String,
        metadata: Option<HashMap<String, String>>,
    },
    SetMetadata(String, String),
    Complete(Value),
    Fail(StreamerError),
    Shutdown,
}

/// Handle given to a handler's `ProcessWithProgress` call.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ReportCommand>,
    last_percentage: Arc<Mutex<u8>>,
}

impl ProgressReporter {
    /// Spawn the batching task and return a handle plus its join future.
    /// Metrics default to a no-op sink; use `spawn_with_metrics` to record
    /// `progress_emitted` on every flushed progress frame.
    pub fn spawn(
        request_id: String,
        connection_id: String,
        notifier: Arc<Notifier>,
        config: Arc<Config>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        Self::spawn_with_metrics(request_id, connection_id, notifier, config, Arc::new(NoopMetrics))
    }

    /// As `spawn`, but records `progress_emitted` on every flushed progress frame.
    pub fn spawn_with_metrics(
        request_id: String,
        connection_id: String,
        notifier: Arc<Notifier>,
        config: Arc<Config>,
        metrics: Arc<dyn Metrics>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let last_percentage = Arc::new(Mutex::new(0u8));
        let handle = tokio::spawn(run_batcher(
            request_id,
            connection_id,
            notifier,
            config,
            metrics,
            rx,
        ));
        (
            Self {
                tx,
                last_percentage,
            },
            handle,
        )
    }

    /// Report progress; a lower percentage than previously reported is
    /// coerced to the last value (monotonicity) and `Report(-1, ..)`
    /// is rejected outright.
    pub async fn report(
        &self,
        percentage: i32,
        message: impl Into<String>,
        metadata: Option<HashMap<String, String>>,
    ) {
        if percentage < 0 {
            tracing::warn!(percentage, "rejected negative progress report");
            return;
        }
        let clamped = percentage.min(100) as u8;
        let mut last = self.last_percentage.lock().await;
        let effective = if clamped < *last {
            tracing::info!(reported = clamped, coerced_to = *last, "progress regressed, coercing");
            *last
        } else {
            *last = clamped;
            clamped
        };
        let _ = self
            .tx
            .send(ReportCommand::Report {
                percentage: effective,
                message: message.into(),
                metadata,
            })
            .await;
    }

    /// Attach sticky metadata, merged into every subsequent flushed frame
    /// (progress and the terminal result) until the request completes.
    pub async fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self
            .tx
            .send(ReportCommand::SetMetadata(key.into(), value.into()))
            .await;
    }

    pub async fn complete(&self, result: Value) {
        let _ = self.tx.send(ReportCommand::Complete(result)).await;
    }

    pub async fn fail(&self, err: StreamerError) {
        let _ = self.tx.send(ReportCommand::Fail(err)).await;
    }

    pub async fn shutdown(&self, budget: Duration) {
        let _ = self.tx.send(ReportCommand::Shutdown).await;
        tokio::time::sleep(budget.min(Duration::from_secs(2))).await;
    }
}

type PendingBatch = (u8, String, Option<HashMap<String, String>>);

async fn run_batcher(
    request_id: String,
    connection_id: String,
    notifier: Arc<Notifier>,
    config: Arc<Config>,
    metrics: Arc<dyn Metrics>,
    mut rx: mpsc::Receiver<ReportCommand>,
) {
    let mut interval = tokio::time::interval(config.progress_batch_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut pending: Option<PendingBatch> = None;
    let mut batched_count = 0usize;
    let mut sticky_metadata: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None | Some(ReportCommand::Shutdown) => {
                        if let Some((pct, msg, meta)) = pending.take() {
                            flush(&request_id, &connection_id, &notifier, metrics.as_ref(), pct, &msg, meta, &sticky_metadata, batched_count).await;
                        }
                        return;
                    }
                    Some(ReportCommand::SetMetadata(key, value)) => {
                        sticky_metadata.insert(key, value);
                    }
                    Some(ReportCommand::Report { percentage, message, metadata }) => {
                        pending = Some((percentage, message, metadata));
                        batched_count += 1;
                        let crosses_threshold = percentage >= config.progress_flush_threshold;
                        let hits_batch_cap = batched_count >= config.progress_max_batch;
                        if crosses_threshold || hits_batch_cap {
                            if let Some((pct, msg, meta)) = pending.take() {
                                flush(&request_id, &connection_id, &notifier, metrics.as_ref(), pct, &msg, meta, &sticky_metadata, batched_count).await;
                            }
                            batched_count = 0;
                        }
                    }
                    Some(ReportCommand::Complete(result)) => {
                        if let Some((pct, msg, meta)) = pending.take() {
                            flush(&request_id, &connection_id, &notifier, metrics.as_ref(), pct, &msg, meta, &sticky_metadata, batched_count).await;
                        }
                        let frame = ResponseFrame::Result {
                            id: request_id.clone(),
                            success: true,
                            data: result,
                            metadata: merged_metadata(&sticky_metadata, None),
                        };
                        send(&connection_id, &notifier, frame).await;
                        return;
                    }
                    Some(ReportCommand::Fail(err)) => {
                        if let Some((pct, msg, meta)) = pending.take() {
                            flush(&request_id, &connection_id, &notifier, metrics.as_ref(), pct, &msg, meta, &sticky_metadata, batched_count).await;
                        }
                        let frame = ResponseFrame::error(Some(request_id.clone()), &err);
                        send(&connection_id, &notifier, frame).await;
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                if let Some((pct, msg, meta)) = pending.take() {
                    flush(&request_id, &connection_id, &notifier, metrics.as_ref(), pct, &msg, meta, &sticky_metadata, batched_count).await;
                    batched_count = 0;
                }
            }
        }
    }
}

/// Sticky metadata first, overlaid with per-call metadata so an explicit
/// key on a single report wins over the sticky value.
fn merged_metadata(
    sticky: &HashMap<String, String>,
    per_call: Option<HashMap<String, String>>,
) -> Option<HashMap<String, String>> {
    if sticky.is_empty() && per_call.is_none() {
        return None;
    }
    let mut merged = sticky.clone();
    merged.extend(per_call.unwrap_or_default());
    Some(merged)
}

#[allow(clippy::too_many_arguments)]
async fn flush(
    request_id: &str,
    connection_id: &str,
    notifier: &Notifier,
    metrics: &dyn Metrics,
    percentage: u8,
    message: &str,
    metadata: Option<HashMap<String, String>>,
    sticky_metadata: &HashMap<String, String>,
    batched_count: usize,
) {
    let mut meta = merged_metadata(sticky_metadata, metadata).unwrap_or_default();
    meta.insert("batched_count".to_string(), batched_count.to_string());
    let frame = ResponseFrame::Progress {
        id: request_id.to_string(),
        percentage,
        message: message.to_string(),
        metadata: Some(meta),
        timestamp: now_secs(),
    };
    metrics.progress_emitted();
    send(connection_id, notifier, frame).await;
}

async fn send(connection_id: &str, notifier: &Notifier, frame: ResponseFrame) {
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(connection_id, error = %e, "progress frame failed to marshal, dropping");
            return;
        }
    };
    if let Err(e) = notifier.send(connection_id, &bytes).await {
        // Send failures do not fail the request; persisted status is authoritative.
        tracing::debug!(connection_id, error = %e, "progress send failed, dropping frame");
    }
}
