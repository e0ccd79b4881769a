//! Notifier — per-endpoint send path
//!
//! Delivers a serialized frame to a connection's callback endpoint: retries
//! transient failures with jittered exponential backoff, breaks the circuit
//! on sustained failure, evicts gone connections, and fans broadcasts out
//! with bounded parallelism. The retry/backoff shape is grounded on
//! `activity_queue::retry`'s `backoff.pow(attempt)` loop; the breaker itself
//! (Closed/Open/HalfOpen) is this crate's own state machine, motivated by
//! the circuit-breaker concern `tower-resilience` documents.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{ErrorCode, StreamerError};
use crate::metrics::Metrics;
use crate::registry::{now_secs, ConnectionRegistry};

/// The external socket gateway's send surface: `Send(connection_id, bytes)`.
#[async_trait::async_trait]
pub trait GatewaySender: Send + Sync {
    async fn send(&self, endpoint: &str, bytes: Vec<u8>) -> Result<(), GatewaySendError>;
}

#[derive(Debug, Clone)]
pub enum GatewaySendError {
    /// 410-equivalent: the connection is gone.
    Gone,
    /// Throttling or a transient network failure; retry.
    Transient(String),
    /// Forbidden, payload too large, or otherwise not worth retrying.
    Terminal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: std::sync::Mutex<BreakerState>,
    consecutive_failures: AtomicU32,
    window_start: AtomicU64,
    opened_at: AtomicU64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            window_start: AtomicU64::new(now_secs() as u64),
            opened_at: AtomicU64::new(0),
        }
    }

    fn allow(&self, cooldown: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = self.opened_at.load(Ordering::Relaxed) as i64;
                if now_secs() - opened_at >= cooldown.as_secs() as i64 {
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    /// Returns `true` if this success actually closed a breaker that was
    /// Open or HalfOpen (as opposed to a no-op success while already Closed).
    fn on_success(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let was_open = *state != BreakerState::Closed;
        *state = BreakerState::Closed;
        self.consecutive_failures.store(0, Ordering::Relaxed);
        was_open
    }

    fn on_failure(&self, threshold: u32, window: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == BreakerState::HalfOpen {
            *state = BreakerState::Open;
            self.opened_at.store(now_secs() as u64, Ordering::Relaxed);
            return true;
        }

        let now = now_secs() as u64;
        let window_start = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(window_start) > window.as_secs() {
            self.window_start.store(now, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= threshold && *state != BreakerState::Open {
            *state = BreakerState::Open;
            self.opened_at.store(now_secs() as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// Aggregate result of a `Broadcast` call.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub succeeded: Vec<String>,
    pub failed: HashMap<String, StreamerError>,
}

pub struct Notifier {
    registry: Arc<dyn ConnectionRegistry>,
    gateway: Arc<dyn GatewaySender>,
    metrics: Arc<dyn Metrics>,
    config: Arc<Config>,
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
    broadcast_limit: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Notifier {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        gateway: Arc<dyn GatewaySender>,
        metrics: Arc<dyn Metrics>,
        config: Arc<Config>,
    ) -> Self {
        let parallelism = config.notifier_broadcast_parallelism;
        Self {
            registry,
            gateway,
            metrics,
            config,
            breakers: Arc::new(DashMap::new()),
            broadcast_limit: Arc::new(Semaphore::new(parallelism)),
            shutdown: CancellationToken::new(),
        }
    }

    fn breaker_for(&self, endpoint: &str) -> Arc<Breaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Breaker::new()))
            .clone()
    }

    /// Whether `connection_id`'s endpoint currently accepts sends (breaker not open).
    pub async fn is_active(&self, connection_id: &str) -> bool {
        match self.registry.get(connection_id).await {
            Some(conn) => self
                .breaker_for(&conn.endpoint)
                .allow(self.config.circuit_breaker_cooldown()),
            None => false,
        }
    }

    /// Deliver `msg` to `connection_id`, retrying transient failures.
    pub async fn send(&self, connection_id: &str, msg: &[u8]) -> Result<(), StreamerError> {
        if self.shutdown.is_cancelled() {
            return Err(StreamerError::service_unavailable("notifier is shut down"));
        }

        let conn = self
            .registry
            .get(connection_id)
            .await
            .ok_or_else(|| StreamerError::not_found(format!("connection {connection_id} unknown")))?;

        let breaker = self.breaker_for(&conn.endpoint);
        if !breaker.allow(self.config.circuit_breaker_cooldown()) {
            return Err(StreamerError::service_unavailable(format!(
                "circuit open for endpoint {}",
                conn.endpoint
            )));
        }

        const MAX_ATTEMPTS: u32 = 3;
        const BASE: Duration = Duration::from_millis(50);
        const CAP: Duration = Duration::from_secs(2);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.gateway.send(&conn.endpoint, msg.to_vec()).await {
                Ok(()) => {
                    if breaker.on_success() {
                        self.metrics.circuit_breaker_closed(&conn.endpoint);
                    }
                    return Ok(());
                }
                Err(GatewaySendError::Gone) => {
                    tracing::info!(connection_id, endpoint = %conn.endpoint, "endpoint gone, evicting connection");
                    self.registry.delete(connection_id).await;
                    self.metrics.send_failure();
                    return Err(StreamerError::new(ErrorCode::NotFound, "endpoint gone"));
                }
                Err(GatewaySendError::Terminal(msg)) => {
                    self.metrics.send_failure();
                    return Err(StreamerError::validation(msg));
                }
                Err(GatewaySendError::Transient(msg)) => {
                    self.metrics.send_failure();
                    if attempt >= MAX_ATTEMPTS {
                        if breaker.on_failure(
                            self.config.circuit_breaker_threshold,
                            self.config.circuit_breaker_window(),
                        ) {
                            self.metrics.circuit_breaker_opened(&conn.endpoint);
                        }
                        return Err(StreamerError::timeout(msg));
                    }
                    let delay = backoff_with_jitter(BASE, CAP, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fan out to many connections with bounded parallelism; never let one
    /// slow endpoint stall the rest.
    pub async fn broadcast(&self, connection_ids: &[String], msg: &[u8]) -> BroadcastOutcome {
        if connection_ids.is_empty() {
            return BroadcastOutcome::default();
        }

        let mut tasks = Vec::with_capacity(connection_ids.len());
        for id in connection_ids {
            let permit = self.broadcast_limit.clone().acquire_owned().await.unwrap();
            let id = id.clone();
            let msg = msg.to_vec();
            // Safety: `self` outlives the spawned tasks because callers await `broadcast`
            // before the Notifier can be dropped; we only borrow data already Arc'd inside.
            let registry = self.registry.clone();
            let gateway = self.gateway.clone();
            let metrics = self.metrics.clone();
            let config = self.config.clone();
            let breakers = self.breakers.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let notifier = NotifierHandle {
                    registry,
                    gateway,
                    metrics,
                    config,
                    breakers,
                };
                (id.clone(), notifier.send_once(&id, &msg).await)
            }));
        }

        let mut outcome = BroadcastOutcome::default();
        for task in tasks {
            match task.await {
                Ok((id, Ok(()))) => outcome.succeeded.push(id),
                Ok((id, Err(e))) => {
                    outcome.failed.insert(id, e);
                }
                Err(join_err) => {
                    tracing::warn!(error = %join_err, "broadcast task panicked");
                }
            }
        }
        outcome
    }

    /// Drain in-flight sends until `deadline`, then fail fast.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutdown.cancel();
        tokio::time::sleep(deadline.min(Duration::from_secs(2))).await;
    }
}

/// A cheaply cloneable view of the Notifier's collaborators, used so a single
/// broadcast fan-out can run each send on its own task without holding a
/// borrow of `&Notifier` across an `.await`.
#[derive(Clone)]
struct NotifierHandle {
    registry: Arc<dyn ConnectionRegistry>,
    gateway: Arc<dyn GatewaySender>,
    metrics: Arc<dyn Metrics>,
    config: Arc<Config>,
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
}

impl NotifierHandle {
    async fn send_once(&self, connection_id: &str, msg: &[u8]) -> Result<(), StreamerError> {
        let conn = self
            .registry
            .get(connection_id)
            .await
            .ok_or_else(|| StreamerError::not_found(format!("connection {connection_id} unknown")))?;

        let breaker = self
            .breakers
            .entry(conn.endpoint.clone())
            .or_insert_with(|| Arc::new(Breaker::new()))
            .clone();

        if !breaker.allow(self.config.circuit_breaker_cooldown()) {
            return Err(StreamerError::service_unavailable(format!(
                "circuit open for endpoint {}",
                conn.endpoint
            )));
        }

        match self.gateway.send(&conn.endpoint, msg.to_vec()).await {
            Ok(()) => {
                if breaker.on_success() {
                    self.metrics.circuit_breaker_closed(&conn.endpoint);
                }
                Ok(())
            }
            Err(GatewaySendError::Gone) => {
                self.registry.delete(connection_id).await;
                self.metrics.send_failure();
                Err(StreamerError::new(ErrorCode::NotFound, "endpoint gone"))
            }
            Err(GatewaySendError::Terminal(msg)) => {
                self.metrics.send_failure();
                Err(StreamerError::validation(msg))
            }
            Err(GatewaySendError::Transient(msg)) => {
                self.metrics.send_failure();
                if breaker.on_failure(
                    self.config.circuit_breaker_threshold,
                    self.config.circuit_breaker_window(),
                ) {
                    self.metrics.circuit_breaker_opened(&conn.endpoint);
                }
                Err(StreamerError::timeout(msg))
            }
        }
    }
}

fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(cap.as_millis() as u64);
    let jitter_range = (capped as f64 * 0.2) as i64;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range.max(1));
    let millis = (capped as i64 + jitter).max(0) as u64;
    Duration::from_millis(millis)
}
