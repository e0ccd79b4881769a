//! Connection Registry
//!
//! Record-of-truth for live sockets. Grounded on
//! `session::store::{Session, InMemorySessionStore}`: a `DashMap`-backed store
//! with idempotent save, lookup, and a periodic sweep task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::metrics::{Metrics, NoopMetrics};

/// A live socket.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub endpoint: String,
    pub connected_at: i64,
    pub last_activity: i64,
    pub metadata: HashMap<String, String>,
    pub expires_at: i64,
}

impl Connection {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        endpoint: impl Into<String>,
        ttl: Duration,
        now: i64,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            endpoint: endpoint.into(),
            connected_at: now,
            last_activity: now,
            metadata: HashMap::new(),
            expires_at: now + ttl.as_secs() as i64,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Contract for the backing store.
#[async_trait::async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Idempotent: last-writer-wins on `connection_id`.
    async fn save(&self, conn: Connection);
    /// Returns `None` if absent or expired.
    async fn get(&self, id: &str) -> Option<Connection>;
    async fn delete(&self, id: &str);
    async fn list_by_user(&self, user_id: &str) -> Vec<Connection>;
    async fn list_by_tenant(&self, tenant_id: &str) -> Vec<Connection>;
    async fn update_last_activity(&self, id: &str, now: i64);
    /// Deterministic pruning for tests; the backing store is expected to
    /// reclaim expired records on its own.
    async fn delete_stale(&self, before: i64) -> usize;
}

/// In-memory registry, `DashMap`-backed like `InMemorySessionStore`.
pub struct InMemoryConnectionRegistry {
    connections: DashMap<String, Connection>,
    metrics: Arc<dyn Metrics>,
}

impl std::fmt::Debug for InMemoryConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnectionRegistry")
            .field("connections", &self.connections)
            .finish()
    }
}

impl Default for InMemoryConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    /// As `new`, but records `connection_opened`/`connection_closed` on save/delete.
    pub fn with_metrics(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            connections: DashMap::new(),
            metrics,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn save(&self, conn: Connection) {
        tracing::debug!(connection_id = %conn.connection_id, tenant_id = %conn.tenant_id, "saving connection");
        self.connections.insert(conn.connection_id.clone(), conn);
        self.metrics.connection_opened();
    }

    async fn get(&self, id: &str) -> Option<Connection> {
        let now = now_secs();
        let entry = self.connections.get(id)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.clone())
    }

    async fn delete(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            tracing::info!(connection_id = %id, "connection deleted");
            self.metrics.connection_closed();
        }
    }

    async fn list_by_user(&self, user_id: &str) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn update_last_activity(&self, id: &str, now: i64) {
        if let Some(mut entry) = self.connections.get_mut(id) {
            entry.last_activity = now;
        }
    }

    async fn delete_stale(&self, before: i64) -> usize {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.expires_at < before)
            .map(|e| e.key().clone())
            .collect();
        let removed = stale.len();
        for id in stale {
            self.connections.remove(&id);
            self.metrics.connection_closed();
        }
        if removed > 0 {
            tracing::info!(removed, "swept stale connections");
        }
        removed
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Periodic sweep, mirroring `session::store::spawn_cleanup_task`.
pub fn spawn_cleanup_task(
    registry: Arc<dyn ConnectionRegistry>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("connection registry cleanup task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    registry.delete_stale(now_secs()).await;
                }
            }
        }
    })
}
