//! Request Queue
//!
//! Durable persistence of async requests plus the status+progress state
//! machine. The in-memory implementation is `DashMap`-backed like
//! `InMemoryConnectionRegistry` / `InMemorySessionStore`, and emits mutations
//! on a broadcast channel standing in for a durable store's change-stream —
//! the change stream is the Executor's sole trigger to pick up new work.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StreamerError;
use crate::registry::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

/// The durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncRequest {
    pub request_id: String,
    pub connection_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub action: String,
    pub payload: Value,
    pub status: RequestStatus,
    pub created_at: i64,
    pub processing_started: Option<i64>,
    pub processing_ended: Option<i64>,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_after: Option<i64>,
    pub expires_at: i64,
}

impl AsyncRequest {
    pub fn new(
        request_id: impl Into<String>,
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
        max_retries: u32,
        ttl_secs: i64,
    ) -> Self {
        let now = now_secs();
        Self {
            request_id: request_id.into(),
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            action: action.into(),
            payload,
            status: RequestStatus::Pending,
            created_at: now,
            processing_started: None,
            processing_ended: None,
            progress: 0,
            progress_message: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            retry_after: None,
            expires_at: now + ttl_secs,
        }
    }
}

/// A change-stream event: what mutated, so the Executor can decide whether
/// the record is ready to dispatch.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Insert(AsyncRequest),
    Modify(AsyncRequest),
}

impl ChangeEvent {
    pub fn record(&self) -> &AsyncRequest {
        match self {
            ChangeEvent::Insert(r) | ChangeEvent::Modify(r) => r,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EnqueueError {
    /// A distinct, resolved duplicate-`request_id` case (DESIGN.md): surfaced
    /// to the client as `VALIDATION_ERROR`, not retried.
    #[error("request {0} already exists")]
    Conflict(String),
    /// The backing store rejected or failed the write (capacity, transient
    /// store outage, etc). Per spec §4.6 point 6, this is retryable and
    /// surfaces as `SERVICE_UNAVAILABLE`; the request is not considered
    /// accepted.
    #[error("enqueue failed: {0}")]
    Backend(String),
}

/// Contract for the backing store.
#[async_trait::async_trait]
pub trait RequestQueue: Send + Sync {
    async fn enqueue(&self, req: AsyncRequest) -> Result<(), EnqueueError>;
    async fn get(&self, id: &str) -> Option<AsyncRequest>;
    async fn update_status(
        &self,
        id: &str,
        status: RequestStatus,
        message: Option<String>,
    ) -> Result<(), StreamerError>;
    async fn update_progress(
        &self,
        id: &str,
        percentage: u8,
        message: Option<String>,
        details: Option<HashMap<String, String>>,
    ) -> Result<(), StreamerError>;
    async fn complete_request(&self, id: &str, result: Value) -> Result<(), StreamerError>;
    async fn fail_request(&self, id: &str, err_msg: &str) -> Result<(), StreamerError>;
    async fn get_by_connection(&self, connection_id: &str, limit: usize) -> Vec<AsyncRequest>;
    async fn get_by_status(&self, status: RequestStatus, limit: usize) -> Vec<AsyncRequest>;
    async fn delete(&self, id: &str);
    /// Re-surface a RETRYING record as PENDING for another attempt, bumping
    /// `retry_count`; retry re-surfacing is made explicit
    /// as a queue operation rather than delegated to unspecified TTL machinery).
    async fn schedule_retry(&self, id: &str, retry_after: i64) -> Result<(), StreamerError>;
    /// Subscribe to the change-stream; the Executor's sole trigger.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

pub struct InMemoryRequestQueue {
    requests: DashMap<String, AsyncRequest>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl InMemoryRequestQueue {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            requests: DashMap::new(),
            changes: tx,
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn is_terminal(status: RequestStatus) -> bool {
        matches!(status, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl Default for InMemoryRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RequestQueue for InMemoryRequestQueue {
    async fn enqueue(&self, req: AsyncRequest) -> Result<(), EnqueueError> {
        use dashmap::mapref::entry::Entry;
        match self.requests.entry(req.request_id.clone()) {
            Entry::Occupied(_) => Err(EnqueueError::Conflict(req.request_id)),
            Entry::Vacant(v) => {
                tracing::info!(request_id = %req.request_id, action = %req.action, "enqueued async request");
                v.insert(req.clone());
                let _ = self.changes.send(ChangeEvent::Insert(req));
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Option<AsyncRequest> {
        self.requests.get(id).map(|e| e.value().clone())
    }

    async fn update_status(
        &self,
        id: &str,
        status: RequestStatus,
        message: Option<String>,
    ) -> Result<(), StreamerError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StreamerError::not_found(format!("request {id} not found")))?;
        if Self::is_terminal(entry.status) {
            return Err(StreamerError::validation(format!(
                "request {id} is terminal; rejecting status write"
            )));
        }
        entry.status = status;
        if status == RequestStatus::Processing && entry.processing_started.is_none() {
            entry.processing_started = Some(now_secs());
        }
        if let Some(msg) = message {
            entry.progress_message = Some(msg);
        }
        let snapshot = entry.value().clone();
        drop(entry);
        let _ = self.changes.send(ChangeEvent::Modify(snapshot));
        Ok(())
    }

    async fn update_progress(
        &self,
        id: &str,
        percentage: u8,
        message: Option<String>,
        details: Option<HashMap<String, String>>,
    ) -> Result<(), StreamerError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StreamerError::not_found(format!("request {id} not found")))?;
        if entry.status != RequestStatus::Processing {
            return Err(StreamerError::validation(
                "progress only accepted while PROCESSING",
            ));
        }
        let clamped = percentage.min(100);
        entry.progress = entry.progress.max(clamped);
        if let Some(msg) = message {
            entry.progress_message = Some(msg);
        }
        let _ = details;
        let snapshot = entry.value().clone();
        drop(entry);
        let _ = self.changes.send(ChangeEvent::Modify(snapshot));
        Ok(())
    }

    async fn complete_request(&self, id: &str, result: Value) -> Result<(), StreamerError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StreamerError::not_found(format!("request {id} not found")))?;
        if entry.status == RequestStatus::Completed {
            return Ok(()); // applying twice is a no-op
        }
        if entry.status == RequestStatus::Failed {
            return Err(StreamerError::validation(format!(
                "request {id} already FAILED"
            )));
        }
        entry.status = RequestStatus::Completed;
        entry.progress = 100;
        entry.result = Some(result);
        entry.processing_ended = Some(now_secs());
        let snapshot = entry.value().clone();
        drop(entry);
        let _ = self.changes.send(ChangeEvent::Modify(snapshot));
        Ok(())
    }

    async fn fail_request(&self, id: &str, err_msg: &str) -> Result<(), StreamerError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StreamerError::not_found(format!("request {id} not found")))?;
        if Self::is_terminal(entry.status) {
            return Ok(());
        }
        entry.status = RequestStatus::Failed;
        entry.error = Some(err_msg.to_string());
        entry.processing_ended = Some(now_secs());
        let snapshot = entry.value().clone();
        drop(entry);
        let _ = self.changes.send(ChangeEvent::Modify(snapshot));
        Ok(())
    }

    async fn get_by_connection(&self, connection_id: &str, limit: usize) -> Vec<AsyncRequest> {
        self.requests
            .iter()
            .filter(|e| e.connection_id == connection_id)
            .take(limit)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn get_by_status(&self, status: RequestStatus, limit: usize) -> Vec<AsyncRequest> {
        self.requests
            .iter()
            .filter(|e| e.status == status)
            .take(limit)
            .map(|e| e.value().clone())
            .collect()
    }

    async fn delete(&self, id: &str) {
        self.requests.remove(id);
    }

    async fn schedule_retry(&self, id: &str, retry_after: i64) -> Result<(), StreamerError> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| StreamerError::not_found(format!("request {id} not found")))?;
        if entry.status != RequestStatus::Retrying {
            return Err(StreamerError::validation(format!(
                "request {id} is not RETRYING"
            )));
        }
        entry.retry_count += 1;
        entry.status = RequestStatus::Pending;
        entry.retry_after = Some(retry_after);
        let snapshot = entry.value().clone();
        drop(entry);
        let _ = self.changes.send(ChangeEvent::Modify(snapshot));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
