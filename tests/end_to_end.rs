//! End-to-end scenarios covering the router, executor, and notifier working together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use streamer::{
    Config, Connection, ConnectionRegistry, Executor, GatewaySendError, GatewaySender, Handler,
    HandlerContext, HandlerRegistry, InMemoryConnectionRegistry, InMemoryRequestQueue,
    Notifier, NoopMetrics, RequestQueue, RequestStatus, ResponseFrame, Router, StreamerError,
};

struct RecordingGateway {
    frames: Arc<std::sync::Mutex<Vec<Value>>>,
    gone_once_for: Option<&'static str>,
    fail_for: Option<&'static str>,
}

#[async_trait]
impl GatewaySender for RecordingGateway {
    async fn send(&self, endpoint: &str, bytes: Vec<u8>) -> Result<(), GatewaySendError> {
        if self.gone_once_for == Some(endpoint) {
            return Err(GatewaySendError::Gone);
        }
        if self.fail_for == Some(endpoint) {
            return Err(GatewaySendError::Gone);
        }
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        self.frames.lock().unwrap().push(value);
        Ok(())
    }
}

async fn make_connection(registry: &dyn ConnectionRegistry, id: &str, endpoint: &str) {
    registry
        .save(Connection::new(
            id,
            "u1",
            "t1",
            endpoint,
            Duration::from_secs(3600),
            streamer::registry::now_secs(),
        ))
        .await;
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    fn validate(&self, _req: &streamer::AsyncRequest) -> Result<(), StreamerError> {
        Ok(())
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(100)
    }
    async fn process(
        &self,
        _ctx: &HandlerContext,
        req: &streamer::AsyncRequest,
    ) -> Result<Value, StreamerError> {
        Ok(req.payload.clone())
    }
}

#[tokio::test]
async fn scenario_1_sync_echo() {
    let registry = InMemoryConnectionRegistry::new_shared();
    make_connection(registry.as_ref(), "c1", "ep1").await;
    let queue = InMemoryRequestQueue::new_shared();
    let handlers = HandlerRegistry::builder()
        .register("echo", Arc::new(EchoHandler))
        .build();
    let router = Router::new(
        registry,
        queue.clone(),
        handlers,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    );

    let frame = json!({"id": "r1", "action": "echo", "payload": {"m": "hi"}});
    let resp = router
        .route("c1", frame.to_string().as_bytes(), Duration::from_secs(29))
        .await;

    match resp {
        ResponseFrame::Result { data, .. } => assert_eq!(data, json!({"m": "hi"})),
        other => panic!("expected result frame, got {other:?}"),
    }
    assert!(queue.get("r1").await.is_none(), "sync path must not write the queue");
}

struct ProgressHandler;

#[async_trait]
impl Handler for ProgressHandler {
    fn validate(&self, _req: &streamer::AsyncRequest) -> Result<(), StreamerError> {
        Ok(())
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(120)
    }
    fn supports_progress(&self) -> bool {
        true
    }
    async fn process(
        &self,
        _ctx: &HandlerContext,
        _req: &streamer::AsyncRequest,
    ) -> Result<Value, StreamerError> {
        unreachable!("async path always calls process_with_progress when supported")
    }
    async fn process_with_progress(
        &self,
        _ctx: &HandlerContext,
        _req: &streamer::AsyncRequest,
        reporter: &streamer::ProgressReporter,
    ) -> Result<Value, StreamerError> {
        reporter.report(10, "q", None).await;
        reporter.report(30, "q2", None).await;
        reporter.report(60, "p", None).await;
        Ok(json!({"url": "u"}))
    }
}

#[tokio::test]
async fn scenario_2_async_report_with_progress() {
    let registry = InMemoryConnectionRegistry::new_shared();
    make_connection(registry.as_ref(), "c1", "ep1").await;
    let queue = InMemoryRequestQueue::new_shared();
    let handlers = HandlerRegistry::builder()
        .register("report", Arc::new(ProgressHandler))
        .build();

    let frames = Arc::new(std::sync::Mutex::new(Vec::new()));
    let gateway = Arc::new(RecordingGateway {
        frames: frames.clone(),
        gone_once_for: None,
        fail_for: None,
    });
    let notifier = Arc::new(Notifier::new(
        registry.clone(),
        gateway,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));

    let router = Router::new(
        registry,
        queue.clone(),
        handlers.clone(),
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    );
    let executor = Arc::new(Executor::new(
        queue.clone(),
        handlers,
        notifier,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let exec_handle = executor.clone().run();

    let frame = json!({"id": "r1", "action": "report", "payload": {}});
    let resp = router
        .route("c1", frame.to_string().as_bytes(), Duration::from_secs(29))
        .await;
    assert!(matches!(resp, ResponseFrame::Ack { .. }));

    for _ in 0..100 {
        if let Some(r) = queue.get("r1").await {
            if r.status == RequestStatus::Completed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let final_req = queue.get("r1").await.unwrap();
    assert_eq!(final_req.status, RequestStatus::Completed);

    let sent = frames.lock().unwrap().clone();
    let progress_frames: Vec<&Value> = sent.iter().filter(|f| f["type"] == "progress").collect();
    assert!(!progress_frames.is_empty());
    let mut last_pct = -1i64;
    for f in &progress_frames {
        let pct = f["percentage"].as_i64().unwrap();
        assert!(pct >= last_pct, "progress must be monotonically non-decreasing");
        last_pct = pct;
    }
    let result_frame = sent.iter().find(|f| f["type"] == "result").unwrap();
    assert_eq!(result_frame["data"]["url"], "u");

    exec_handle.abort();
}

struct FlakyThenOkHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl Handler for FlakyThenOkHandler {
    fn validate(&self, _req: &streamer::AsyncRequest) -> Result<(), StreamerError> {
        Ok(())
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(50)
    }
    async fn process(
        &self,
        _ctx: &HandlerContext,
        req: &streamer::AsyncRequest,
    ) -> Result<Value, StreamerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            Err(StreamerError::timeout("upstream slow"))
        } else {
            Ok(req.payload.clone())
        }
    }
}

#[tokio::test]
async fn scenario_3_retry_then_success() {
    let registry = InMemoryConnectionRegistry::new_shared();
    make_connection(registry.as_ref(), "c1", "ep1").await;
    let queue = InMemoryRequestQueue::new_shared();
    let handlers = HandlerRegistry::builder()
        .register(
            "flaky",
            Arc::new(FlakyThenOkHandler {
                calls: AtomicUsize::new(0),
            }),
        )
        .build();
    let gateway = Arc::new(RecordingGateway {
        frames: Arc::new(std::sync::Mutex::new(Vec::new())),
        gone_once_for: None,
        fail_for: None,
    });
    let notifier = Arc::new(Notifier::new(
        registry,
        gateway,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let executor = Arc::new(Executor::new(
        queue.clone(),
        handlers,
        notifier,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let handle = executor.clone().run();

    let req = streamer::AsyncRequest::new("r1", "c1", "u1", "t1", "flaky", json!({"v": 1}), 3, 3600);
    queue.enqueue(req).await.unwrap();

    for _ in 0..400 {
        if let Some(r) = queue.get("r1").await {
            if r.status == RequestStatus::Completed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let final_req = queue.get("r1").await.unwrap();
    assert_eq!(final_req.status, RequestStatus::Completed);
    assert_eq!(final_req.retry_count, 1);
    handle.abort();
}

struct ValidationFailingHandler;

#[async_trait]
impl Handler for ValidationFailingHandler {
    fn validate(&self, _req: &streamer::AsyncRequest) -> Result<(), StreamerError> {
        Ok(())
    }
    fn estimated_duration(&self) -> Duration {
        Duration::from_millis(50)
    }
    async fn process(
        &self,
        _ctx: &HandlerContext,
        _req: &streamer::AsyncRequest,
    ) -> Result<Value, StreamerError> {
        Err(StreamerError::validation("bad field"))
    }
}

#[tokio::test]
async fn scenario_4_non_retryable_failure() {
    let registry = InMemoryConnectionRegistry::new_shared();
    make_connection(registry.as_ref(), "c1", "ep1").await;
    let queue = InMemoryRequestQueue::new_shared();
    let handlers = HandlerRegistry::builder()
        .register("bad", Arc::new(ValidationFailingHandler))
        .build();
    let frames = Arc::new(std::sync::Mutex::new(Vec::new()));
    let gateway = Arc::new(RecordingGateway {
        frames: frames.clone(),
        gone_once_for: None,
        fail_for: None,
    });
    let notifier = Arc::new(Notifier::new(
        registry,
        gateway,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let executor = Arc::new(Executor::new(
        queue.clone(),
        handlers,
        notifier,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let handle = executor.clone().run();

    let req = streamer::AsyncRequest::new("r1", "c1", "u1", "t1", "bad", json!({}), 3, 3600);
    queue.enqueue(req).await.unwrap();

    for _ in 0..100 {
        if let Some(r) = queue.get("r1").await {
            if r.status == RequestStatus::Failed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let final_req = queue.get("r1").await.unwrap();
    assert_eq!(final_req.status, RequestStatus::Failed);
    assert_eq!(final_req.retry_count, 0);

    let sent = frames.lock().unwrap().clone();
    let error_frame = sent.iter().find(|f| f["type"] == "error").unwrap();
    assert_eq!(error_frame["code"], "VALIDATION_ERROR");
    handle.abort();
}

#[tokio::test]
async fn scenario_5_gone_endpoint_request_still_completes() {
    let registry = InMemoryConnectionRegistry::new_shared();
    make_connection(registry.as_ref(), "c1", "ep-gone").await;
    let queue = InMemoryRequestQueue::new_shared();
    let handlers = HandlerRegistry::builder()
        .register("echo", Arc::new(EchoHandler))
        .build();
    let gateway = Arc::new(RecordingGateway {
        frames: Arc::new(std::sync::Mutex::new(Vec::new())),
        gone_once_for: Some("ep-gone"),
        fail_for: None,
    });
    let notifier = Arc::new(Notifier::new(
        registry.clone(),
        gateway,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let executor = Arc::new(Executor::new(
        queue.clone(),
        handlers,
        notifier,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    ));
    let handle = executor.clone().run();

    let req = streamer::AsyncRequest::new("r1", "c1", "u1", "t1", "echo", json!({"v": 1}), 3, 3600);
    queue.enqueue(req).await.unwrap();

    for _ in 0..100 {
        if let Some(r) = queue.get("r1").await {
            if r.status == RequestStatus::Completed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let final_req = queue.get("r1").await.unwrap();
    assert_eq!(final_req.status, RequestStatus::Completed, "persisted status is authoritative even if delivery failed");
    assert!(registry.get("c1").await.is_none(), "gone endpoint evicts the connection");
    handle.abort();
}

#[tokio::test]
async fn scenario_6_broadcast_partial_failure() {
    let registry = InMemoryConnectionRegistry::new_shared();
    make_connection(registry.as_ref(), "c1", "ep1").await;
    make_connection(registry.as_ref(), "c2", "ep-gone").await;
    make_connection(registry.as_ref(), "c3", "ep3").await;

    let frames = Arc::new(std::sync::Mutex::new(Vec::new()));
    let gateway = Arc::new(RecordingGateway {
        frames: frames.clone(),
        gone_once_for: None,
        fail_for: Some("ep-gone"),
    });
    let notifier = Notifier::new(
        registry.clone(),
        gateway,
        Arc::new(NoopMetrics),
        Arc::new(Config::default()),
    );

    let outcome = notifier
        .broadcast(&["c1".into(), "c2".into(), "c3".into()], b"{\"hello\":true}")
        .await;

    assert_eq!(outcome.succeeded.len(), 2);
    assert!(outcome.failed.contains_key("c2"));
    assert!(registry.get("c2").await.is_none());
    assert!(registry.get("c1").await.is_some());
    assert!(registry.get("c3").await.is_some());
}
