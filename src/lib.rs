//! Streamer — an async request-processing fabric for serverless platforms
//! whose request/response front door enforces a hard timeout (≈29s) on
//! inbound connections.
//!
//! Requests arrive over a persistent socket (a managed gateway), get
//! acknowledged within the inbound budget, and long-running work is driven
//! to completion out-of-band while progress streams back to the originating
//! socket. Three subsystems do the work: the [`router::Router`] classifies
//! and dispatches, the [`executor::Executor`] drains the durable queue and
//! runs handlers, and the [`notifier::Notifier`]/[`reporter::ProgressReporter`]
//! pair delivers progress and results back to the client.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use streamer::{
//!     config::Config, executor::Executor, handler::HandlerRegistry,
//!     notifier::Notifier, queue::InMemoryRequestQueue,
//!     registry::InMemoryConnectionRegistry, router::Router, metrics::NoopMetrics,
//! };
//!
//! let config = Arc::new(Config::default());
//! let registry = InMemoryConnectionRegistry::new_shared();
//! let queue = InMemoryRequestQueue::new_shared();
//! let handlers = HandlerRegistry::builder().build();
//! let metrics = Arc::new(NoopMetrics);
//! let router = Router::new(registry, queue, handlers, metrics, config);
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod notifier;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod reporter;
pub mod router;

pub use auth::{Authenticator, Identity};
pub use config::Config;
pub use error::{ErrorCode, RetryInfo, StreamerError};
pub use executor::Executor;
pub use handler::{Handler, HandlerContext, HandlerRegistry};
pub use metrics::{Metrics, NoopMetrics, TracingMetrics};
pub use notifier::{GatewaySendError, GatewaySender, Notifier};
pub use protocol::{AckStatus, RequestFrame, ResponseFrame};
pub use queue::{AsyncRequest, ChangeEvent, InMemoryRequestQueue, RequestQueue, RequestStatus};
pub use registry::{Connection, ConnectionRegistry, InMemoryConnectionRegistry};
pub use reporter::ProgressReporter;
pub use router::Router;
