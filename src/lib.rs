//! Connection-lifecycle tracing for outbound HTTP requests.
//!
//! A [`TracedClient`] attaches a [`LifecycleTracer`] to each request it
//! builds. While hyper executes the request, the resolver, connector and body
//! hooks write DNS/dial/TLS/pool timings into a per-request [`TraceInfo`].
//! When the request concludes, the record is moved onto a bounded delivery
//! queue that a [`TraceWorker`] drains into a metrics backend.
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod tls;
pub mod trace;

pub use crate::config::{ClientOptions, InfluxOptions, TimestampSource, TraceConfig, WorkerOptions};
pub use crate::error::Error;
pub use crate::http::body::{RequestBody, ResponseBody};
pub use crate::http::client::{CancelGuard, RequestContext, TracedClient, TracedClientBuilder};
pub use crate::metrics::backend::{BackendError, InfluxHttpBackend, MetricsBackend};
pub use crate::metrics::point::{BatchPoints, FieldValue, Point};
pub use crate::metrics::worker::{spawn_trace_worker, TraceSink, TraceWorker, TraceWorkerHandle};
pub use crate::trace::info::TraceInfo;
pub use crate::trace::tracer::LifecycleTracer;
