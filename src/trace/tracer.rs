use crate::metrics::worker::TraceSink;
use crate::trace::info::TraceInfo;
use chrono::Utc;
use std::error::Error as StdError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

tokio::task_local! {
    static ACTIVE_TRACER: LifecycleTracer;
}

/// Observer for one request's connection lifecycle.
///
/// Cloning is cheap and every clone writes into the same [`TraceInfo`]. The
/// record lives behind a mutex until [`finish`](Self::finish) moves it out,
/// after which callbacks are only logged.
#[derive(Clone)]
pub struct LifecycleTracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    start: Instant,
    record: Mutex<Option<TraceInfo>>,
    sink: Option<TraceSink>,
}

impl std::fmt::Debug for LifecycleTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleTracer")
            .field("start", &self.inner.start)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl LifecycleTracer {
    pub fn new(hostname: impl Into<String>, sink: Option<TraceSink>) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                start: Instant::now(),
                record: Mutex::new(Some(TraceInfo::new(hostname))),
                sink,
            }),
        }
    }

    pub fn start(&self) -> Instant {
        self.inner.start
    }

    // Never exactly zero: a fired milestone must not look like a missing one.
    fn elapsed_ms(&self) -> f64 {
        (self.inner.start.elapsed().as_secs_f64() * 1000.0).max(0.001)
    }

    fn record<F>(&self, milestone: &str, f: F)
    where
        F: FnOnce(&mut TraceInfo),
    {
        let mut guard = self
            .inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(info) => f(info),
            None => trace!("{} fired after the trace was finished", milestone),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Copy of the record as captured so far.
    pub fn snapshot(&self) -> Option<TraceInfo> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_conn(&self, host: &str) {
        let now = self.elapsed_ms();
        debug!("start conn : [{}] timestamp : [{:.3}ms]", host, now);
        self.record("get_conn", |info| {
            if info.hostname.is_empty() {
                info.hostname = host.to_string();
            }
            if info.conn_build_time == 0.0 {
                info.conn_build_time = now;
            }
        });
    }

    pub fn got_conn(&self, remote_addr: SocketAddr, reused: bool, was_idle: bool) {
        let now = self.elapsed_ms();
        debug!(
            "remote address : [{}] reused : [{}] isIdle : [{}] timestamp : [{:.3}ms]",
            remote_addr, reused, was_idle, now
        );
        self.record("got_conn", |info| {
            info.connection_build_time = now;
            info.peer_address = remote_addr.to_string();
            info.is_reused = reused;
            info.is_idle = was_idle;
        });
    }

    /// The connection went back to the pool (or could not). There is no
    /// field for this in the record, so it is only logged.
    pub fn put_idle_conn(&self, err: Option<&dyn StdError>) {
        let now = self.elapsed_ms();
        match err {
            Some(e) => debug!(
                "put connection back failed : [{}] timestamp : [{:.3}ms]",
                e, now
            ),
            None => debug!("put connection back success : [{:.3}ms]", now),
        }
    }

    pub fn dns_start(&self, host: &str) {
        let now = self.elapsed_ms();
        debug!("start query dns : [{}] timestamp : [{:.3}ms]", host, now);
        self.record("dns_start", |info| {
            if info.dns_query_start_time == 0.0 {
                info.dns_query_start_time = now;
            }
        });
    }

    pub fn dns_done(&self, addrs: &[SocketAddr], coalesced: bool, err: Option<&dyn StdError>) {
        let now = self.elapsed_ms();
        if let Some(e) = err {
            debug!("query dns error : [{}] timestamp : [{:.3}ms]", e, now);
        } else {
            debug!(
                "query dns done : {:?} isConcurrently : [{}] timestamp : [{:.3}ms]",
                addrs, coalesced, now
            );
        }
        self.record("dns_done", |info| {
            info.dns_query_end_time = now;
            info.is_concurrently = coalesced;
            info.resolved_addresses = addrs.iter().map(SocketAddr::to_string).collect();
        });
    }

    pub fn connect_start(&self, network: &str, addr: SocketAddr) {
        let now = self.elapsed_ms();
        debug!(
            "build connect : [{}] address : [{}] timestamp : [{:.3}ms]",
            network, addr, now
        );
        self.record("connect_start", |info| {
            if info.dial_time == 0.0 {
                info.dial_time = now;
            }
        });
    }

    pub fn connect_done(&self, network: &str, addr: SocketAddr, err: Option<&dyn StdError>) {
        let now = self.elapsed_ms();
        let outcome = match err {
            Some(e) => format!("{} {} failed: {}", network, addr, e),
            None => format!("{} {} connected", network, addr),
        };
        debug!("dial : [{}] timestamp : [{:.3}ms]", outcome, now);
        self.record("connect_done", |info| {
            if err.is_none() {
                info.peer_address = addr.to_string();
            }
            info.dial_info = outcome;
        });
    }

    pub fn tls_handshake_start(&self) {
        let now = self.elapsed_ms();
        debug!("tls hand shake start : [{:.3}ms]", now);
        self.record("tls_handshake_start", |info| {
            if info.tls_handshake_start == 0.0 {
                info.tls_handshake_start = now;
            }
        });
    }

    pub fn tls_handshake_done(&self, resumed: bool, err: Option<&dyn StdError>) {
        let now = self.elapsed_ms();
        match err {
            Some(e) => debug!("tls shake done with failed : [{}] timestamp : [{:.3}ms]", e, now),
            None => debug!(
                "tls hand shake done with success : resumed : [{}] timestamp : [{:.3}ms]",
                resumed, now
            ),
        }
        self.record("tls_handshake_done", |info| {
            info.tls_handshake_end = now;
            info.tls_resumed = resumed && err.is_none();
        });
    }

    pub fn wrote_headers(&self) {
        let now = self.elapsed_ms();
        self.record("wrote_headers", |info| {
            if info.headers_written_time == 0.0 {
                trace!("request header is write finished timestamp : [{:.3}ms]", now);
                info.headers_written_time = now;
            }
        });
    }

    pub fn wrote_request(&self, err: Option<&dyn StdError>) {
        let now = self.elapsed_ms();
        if let Some(e) = err {
            debug!("request write failed : [{}] timestamp : [{:.3}ms]", e, now);
        }
        self.record("wrote_request", |info| {
            if info.request_write_time == 0.0 {
                trace!("request write finished timestamp : [{:.3}ms]", now);
                info.request_write_time = now;
            }
        });
    }

    /// Closes the record and hands it to the delivery queue.
    ///
    /// Runs at most once; later calls return `None`. Without a sink the
    /// record is returned to the caller instead.
    pub fn finish(&self) -> Option<TraceInfo> {
        let mut info = self
            .inner
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        info.finished_at = Some(Utc::now());
        debug!(
            "trace finished for [{}] after [{:.3}ms]",
            info.hostname,
            self.elapsed_ms()
        );
        match &self.inner.sink {
            Some(sink) => {
                sink.deliver(info);
                None
            }
            None => Some(info),
        }
    }
}

/// Runs `fut` with `tracer` visible to the shared resolver and connector.
pub(crate) async fn scope<F>(tracer: Option<LifecycleTracer>, fut: F) -> F::Output
where
    F: Future,
{
    match tracer {
        Some(tracer) => ACTIVE_TRACER.scope(tracer, fut).await,
        None => fut.await,
    }
}

/// Calls `f` with the tracer of the request being executed on this task, if any.
pub(crate) fn with_active<F>(f: F)
where
    F: FnOnce(&LifecycleTracer),
{
    let _ = ACTIVE_TRACER.try_with(f);
}
