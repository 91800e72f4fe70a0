use crate::config::ClientOptions;
use crate::error::Error;
use crate::http::body::{RequestBody, ResponseBody};
use crate::http::tracing_connector::{ConnMeta, TracingConnector};
use crate::http::tracing_resolver::TracingResolver;
use crate::metrics::worker::TraceSink;
use crate::trace::tracer::{self, LifecycleTracer};
use bytes::Bytes;
use http::header::{HeaderValue, USER_AGENT};
use http::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::{capture_connection, CaptureConnection, Connected};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_USER_AGENT: &str = concat!("traceview/", env!("CARGO_PKG_VERSION"));

/// Per-request execution context, stored in the request's extensions.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    tracer: Option<LifecycleTracer>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn tracer(&self) -> Option<&LifecycleTracer> {
        self.tracer.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn of<B>(req: &Request<B>) -> Self {
        req.extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default()
    }
}

/// Cancels a deadline-bound request context when dropped.
///
/// Bind it to a named variable: `let (req, _) = ...` cancels at once.
#[derive(Debug)]
#[must_use = "dropping the guard cancels the request context"]
pub struct CancelGuard {
    token: CancellationToken,
}

impl CancelGuard {
    pub fn cancel(self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// Finishes the trace when the request future is dropped before completing.
struct FinishOnDrop(LifecycleTracer);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        if self.0.is_finished() {
            return;
        }
        match self.0.finish() {
            Some(_) => debug!("trace of an abandoned request discarded, no sink configured"),
            None => debug!("partial trace of an abandoned request delivered"),
        }
    }
}

// Counts an untraced checkout on the pooled connection, so a later traced
// request on the same connection sees it as reused.
struct CountCheckout(CaptureConnection);

impl Drop for CountCheckout {
    fn drop(&mut self) {
        if let Some(meta) = conn_meta(&self.0.connection_metadata()) {
            meta.acquire();
        }
    }
}

#[derive(Debug, Default)]
pub struct TracedClientBuilder {
    options: ClientOptions,
    sink: Option<TraceSink>,
}

impl TracedClientBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Delivery queue finished traces are moved to. Without one, the trace
    /// is attached to the response extensions instead.
    pub fn sink(mut self, sink: TraceSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<TracedClient, Error> {
        let mut tls_config = crate::tls::client_config(&self.options).map_err(Error::Config)?;
        tls_config.alpn_protocols = if self.options.http2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };
        let connector = TracingConnector::new(
            TracingResolver::new(),
            Arc::new(tls_config),
            self.options.connect_timeout(),
        );
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.options.pool_idle_timeout())
            .pool_timer(TokioTimer::new())
            .build(connector);
        Ok(TracedClient {
            client,
            sink: self.sink,
        })
    }
}

/// HTTP client whose requests can carry a lifecycle tracer.
///
/// Traced and untraced requests share one connection pool and behave the
/// same way; tracing only observes.
#[derive(Clone)]
pub struct TracedClient {
    client: Client<TracingConnector, RequestBody>,
    sink: Option<TraceSink>,
}

impl TracedClient {
    pub fn builder() -> TracedClientBuilder {
        TracedClientBuilder::default()
    }

    pub fn new(options: &ClientOptions) -> Result<Self, Error> {
        Self::builder().options(options.clone()).build()
    }

    pub fn with_sink(options: &ClientOptions, sink: Option<TraceSink>) -> Result<Self, Error> {
        let builder = Self::builder().options(options.clone());
        match sink {
            Some(sink) => builder.sink(sink).build(),
            None => builder.build(),
        }
    }

    /// Builds an untraced request. An empty method means GET.
    pub fn new_request(
        &self,
        method: &str,
        url: &str,
        body: impl Into<Bytes>,
    ) -> Result<Request<RequestBody>, Error> {
        let method = if method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(method.as_bytes()).map_err(|e| {
                Error::RequestConstruction(format!("invalid method {:?}: {}", method, e))
            })?
        };
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::RequestConstruction(format!("invalid url {:?}: {}", url, e)))?;
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT))
            .body(RequestBody::new(body))?;
        Ok(req)
    }

    pub fn new_traced_request(
        &self,
        method: &str,
        url: &str,
        body: impl Into<Bytes>,
    ) -> Result<Request<RequestBody>, Error> {
        let mut req = self.new_request(method, url, body)?;
        self.trace_request(&mut req)?;
        Ok(req)
    }

    /// Traced request whose context expires `timeout` from now.
    pub fn new_traced_request_with_timeout(
        &self,
        method: &str,
        url: &str,
        body: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<(Request<RequestBody>, CancelGuard), Error> {
        let mut req = self.new_traced_request(method, url, body)?;
        let ctx = req
            .extensions_mut()
            .get_mut::<RequestContext>()
            .ok_or_else(|| Error::TraceAttachment("request context is missing".into()))?;
        ctx.deadline = Some(Instant::now() + timeout);
        ctx.timeout = Some(timeout);
        let guard = CancelGuard {
            token: ctx.cancel.clone(),
        };
        Ok((req, guard))
    }

    /// Attaches a fresh tracer to an existing request.
    pub fn trace_request(&self, req: &mut Request<RequestBody>) -> Result<LifecycleTracer, Error> {
        if req
            .extensions()
            .get::<RequestContext>()
            .is_some_and(|ctx| ctx.tracer.is_some())
        {
            return Err(Error::TraceAttachment(
                "request already carries a trace".into(),
            ));
        }
        let host = req
            .uri()
            .host()
            .ok_or_else(|| {
                Error::TraceAttachment(format!("url {} has no host to trace", req.uri()))
            })?
            .to_string();

        let tracer = LifecycleTracer::new(host, self.sink.clone());
        match req.extensions_mut().get_mut::<RequestContext>() {
            Some(ctx) => ctx.tracer = Some(tracer.clone()),
            None => {
                req.extensions_mut().insert(RequestContext {
                    tracer: Some(tracer.clone()),
                    ..RequestContext::default()
                });
            }
        }
        req.body_mut().attach(tracer.clone());
        Ok(tracer)
    }

    /// Sends the request through the pool, honoring its context's deadline
    /// and cancellation. Transport errors are returned as they are.
    pub async fn execute(&self, req: Request<RequestBody>) -> Result<Response<ResponseBody>, Error> {
        let ctx = RequestContext::of(&req);
        let send = self.send(req, ctx.tracer.clone());
        match ctx.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
                _ = sleep_until(deadline) => {
                    Err(Error::DeadlineExceeded(ctx.timeout.unwrap_or_default()))
                }
                res = send => res,
            },
            None => tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
                res = send => res,
            },
        }
    }

    /// Runs [`execute`](Self::execute) on its own task and races it against
    /// the context. On expiry the context is cancelled, which stops the task.
    pub async fn execute_with_deadline(
        &self,
        req: Request<RequestBody>,
    ) -> Result<Response<ResponseBody>, Error> {
        let ctx = RequestContext::of(&req);
        let Some(deadline) = ctx.deadline else {
            return self.execute(req).await;
        };
        let this = self.clone();
        let mut task = tokio::spawn(async move { this.execute(req).await });
        tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(res) => res,
                Err(e) => Err(Error::Background(e.to_string())),
            },
            _ = sleep_until(deadline) => {
                ctx.cancel.cancel();
                Err(Error::DeadlineExceeded(ctx.timeout.unwrap_or_default()))
            }
            _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn send(
        &self,
        mut req: Request<RequestBody>,
        tracer: Option<LifecycleTracer>,
    ) -> Result<Response<ResponseBody>, Error> {
        let Some(tracer) = tracer else {
            let _checkout = CountCheckout(capture_connection(&mut req));
            let res = self.client.request(req).await?;
            return Ok(res.map(|body| ResponseBody::new(body, None)));
        };

        let _finish = FinishOnDrop(tracer.clone());
        let host = req.uri().host().unwrap_or_default().to_string();
        tracer.get_conn(&host);
        let mut capture = capture_connection(&mut req);

        let (result, recorded) = tracer::scope(Some(tracer.clone()), async {
            let request = self.client.request(req);
            tokio::pin!(request);
            tokio::select! {
                res = &mut request => (res, false),
                meta = acquired_connection(&mut capture) => {
                    if let Some(meta) = &meta {
                        record_acquired(&tracer, meta);
                    }
                    (request.await, meta.is_some())
                }
            }
        })
        .await;

        if !recorded {
            if let Some(meta) = conn_meta(&capture.connection_metadata()) {
                record_acquired(&tracer, &meta);
            }
        }

        match result {
            Ok(res) => {
                let finished = tracer.finish();
                let mut res = res.map(|body| ResponseBody::new(body, Some(tracer)));
                if let Some(info) = finished {
                    res.extensions_mut().insert(info);
                }
                Ok(res)
            }
            Err(e) => {
                tracer.finish();
                Err(Error::Transport(e))
            }
        }
    }
}

fn conn_meta(connected: &Option<Connected>) -> Option<ConnMeta> {
    let mut extensions = http::Extensions::new();
    connected.as_ref()?.get_extras(&mut extensions);
    extensions.remove::<ConnMeta>()
}

async fn acquired_connection(capture: &mut CaptureConnection) -> Option<ConnMeta> {
    let connected = capture.wait_for_connection_metadata().await;
    conn_meta(&connected)
}

fn record_acquired(tracer: &LifecycleTracer, meta: &ConnMeta) {
    let reused = meta.acquire();
    tracer.got_conn(meta.remote_addr, reused, reused && !meta.negotiated_h2);
}
