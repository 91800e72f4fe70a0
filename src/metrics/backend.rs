use crate::config::{ClientOptions, InfluxOptions};
use crate::metrics::point::BatchPoints;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("build write request failed: {0}")]
    Request(String),
    #[error("post data to influxdb failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("read influxdb response failed: {0}")]
    Body(#[from] hyper::Error),
    #[error("influxdb write timed out after {0:?}")]
    Timeout(Duration),
    #[error("influxdb answered {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// Destination for metric points.
///
/// The trace worker is the only caller, one batch at a time, but
/// implementations must still be shareable across tasks.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn write(&self, batch: BatchPoints) -> Result<(), BackendError>;
}

#[async_trait]
impl<B> MetricsBackend for Arc<B>
where
    B: MetricsBackend + ?Sized,
{
    async fn write(&self, batch: BatchPoints) -> Result<(), BackendError> {
        (**self).write(batch).await
    }
}

/// Writes batches to the InfluxDB 1.x `/write` endpoint as line protocol.
#[derive(Clone)]
pub struct InfluxHttpBackend {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    write_url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl InfluxHttpBackend {
    pub fn new(options: &InfluxOptions) -> Result<Self, anyhow::Error> {
        let write_url = Url::parse(&format!("{}/write", options.url.trim_end_matches('/')))?;
        ensure!(
            matches!(write_url.scheme(), "http" | "https"),
            "unsupported influxdb scheme: {}",
            write_url.scheme()
        );

        let tls_config = crate::tls::client_config(&ClientOptions::default())?;
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);
        let client = Client::builder(TokioExecutor::new()).build(https_connector);

        Ok(Self {
            client,
            write_url,
            username: options.username.clone(),
            password: options.password.clone(),
        })
    }

    /// Full write URL for `batch`, with database, precision and credentials.
    pub fn url_for(&self, batch: &BatchPoints) -> Url {
        let mut url = self.write_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("db", &batch.database)
                .append_pair("precision", batch.precision());
            if let Some(username) = self.username.as_deref() {
                query.append_pair("u", username);
            }
            if let Some(password) = self.password.as_deref() {
                query.append_pair("p", password);
            }
        }
        url
    }
}

#[async_trait]
impl MetricsBackend for InfluxHttpBackend {
    async fn write(&self, batch: BatchPoints) -> Result<(), BackendError> {
        if batch.points.is_empty() {
            return Ok(());
        }
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.url_for(&batch).as_str())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(USER_AGENT, concat!("traceview/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(batch.to_line_protocol())))
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let res = timeout(WRITE_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| BackendError::Timeout(WRITE_TIMEOUT))??;

        let status = res.status();
        if status.is_success() {
            trace!("influxdb accepted {} point(s)", batch.points.len());
            return Ok(());
        }
        let body = res.into_body().collect().await?.to_bytes();
        Err(BackendError::Status {
            status,
            body: String::from_utf8_lossy(&body).trim().to_string(),
        })
    }
}
