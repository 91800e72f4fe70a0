use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings, loadable from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub client: ClientOptions,
    pub worker: WorkerOptions,
    pub influx: Option<InfluxOptions>,
}

impl TraceConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("read config {} failed: {}", path.display(), e))?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Per-address TCP connect timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Offer h2 through ALPN on TLS connections.
    pub http2: bool,
    /// Extra PEM root certificates; the webpki roots are used when unset.
    pub certificate_path: Option<PathBuf>,
    pub skip_certificate_validate: bool,
    pub pool_idle_timeout_ms: Option<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Some(10_000),
            http2: false,
            certificate_path: None,
            skip_certificate_validate: false,
            pool_idle_timeout_ms: Some(90_000),
        }
    }
}

impl ClientOptions {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn pool_idle_timeout(&self) -> Option<Duration> {
        self.pool_idle_timeout_ms.map(Duration::from_millis)
    }
}

/// Which instant a metric point is stamped with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// When the worker writes the point.
    #[default]
    Delivery,
    /// When the request's trace was finished.
    Capture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Database every batch is written to.
    pub database: String,
    pub queue_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub measurement: String,
    pub timestamp_source: TimestampSource,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            database: String::from("traceview"),
            queue_capacity: 1024,
            shutdown_grace_ms: 5_000,
            measurement: String::from("traceview"),
            timestamp_source: TimestampSource::Delivery,
        }
    }
}

impl WorkerOptions {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxOptions {
    /// Base URL of the InfluxDB HTTP API, like http://127.0.0.1:8086
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}
