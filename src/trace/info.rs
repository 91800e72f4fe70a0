use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle timings of one outbound request attempt.
///
/// Every timestamp is an offset in milliseconds from the moment the request
/// was built. Zero means the milestone never fired, and zero-valued fields are
/// left out of the JSON encoding.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Connection acquisition started.
    #[serde(skip_serializing_if = "is_zero")]
    pub conn_build_time: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub dns_query_start_time: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub dns_query_end_time: f64,
    /// The DNS lookup was merged with one already in flight for the same host.
    #[serde(skip_serializing_if = "is_false")]
    pub is_concurrently: bool,
    /// Connection acquired, either freshly dialed or taken from the pool.
    #[serde(skip_serializing_if = "is_zero")]
    pub connection_build_time: f64,
    #[serde(rename = "dail_time", skip_serializing_if = "is_zero")]
    pub dial_time: f64,
    #[serde(rename = "dail_info", skip_serializing_if = "String::is_empty")]
    pub dial_info: String,
    #[serde(rename = "tls_shake_start", skip_serializing_if = "is_zero")]
    pub tls_handshake_start: f64,
    #[serde(rename = "tls_shake_end", skip_serializing_if = "is_zero")]
    pub tls_handshake_end: f64,
    #[serde(skip_serializing_if = "is_false")]
    pub tls_resumed: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub is_reused: bool,
    /// Addresses returned by the DNS lookup.
    #[serde(rename = "remote_address", skip_serializing_if = "Vec::is_empty")]
    pub resolved_addresses: Vec<String>,
    /// Peer address of the connection the request actually went out on.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub peer_address: String,
    #[serde(skip_serializing_if = "is_false")]
    pub is_idle: bool,
    #[serde(rename = "request_header_write_time", skip_serializing_if = "is_zero")]
    pub headers_written_time: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub request_write_time: f64,
    #[serde(skip)]
    pub finished_at: Option<DateTime<Utc>>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl TraceInfo {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Value of the `remoteaddress` tag: the connected peer, or the first
    /// resolved address when no connection was made.
    pub fn remote_address(&self) -> Option<&str> {
        if !self.peer_address.is_empty() {
            return Some(self.peer_address.as_str());
        }
        self.resolved_addresses
            .first()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn dns_duration(&self) -> Option<f64> {
        span(self.dns_query_start_time, self.dns_query_end_time)
    }

    pub fn tls_duration(&self) -> Option<f64> {
        span(self.tls_handshake_start, self.tls_handshake_end)
    }

    /// From acquisition start until a connection was in hand.
    pub fn acquire_duration(&self) -> Option<f64> {
        span(self.conn_build_time, self.connection_build_time)
    }
}

fn span(start: f64, end: f64) -> Option<f64> {
    (end > 0.0 && end >= start).then(|| end - start)
}

impl fmt::Display for TraceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nTime breakdown ({}):", self.hostname)?;

        match self.dns_duration() {
            Some(dns) if self.is_concurrently => {
                writeln!(f, "  DNS lookup:      {:>8.2} ms (coalesced)", dns)?
            }
            Some(dns) => writeln!(f, "  DNS lookup:      {:>8.2} ms", dns)?,
            None => writeln!(f, "  DNS lookup:      N/A")?,
        }

        if self.dial_time > 0.0 {
            writeln!(f, "  Dial start:      {:>8.2} ms  {}", self.dial_time, self.dial_info)?;
        } else {
            writeln!(f, "  Dial start:      N/A")?;
        }

        match self.tls_duration() {
            Some(tls) if self.tls_resumed => {
                writeln!(f, "  TLS handshake:   {:>8.2} ms (resumed)", tls)?
            }
            Some(tls) => writeln!(f, "  TLS handshake:   {:>8.2} ms", tls)?,
            None => writeln!(f, "  TLS handshake:   N/A")?,
        }

        match self.acquire_duration() {
            Some(acquire) => writeln!(
                f,
                "  Connection:      {:>8.2} ms  peer={} reused={} idle={}",
                acquire,
                self.remote_address().unwrap_or("-"),
                self.is_reused,
                self.is_idle
            )?,
            None => writeln!(f, "  Connection:      N/A")?,
        }

        if self.headers_written_time > 0.0 {
            writeln!(f, "  Headers written: {:>8.2} ms", self.headers_written_time)?;
        } else {
            writeln!(f, "  Headers written: N/A")?;
        }

        Ok(())
    }
}
