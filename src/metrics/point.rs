use crate::trace::info::TraceInfo;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const MEASUREMENT: &str = "traceview";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Bool(bool),
    Str(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

/// One timestamped, tagged, multi-field sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    /// Maps a finished trace onto the `traceview` field and tag names.
    ///
    /// Every field is written even when zero so the series keeps a stable
    /// schema. Tags with an empty value are left out.
    pub fn from_trace(measurement: &str, info: &TraceInfo, timestamp: DateTime<Utc>) -> Self {
        let mut tags = BTreeMap::new();
        if !info.hostname.is_empty() {
            tags.insert("hostname".to_string(), info.hostname.clone());
        }
        if let Some(remote) = info.remote_address() {
            tags.insert("remoteaddress".to_string(), remote.to_string());
        }

        let pairs: [(&str, FieldValue); 12] = [
            ("dns.start", info.dns_query_start_time.into()),
            ("dns.done", info.dns_query_end_time.into()),
            ("conn.build", info.conn_build_time.into()),
            ("concurrent", info.is_concurrently.into()),
            ("conn.connected", info.connection_build_time.into()),
            ("dail.start", info.dial_time.into()),
            ("dail.info", info.dial_info.as_str().into()),
            ("tls.start", info.tls_handshake_start.into()),
            ("tls.done", info.tls_handshake_end.into()),
            ("reused", info.is_reused.into()),
            ("idle", info.is_idle.into()),
            ("request.header", info.headers_written_time.into()),
        ];
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        Self {
            measurement: measurement.to_string(),
            tags,
            fields,
            timestamp,
        }
    }

    /// InfluxDB line protocol with a millisecond timestamp.
    pub fn to_line(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (k, v) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(k, &[',', '=', ' ']),
                escape(v, &[',', '=', ' '])
            );
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    FieldValue::Float(f) => f.to_string(),
                    FieldValue::Bool(b) => b.to_string(),
                    FieldValue::Str(s) => format!("\"{}\"", escape(s, &['"'])),
                };
                format!("{}={}", escape(k, &[',', '=', ' ']), value)
            })
            .collect();
        let _ = write!(
            line,
            " {} {}",
            fields.join(","),
            self.timestamp.timestamp_millis()
        );
        line
    }
}

fn escape(input: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Points sent in a single backend write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPoints {
    pub database: String,
    pub points: Vec<Point>,
}

impl BatchPoints {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            points: Vec::new(),
        }
    }

    pub fn add_point(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn precision(&self) -> &'static str {
        "ms"
    }

    pub fn to_line_protocol(&self) -> String {
        self.points
            .iter()
            .map(Point::to_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
