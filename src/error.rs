use std::time::Duration;

/// Errors surfaced to callers of [`TracedClient`](crate::TracedClient).
///
/// Problems in the telemetry path (callbacks, metric writes) never show up
/// here; they are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The method, URL or body could not be turned into a request.
    #[error("build request failed: {0}")]
    RequestConstruction(String),

    /// The lifecycle tracer could not be attached to the request context.
    #[error("attach trace to request failed: {0}")]
    TraceAttachment(String),

    /// The transport failed. The hyper-util error is kept untouched.
    #[error(transparent)]
    Transport(#[from] hyper_util::client::legacy::Error),

    /// The request context's deadline expired before a response arrived.
    #[error("context deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The request context was cancelled by its guard.
    #[error("context canceled")]
    Cancelled,

    /// The background task running a deadline-bound request panicked or
    /// was aborted.
    #[error("background execution failed: {0}")]
    Background(String),

    /// Client options could not be applied.
    #[error("invalid configuration: {0}")]
    Config(#[source] anyhow::Error),
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::RequestConstruction(e.to_string())
    }
}

impl Error {
    /// True for the deadline variant, the analogue of a context deadline error.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Error::DeadlineExceeded(_))
    }
}
