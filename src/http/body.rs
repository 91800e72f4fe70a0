use crate::trace::tracer::LifecycleTracer;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Request body that tells its tracer when hyper has started and finished
/// writing the request.
///
/// hyper checks `is_end_stream` before polling, so an empty body reports
/// both milestones from there.
#[derive(Debug, Default)]
pub struct RequestBody {
    inner: Full<Bytes>,
    tracer: Option<LifecycleTracer>,
}

impl RequestBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Full::new(data.into()),
            tracer: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&mut self, tracer: LifecycleTracer) {
        self.tracer = Some(tracer);
    }

    pub fn is_traced(&self) -> bool {
        self.tracer.is_some()
    }

    fn wrote_all(&self) {
        if let Some(tracer) = &self.tracer {
            tracer.wrote_headers();
            tracer.wrote_request(None);
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<String> for RequestBody {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for RequestBody {
    fn from(data: &'static str) -> Self {
        Self::new(data)
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(tracer) = &this.tracer {
            tracer.wrote_headers();
        }
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.wrote_all(),
            Poll::Ready(Some(_)) if this.inner.is_end_stream() => this.wrote_all(),
            _ => {}
        }
        polled
    }

    // hyper may ask before the head is flushed, so for empty bodies both
    // milestones are approximate.
    fn is_end_stream(&self) -> bool {
        let ended = self.inner.is_end_stream();
        if ended {
            self.wrote_all();
        }
        ended
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body passed through unchanged. Reports the connection going back
/// to the pool once the stream ends or fails.
#[derive(Debug)]
pub struct ResponseBody {
    inner: Incoming,
    tracer: Option<LifecycleTracer>,
    released: bool,
}

impl ResponseBody {
    pub(crate) fn new(inner: Incoming, tracer: Option<LifecycleTracer>) -> Self {
        Self {
            inner,
            tracer,
            released: false,
        }
    }

    fn release(&mut self, err: Option<&dyn StdError>) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(tracer) = &self.tracer {
            tracer.put_idle_conn(err);
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.release(None);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.release(Some(&e));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Ok(frame))) => {
                if this.inner.is_end_stream() {
                    this.release(None);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if self.inner.is_end_stream() {
            self.release(None);
        }
    }
}
