use crate::http::tracing_resolver::TracingResolver;
use crate::trace::tracer;
use futures::future::BoxFuture;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use pki_types::ServerName;
use rustls::{ClientConfig, HandshakeKind};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower_service::Service;

/// Facts about a pooled connection, carried in `Connected::extra` so they
/// travel with the connection through hyper-util's pool.
#[derive(Clone, Debug)]
pub struct ConnMeta {
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub negotiated_h2: bool,
    served: Arc<AtomicUsize>,
}

impl ConnMeta {
    pub fn new(remote_addr: SocketAddr, local_addr: Option<SocketAddr>, negotiated_h2: bool) -> Self {
        Self {
            remote_addr,
            local_addr,
            negotiated_h2,
            served: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counts one more request on this connection. Returns true when the
    /// connection had carried a request before.
    pub fn acquire(&self) -> bool {
        self.served.fetch_add(1, Ordering::AcqRel) > 0
    }

    pub fn requests_served(&self) -> usize {
        self.served.load(Ordering::Acquire)
    }
}

enum Transport {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

/// Connection handed to hyper: plain TCP or rustls, plus its [`ConnMeta`].
pub struct TracedIo {
    transport: Transport,
    meta: ConnMeta,
}

impl TracedIo {
    pub fn meta(&self) -> &ConnMeta {
        &self.meta
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }
}

impl Connection for TracedIo {
    fn connected(&self) -> Connected {
        let connected = Connected::new().extra(self.meta.clone());
        if self.meta.negotiated_h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl Read for TracedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Transport::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for TracedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Transport::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_flush(cx),
            Transport::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Transport::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.transport {
            Transport::Plain(io) => io.is_write_vectored(),
            Transport::Tls(io) => io.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_write_vectored(cx, bufs),
            Transport::Tls(io) => Pin::new(io).poll_write_vectored(cx, bufs),
        }
    }
}

/// Dials connections for the pooled client and reports resolve, dial and
/// TLS milestones to the tracer of the request being executed.
#[derive(Clone)]
pub struct TracingConnector {
    resolver: TracingResolver,
    tls: TlsConnector,
    connect_timeout: Option<Duration>,
}

impl TracingConnector {
    pub fn new(
        resolver: TracingResolver,
        tls_config: Arc<ClientConfig>,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            resolver,
            tls: TlsConnector::from(tls_config),
            connect_timeout,
        }
    }

    async fn connect(self, uri: Uri) -> Result<TracedIo, anyhow::Error> {
        let is_https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") | None => false,
            Some(other) => bail!("unsupported scheme {}", other),
        };
        let host = uri
            .host()
            .ok_or(anyhow!("uri has no host: {}", uri))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let addrs: Vec<SocketAddr> = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => self
                .resolver
                .resolve(&host)
                .await?
                .into_iter()
                .map(|addr| SocketAddr::new(addr.ip(), port))
                .collect(),
        };

        let stream = self.dial(&addrs).await?;
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr().ok();

        if !is_https {
            return Ok(TracedIo {
                transport: Transport::Plain(TokioIo::new(stream)),
                meta: ConnMeta::new(remote_addr, local_addr, false),
            });
        }

        let domain = ServerName::try_from(host)
            .map_err(|e| anyhow!("{}", e))?
            .to_owned();
        tracer::with_active(|t| t.tls_handshake_start());
        match self.tls.connect(domain, stream).await {
            Ok(tls_stream) => {
                let (_, session) = tls_stream.get_ref();
                let resumed = session.handshake_kind() == Some(HandshakeKind::Resumed);
                let negotiated_h2 = session.alpn_protocol() == Some(&b"h2"[..]);
                tracer::with_active(|t| t.tls_handshake_done(resumed, None));
                Ok(TracedIo {
                    transport: Transport::Tls(TokioIo::new(tls_stream)),
                    meta: ConnMeta::new(remote_addr, local_addr, negotiated_h2),
                })
            }
            Err(e) => {
                tracer::with_active(|t| t.tls_handshake_done(false, Some(&e)));
                Err(e.into())
            }
        }
    }

    /// Tries each address in order and keeps the first that connects.
    async fn dial(&self, addrs: &[SocketAddr]) -> Result<TcpStream, anyhow::Error> {
        let mut last_err = None;
        for addr in addrs {
            tracer::with_active(|t| t.connect_start("tcp", *addr));
            let attempt = match self.connect_timeout {
                Some(limit) => timeout(limit, TcpStream::connect(addr))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connect timed out after {:?}", limit),
                        ))
                    }),
                None => TcpStream::connect(addr).await,
            };
            match attempt {
                Ok(stream) => {
                    tracer::with_active(|t| t.connect_done("tcp", *addr, None));
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set TCP_NODELAY on {} failed: {}", addr, e);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    tracer::with_active(|t| t.connect_done("tcp", *addr, Some(&e)));
                    debug!("dial {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => anyhow!("no address to dial"),
        })
    }
}

impl Service<Uri> for TracingConnector {
    type Response = TracedIo;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(connector.connect(uri))
    }
}
