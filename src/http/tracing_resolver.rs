use crate::trace::tracer;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use hyper_util::client::legacy::connect::dns::Name;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context as OtherContext, Poll};
use std::vec;
use tower_service::Service;

type LookupResult = Result<Arc<Vec<SocketAddr>>, Arc<io::Error>>;
type SharedLookup = Shared<BoxFuture<'static, LookupResult>>;
type WeakLookup = WeakShared<BoxFuture<'static, LookupResult>>;

/// System resolver that reports DNS milestones to the active tracer.
///
/// Concurrent lookups of the same host share one resolution; every caller
/// after the first sees `coalesced = true`. The registry only holds weak
/// handles, so a lookup every caller has abandoned is no longer in flight.
#[derive(Clone, Default)]
pub struct TracingResolver {
    in_flight: Arc<Mutex<HashMap<String, WeakLookup>>>,
}

impl TracingResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, host: &str) -> Result<Vec<SocketAddr>, anyhow::Error> {
        tracer::with_active(|t| t.dns_start(host));
        let (lookup, coalesced) = self.lookup(host);
        match lookup.await {
            Ok(addrs) if addrs.is_empty() => {
                let e = io::Error::new(io::ErrorKind::NotFound, "no addresses");
                tracer::with_active(|t| t.dns_done(&[], coalesced, Some(&e)));
                error!("DNS resolution for {} returned no addresses.", host);
                Err(anyhow!("No IP addresses found for host {}", host))
            }
            Ok(addrs) => {
                tracer::with_active(|t| t.dns_done(&addrs, coalesced, None));
                for (i, addr) in addrs.iter().enumerate() {
                    if i == 0 {
                        trace!("Resolved IP: {}", addr.ip());
                    } else {
                        trace!("Resolved IP (alternative): {}", addr.ip());
                    }
                }
                Ok(addrs.to_vec())
            }
            Err(e) => {
                tracer::with_active(|t| t.dns_done(&[], coalesced, Some(&*e)));
                Err(anyhow!("Resolving DNS for {} failed: {}", host, e))
            }
        }
    }

    /// Joins the lookup in flight for `host`, or starts one.
    fn lookup(&self, host: &str) -> (SharedLookup, bool) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = in_flight.get(host).and_then(WeakShared::upgrade) {
            return (existing, true);
        }

        let registry = self.in_flight.clone();
        let key = host.to_string();
        let name = host.to_string();
        let lookup = async move {
            let resolved =
                tokio::task::spawn_blocking(move || (name, 0).to_socket_addrs()).await;
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            match resolved {
                Ok(Ok(addrs)) => Ok(Arc::new(addrs.collect::<Vec<_>>())),
                Ok(Err(e)) => Err(Arc::new(e)),
                Err(join) => Err(Arc::new(io::Error::new(io::ErrorKind::Other, join))),
            }
        }
        .boxed()
        .shared();

        match lookup.downgrade() {
            Some(weak) => {
                in_flight.insert(host.to_string(), weak);
            }
            None => {
                in_flight.remove(host);
            }
        }
        (lookup, false)
    }
}

impl Service<Name> for TracingResolver {
    type Response = vec::IntoIter<SocketAddr>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut OtherContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.clone();
        Box::pin(async move {
            let addrs = resolver.resolve(name.as_str()).await?;
            Ok(addrs.into_iter())
        })
    }
}
