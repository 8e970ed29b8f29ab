//! Host-name resolution cache installed into the HTTP transport.
//!
//! Only host names matching one of the configured patterns are cached; every
//! other name is resolved on each connection. Each cached host has its own
//! lock, so a slow lookup only delays callers waiting on the same name.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(300);

type LookupFuture = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send>>;
type LookupFn = dyn Fn(String) -> LookupFuture + Send + Sync;

struct CachedAddrs {
    addrs: Vec<SocketAddr>,
    expires_at: Instant,
}

type HostSlot = Arc<Mutex<Option<CachedAddrs>>>;

struct DnsCacheInner {
    ttl: Duration,
    host_patterns: Vec<String>,
    entries: Mutex<HashMap<String, HostSlot>>,
    lookup: Box<LookupFn>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone)]
pub struct DnsCache {
    inner: Arc<DnsCacheInner>,
}

impl DnsCache {
    /// Cache backed by the system resolver.
    pub fn new(ttl: Duration, host_patterns: Vec<String>) -> Self {
        Self::with_lookup(ttl, host_patterns, |host: String| async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
            Ok::<_, io::Error>(addrs)
        })
    }

    pub fn with_lookup<F, Fut>(ttl: Duration, host_patterns: Vec<String>, lookup: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'static,
    {
        let lookup: Box<LookupFn> = Box::new(move |host| -> LookupFuture { Box::pin(lookup(host)) });
        Self {
            inner: Arc::new(DnsCacheInner {
                ttl,
                host_patterns,
                entries: Mutex::new(HashMap::new()),
                lookup,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn is_cached_host(&self, host: &str) -> bool {
        self.inner
            .host_patterns
            .iter()
            .any(|pattern| host.contains(pattern.as_str()))
    }

    pub fn hits(&self) -> u64 {
        self.inner.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.inner.misses.load(Ordering::Relaxed)
    }

    pub async fn resolve_host(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        if !self.is_cached_host(host) {
            return self.lookup(host).await;
        }

        let slot = self
            .inner
            .entries
            .lock()
            .await
            .entry(host.to_owned())
            .or_default()
            .clone();

        // Held across the lookup so one miss populates the entry for everyone
        // asking for this host.
        let mut entry = slot.lock().await;
        let now = Instant::now();
        if let Some(cached) = entry.as_ref().filter(|cached| cached.expires_at > now) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.addrs.clone());
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        let addrs = self.lookup(host).await?;
        debug!(host, addrs = addrs.len(), ttl_secs = self.inner.ttl.as_secs(), "dns entry cached");
        *entry = Some(CachedAddrs {
            addrs: addrs.clone(),
            expires_at: Instant::now() + self.inner.ttl,
        });
        Ok(addrs)
    }

    async fn lookup(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        let addrs = (self.inner.lookup)(host.to_owned()).await?;
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            ));
        }
        Ok(addrs)
    }
}

impl Resolve for DnsCache {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = self.clone();
        Box::pin(async move {
            let addrs: Addrs = Box::new(cache.resolve_host(name.as_str()).await?.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}
