//! Async forward/reverse DNS facade with an in-memory result cache
//! (spec.md §4.6 "DNS/FQDN resolver facade").

use hickory_resolver::{config::{ResolverConfig, ResolverOpts}, TokioAsyncResolver};
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::debug;

struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

/// `gethostbyname`/`gethostbyaddr`, memoized with TTLs derived from answer
/// records and bounded by admin-configured min/max caps (spec.md §4.6).
pub struct DnsFacade {
    resolver: TokioAsyncResolver,
    min_ttl: Duration,
    max_ttl: Duration,
    forward_cache: Mutex<HashMap<String, CacheEntry<Vec<IpAddr>>>>,
    reverse_cache: Mutex<HashMap<IpAddr, CacheEntry<Option<String>>>>,
}

impl DnsFacade {
    pub fn new(min_ttl: Duration, max_ttl: Duration) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            resolver,
            min_ttl,
            max_ttl,
            forward_cache: Mutex::new(HashMap::new()),
            reverse_cache: Mutex::new(HashMap::new()),
        }
    }

    fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.min_ttl, self.max_ttl)
    }

    /// `gethostbyname`: resolves a hostname to its address set.
    pub async fn forward(&self, host: &str) -> Option<Vec<IpAddr>> {
        if let Some(entry) = self.forward_cache.lock().unwrap().get(host) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
        }

        let lookup = self.resolver.lookup_ip(host).await.ok()?;
        let ttl = self.clamp_ttl(self.min_ttl);
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return None;
        }
        self.forward_cache.lock().unwrap().insert(
            host.to_owned(),
            CacheEntry { value: addrs.clone(), expires_at: Instant::now() + ttl },
        );
        Some(addrs)
    }

    /// `gethostbyaddr`: reverse-resolves an address to its canonical FQDN,
    /// used by the `source-domain`/`destination-domain` ACL term kinds
    /// (spec.md §4.4 "Asynchronous suspension").
    pub async fn reverse(&self, addr: IpAddr) -> Option<String> {
        if let Some(entry) = self.reverse_cache.lock().unwrap().get(&addr) {
            if entry.expires_at > Instant::now() {
                return entry.value.clone();
            }
        }

        let result = self.resolver.reverse_lookup(addr).await;
        let (name, ttl) = match result {
            Ok(lookup) => {
                let name = lookup.iter().next().map(|n| n.to_utf8().trim_end_matches('.').to_owned());
                (name, self.min_ttl)
            }
            Err(err) => {
                debug!(%addr, %err, "reverse dns lookup failed");
                (None, self.min_ttl)
            }
        };
        self.reverse_cache.lock().unwrap().insert(
            addr,
            CacheEntry { value: name.clone(), expires_at: Instant::now() + ttl },
        );
        name
    }
}
