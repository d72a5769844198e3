//! Authenticated user and the process-wide user cache (spec.md §3, §4.5).

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Mutex, RwLock},
    time::{Duration, Instant},
};

/// One IP address a user has been seen from, with its own expiry (spec.md
/// §3: "an IP-seen list with per-entry expiry").
#[derive(Debug, Clone, Copy)]
struct SeenIp {
    addr: IpAddr,
    expires_at: Instant,
}

/// A cached answer to one ACL term's string fingerprint, memoized per user
/// (spec.md §4.4 "Caching per user").
type MatchFingerprint = String;

/// An authenticated user (spec.md §3 "Authenticated user").
///
/// Owned by the process-wide [`UserCache`]; every [`crate::auth::request::AuthUserRequest`]
/// that names this user holds an `Arc` to it, which is how the "outlives
/// every auth-user-request" invariant is enforced — the value cannot be
/// dropped while any request still references it.
#[derive(Debug)]
pub struct AuthUser {
    pub scheme: &'static str,
    pub name: String,
    seen_ips: Mutex<Vec<SeenIp>>,
    match_cache: Mutex<HashMap<MatchFingerprint, bool>>,
    ip_seen_ttl: Duration,
}

impl AuthUser {
    fn new(scheme: &'static str, name: String, ip_seen_ttl: Duration) -> Self {
        Self {
            scheme,
            name,
            seen_ips: Mutex::new(Vec::new()),
            match_cache: Mutex::new(HashMap::new()),
            ip_seen_ttl,
        }
    }

    /// Records `addr` against this user's IP-seen list, applying
    /// `max_user_ip` (0 = unlimited). Returns `true` if the limit was
    /// exceeded and strict mode denies the request; in lenient mode the
    /// list is flushed and `false` is returned (spec.md §4.5 step 5).
    pub fn note_ip(&self, addr: IpAddr, limit: usize, strict: bool) -> bool {
        let mut seen = self.seen_ips.lock().unwrap();
        let now = Instant::now();
        seen.retain(|entry| entry.expires_at > now);

        if !seen.iter().any(|entry| entry.addr == addr) {
            seen.push(SeenIp {
                addr,
                expires_at: now + self.ip_seen_ttl,
            });
        }

        if limit == 0 || seen.len() <= limit {
            return false;
        }

        if strict {
            true
        } else {
            seen.clear();
            seen.push(SeenIp {
                addr,
                expires_at: now + self.ip_seen_ttl,
            });
            false
        }
    }

    pub fn match_cache_get(&self, fingerprint: &str) -> Option<bool> {
        self.match_cache.lock().unwrap().get(fingerprint).copied()
    }

    pub fn match_cache_put(&self, fingerprint: String, result: bool) {
        self.match_cache.lock().unwrap().insert(fingerprint, result);
    }

    fn flush_match_cache(&self) {
        self.match_cache.lock().unwrap().clear();
    }
}

struct CacheEntry {
    user: std::sync::Arc<AuthUser>,
    last_active: Instant,
}

/// Global hash keyed by user name (spec.md §4.5 "User cache").
///
/// GC and reference counting follow spec.md §3's invariant directly through
/// `Arc` strong counts: the cache's own `Arc` clone is the "+1 if in cache"
/// term, so an entry is evictable once `Arc::strong_count(&entry.user) == 1`
/// (only the cache holds it — no live request references remain).
pub struct UserCache {
    entries: RwLock<HashMap<(&'static str, String), CacheEntry>>,
    ttl: Duration,
}

impl UserCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get_or_insert(&self, scheme: &'static str, name: &str) -> std::sync::Arc<AuthUser> {
        let key = (scheme, name.to_owned());
        {
            let entries = self.entries.read().unwrap();
            if let Some(entry) = entries.get(&key) {
                return entry.user.clone();
            }
        }
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(key)
            .or_insert_with(|| CacheEntry {
                user: std::sync::Arc::new(AuthUser::new(scheme, name.to_owned(), self.ttl)),
                last_active: Instant::now(),
            })
            .user
            .clone()
    }

    pub fn touch(&self, scheme: &'static str, name: &str) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(&(scheme, name.to_owned())) {
            entry.last_active = Instant::now();
        }
    }

    /// Periodic GC: evicts entries idle past `authenticateTTL` whose
    /// reference count shows no live request still holds them.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| {
            let idle = now.duration_since(entry.last_active) > self.ttl;
            !(idle && std::sync::Arc::strong_count(&entry.user) == 1)
        });
    }

    /// A reconfigure does not flush the cache but resets each user's
    /// ACL-match memo (spec.md §4.5 "User cache").
    pub fn reconfigure(&self) {
        for entry in self.entries.read().unwrap().values() {
            entry.user.flush_match_cache();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_user_ip_strict_denies_on_overflow() {
        let cache = UserCache::new(Duration::from_secs(60));
        let user = cache.get_or_insert("basic", "alice");

        assert!(!user.note_ip("10.0.0.1".parse().unwrap(), 1, true));
        assert!(user.note_ip("10.0.0.2".parse().unwrap(), 1, true));
    }

    #[test]
    fn max_user_ip_lenient_flushes_instead_of_denying() {
        let cache = UserCache::new(Duration::from_secs(60));
        let user = cache.get_or_insert("basic", "bob");

        assert!(!user.note_ip("10.0.0.1".parse().unwrap(), 1, false));
        assert!(!user.note_ip("10.0.0.2".parse().unwrap(), 1, false));
    }

    #[test]
    fn reconfigure_flushes_match_cache_but_keeps_user() {
        let cache = UserCache::new(Duration::from_secs(60));
        let user = cache.get_or_insert("basic", "carol");
        user.match_cache_put("fp1".into(), true);

        cache.reconfigure();

        assert_eq!(user.match_cache_get("fp1"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn gc_keeps_users_still_referenced() {
        let cache = UserCache::new(Duration::from_millis(1));
        let user = cache.get_or_insert("basic", "dave");
        std::thread::sleep(Duration::from_millis(5));

        cache.gc();
        assert_eq!(cache.len(), 1);
        drop(user);
        cache.gc();
        assert_eq!(cache.len(), 0);
    }
}
