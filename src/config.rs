//! Configuration collaborator consumed by the admission pipeline.
//!
//! Parsing a configuration file is explicitly out of scope (spec.md §6); this
//! module only defines the populated object the core expects to receive.
//! Mirrors the style of [`crate::limits`]: plain structs, `Debug + Clone`,
//! security-conscious defaults, a trailing `_priv` field to keep struct
//! literals non-exhaustive across versions.

use crate::acl::rule::AclRuleList;
use std::{collections::HashMap, time::Duration};

/// Per-listening-port behavior (spec.md §6: "listening ports with per-port flags").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Client sends an absolute-form request-line naming the origin.
    Forward,
    /// Transparent/TPROXY redirect; the URI is a path, origin comes from the
    /// original destination address.
    Intercept,
    /// Reverse-proxy front end; origin comes from the configured default site
    /// or the `Host` header, and `Authorization` (not `Proxy-Authorization`)
    /// carries credentials.
    Accelerator,
}

/// The checkpoints the coordinator consults in order (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    HttpAccess,
    AdaptedHttpAccess,
    MissAccess,
}

/// Named redirect/template consulted on denial (spec.md §3 "deny_info", §9a).
#[derive(Debug, Clone)]
pub struct DenyInfoEntry {
    pub acl_name: &'static str,
    pub target: &'static str,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum concurrent in-flight request contexts beyond the one being
    /// parsed (spec.md §4.7 "Pipelining and prefetch").
    pub pipeline_max_prefetch: usize,
    /// deny_info entries, consulted in order on denial.
    pub deny_info: Vec<DenyInfoEntry>,
    /// Preserves the source's `aclGetDenyInfoPage` quirk (spec.md §9, open
    /// question a): when `false` (the observed source default), deny_info
    /// entries whose target contains `:` are skipped rather than treated as
    /// a URL. Flip to `true` to treat every entry as a usable redirect.
    pub redirect_allowed_for_colon_names: bool,
    /// Bounded drain period given to helper pools on graceful shutdown.
    pub shutdown_drain: Duration,
    #[doc(hidden)]
    pub _priv: (),
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pipeline_max_prefetch: 1,
            deny_info: Vec::new(),
            redirect_allowed_for_colon_names: false,
            shutdown_drain: Duration::from_secs(10),
            _priv: (),
        }
    }
}

/// ACL rule lists keyed by checkpoint (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct AclConfig {
    pub rules: HashMap<Checkpoint, AclRuleList>,
    /// Rule list consulted to decide whether ident lookup is worth the round
    /// trip for a given checklist (spec.md §6 "ident lookup ACL").
    pub ident_access: AclRuleList,
}

/// DNS/FQDN resolver cache sizing (spec.md §6).
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub cache_capacity: usize,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    #[doc(hidden)]
    pub _priv: (),
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(3600),
            _priv: (),
        }
    }
}

/// Ident (RFC 1413) lookup tuning (spec.md §4.6).
#[derive(Debug, Clone, Copy)]
pub struct IdentConfig {
    pub timeout: Duration,
    #[doc(hidden)]
    pub _priv: (),
}

impl Default for IdentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            _priv: (),
        }
    }
}

/// Authentication manager configuration (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// How long an idle user cache entry survives before GC (spec.md §4.5
    /// "User cache").
    pub authenticate_ttl: Duration,
    /// `max_user_ip`: 0 disables the check.
    pub max_user_ip: usize,
    /// Strict mode denies the request on overflow; lenient flushes the
    /// IP-seen list and allows it (spec.md §4.5 step 5).
    pub max_user_ip_strict: bool,
    #[doc(hidden)]
    pub _priv: (),
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authenticate_ttl: Duration::from_secs(3600),
            max_user_ip: 0,
            max_user_ip_strict: false,
            _priv: (),
        }
    }
}

/// Top-level configuration snapshot the core consumes (spec.md §6).
///
/// Configuration is immutable per reactor turn (spec.md §5): a reload builds
/// a new `CoreConfig` and the caller swaps it in, which invalidates cached
/// ACL match results by construction (a fresh config carries a fresh
/// [`crate::auth::user::UserCache`] match-memo generation, see
/// [`crate::auth::user::UserCache::reconfigure`]).
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub port_mode: Option<PortMode>,
    pub acl: AclConfig,
    pub coordinator: CoordinatorConfig,
    pub dns: DnsConfig,
    pub ident: IdentConfig,
    pub auth: AuthConfig,
}
