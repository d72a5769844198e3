//! Request coordinator (spec.md §4.7): glues parsing, the ACL rule
//! evaluator, authentication, and the helper/resolve facades into the
//! callout sequence that decides whether a parsed request is handed off to
//! the (external) fetcher.
//!
//! Grounded on `examples/original_source/src/client_side.cc`'s
//! `clientAccessCheck`/`clientAccessCheckDone` chain, restated as the
//! explicit `advance`-free design spec.md §9 asks for: each checkpoint is
//! one `Checklist::evaluate().await`, and Rust's `async fn` is the state
//! machine the source hand-rolls with `state_` singletons.

use crate::{
    acl::{Checklist, ConnFacts, Verdict},
    auth::{request::AuthUserRequest, AuthManager, AuthOutcome, HeaderKind},
    config::{Checkpoint, CoreConfig},
    http::request::Request,
    resolve::{DnsFacade, IdentResolver},
    auth::user::UserCache,
    helper::HelperPool,
};
use std::{collections::HashMap, net::IpAddr, sync::Arc};

/// Everything a checklist or auth driver pass needs that isn't itself
/// (spec.md §9 "Global mutable state": "gather into a per-worker context
/// object passed into each async job; avoid process-wide mutables").
pub struct WorkerContext {
    pub dns: DnsFacade,
    pub ident: Arc<IdentResolver>,
    pub helpers: HashMap<String, Arc<HelperPool>>,
    pub user_cache: UserCache,
    pub auth: AuthManager,
    pub config: CoreConfig,
}

/// Outcome of running the admission pipeline for one request (spec.md §4.7,
/// §7 "Error Handling Design").
#[derive(Debug)]
pub enum AdmitDecision {
    /// Hand off to the (external) fetcher.
    Allowed,
    /// Deny with an ACL-driven `deny_info` redirect, or the plain error page
    /// if no entry names the denying rule (spec.md §3 "deny_info").
    Denied { redirect: Option<String> },
    /// `407`/`401` carrying aggregated challenges from every active scheme
    /// (spec.md §4.7).
    ChallengeRequired { accelerated: bool, challenges: Vec<String> },
    /// A scheme's helper round-trip is still in flight; the caller should
    /// hold the request context rather than advance it (spec.md §4.5
    /// direction `-1`).
    AuthHelperBusy,
    /// `direction() == -2`: fatal scheme error (spec.md §7 "Auth").
    CannotAuthenticate,
}

/// Drives one parsed request through spec.md §4.7's callout sequence:
/// `http_access`, then (if a user-dependent term suspended on auth) the
/// authentication driver, then re-evaluation.
pub struct RequestCoordinator<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> RequestCoordinator<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    /// Runs `checkpoint`'s rule list against `request`, driving
    /// authentication when a `proxy_auth`-family term needs it.
    ///
    /// This mirrors spec.md §4.5 step 4/5 layered on top of §4.4's
    /// short-circuit evaluator: the ACL pass runs first; if it denies solely
    /// because no/invalid credentials were supplied, the coordinator runs
    /// the auth driver once and re-evaluates with the resulting user bound
    /// to the checklist.
    ///
    /// `bound_user_request` is the caller's connection-level auth handle
    /// (spec.md §3 "Client connection": "an authenticated-user handle"), fed
    /// back into [`crate::auth::AuthManager::authenticate`] so a second
    /// request on the same connection can reuse it instead of re-challenging.
    /// The returned `Option` is the value the caller should store back onto
    /// that handle: `Some` on a (re)bind, `None` when nothing changed.
    pub async fn admit(
        &self,
        checkpoint: Checkpoint,
        request: &Request,
        src_addr: IpAddr,
        dst_addr: IpAddr,
        conn: ConnFacts,
        intercepted: bool,
        accelerated: bool,
        bound_user_request: Option<Arc<AuthUserRequest>>,
    ) -> (AdmitDecision, Option<Arc<AuthUserRequest>>) {
        let Some(rules) = self.ctx.config.acl.rules.get(&checkpoint) else {
            return (AdmitDecision::Denied { redirect: None }, None);
        };

        let mut checklist = Checklist::new(src_addr, dst_addr, conn).with_request(request);
        checklist.auth = bound_user_request.clone();
        let verdict = checklist.evaluate(rules, self.ctx).await;

        if verdict == Verdict::Allowed {
            return (AdmitDecision::Allowed, None);
        }

        // The rule-list denied. If the reason is "no authenticated user yet"
        // rather than a hard policy denial, run the auth driver and retry
        // once with the resulting user bound (spec.md §4.7: "If the denying
        // term required authentication that was not yet provided, the
        // response is a 407").
        let needs_auth = rules
            .rules
            .iter()
            .any(|r| r.terms.iter().any(|t| requires_user(&t.acl.kind)));

        if needs_auth {
            match self
                .ctx
                .auth
                .authenticate(request, bound_user_request.as_deref(), intercepted, accelerated, self.ctx)
                .await
            {
                AuthOutcome::Allowed(user_request) => {
                    checklist.auth = Some(user_request.clone());
                    let verdict = checklist.evaluate(rules, self.ctx).await;
                    let decision = match verdict {
                        Verdict::Allowed => AdmitDecision::Allowed,
                        Verdict::Denied => AdmitDecision::Denied {
                            redirect: self.resolve_deny_info(checklist.denying_rule_name()),
                        },
                    };
                    return (decision, Some(user_request));
                }
                AuthOutcome::Challenge { header_kind, challenges } => {
                    return (
                        AdmitDecision::ChallengeRequired {
                            accelerated: header_kind == HeaderKind::Origin,
                            challenges,
                        },
                        None,
                    );
                }
                AuthOutcome::HelperBusy => return (AdmitDecision::AuthHelperBusy, None),
                AuthOutcome::CannotAuthenticate => return (AdmitDecision::CannotAuthenticate, None),
            }
        }

        (
            AdmitDecision::Denied {
                redirect: self.resolve_deny_info(checklist.denying_rule_name()),
            },
            None,
        )
    }

    /// Resolves the first `deny_info` entry naming the denying ACL (spec.md
    /// §3 "deny_info", §9 open question (a)): entries whose target contains
    /// `:` are skipped unless `redirect_allowed_for_colon_names` is set,
    /// preserving the source's possibly-accidental filtering behind an
    /// explicit switch.
    fn resolve_deny_info(&self, denying_rule: Option<&'static str>) -> Option<String> {
        let denying_rule = denying_rule?;
        let allow_colon = self.ctx.config.coordinator.redirect_allowed_for_colon_names;
        self.ctx
            .config
            .coordinator
            .deny_info
            .iter()
            .find(|entry| entry.acl_name == denying_rule)
            .filter(|entry| allow_colon || !entry.target.contains(':'))
            .map(|entry| entry.target.to_owned())
    }
}

fn requires_user(kind: &crate::acl::AclKind) -> bool {
    matches!(
        kind,
        crate::acl::AclKind::ProxyAuth(_) | crate::acl::AclKind::ProxyAuthRegex(_) | crate::acl::AclKind::ExtUser(_)
    )
}

/// Caps concurrent request contexts per connection (spec.md §4.7
/// "Pipelining and prefetch"): `pipeline_depth(C) ≤ pipeline_max_prefetch + 1`.
pub fn pipeline_has_room(current_depth: usize, max_prefetch: usize) -> bool {
    current_depth <= max_prefetch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acl::{
            rule::{AclRule, AclRuleList, RuleTerm},
            term::{AclKind, AclTerm},
        },
        auth::user::UserCache,
        config::AclConfig,
        server::connection::HttpConnection,
    };
    use std::{collections::HashSet, net::Ipv4Addr, time::Duration};

    #[test]
    fn pipeline_room_respects_prefetch_budget() {
        assert!(pipeline_has_room(0, 1));
        assert!(pipeline_has_room(1, 1));
        assert!(!pipeline_has_room(2, 1));
    }

    #[tokio::test]
    async fn admit_reuses_bound_user_instead_of_reissuing_challenge() {
        // spec.md §8 scenario 3, second half: a second request on the same
        // connection with no `Proxy-Authorization` header must not be
        // treated as "no credentials at all" when a connection-bound user
        // already exists — it should be evaluated with that user, even when
        // (as here) the bound user turns out not to satisfy the rule.
        let term = AclTerm::new("members_only", AclKind::ProxyAuth(HashSet::from(["bob".to_owned()])));
        let rule = AclRule { name: "members_only", terms: vec![RuleTerm { acl: term, negate: false }], verdict: Verdict::Allowed };
        let mut acl = AclConfig::default();
        acl.rules.insert(Checkpoint::HttpAccess, AclRuleList::new(vec![rule]));

        let ctx = WorkerContext {
            dns: DnsFacade::new(Duration::from_secs(60), Duration::from_secs(3600)),
            ident: IdentResolver::new(Duration::from_secs(10)),
            helpers: HashMap::new(),
            user_cache: UserCache::new(Duration::from_secs(3600)),
            auth: AuthManager::new(Vec::new(), UserCache::new(Duration::from_secs(3600))),
            config: CoreConfig { acl, ..CoreConfig::default() },
        };

        let bound = AuthUserRequest::new();
        bound.set_user(ctx.user_cache.get_or_insert("Basic", "alice"));

        let mut conn = HttpConnection::from_req("GET / HTTP/1.1\r\nHost: example.org\r\n\r\n");
        conn.parse().unwrap();

        let coordinator = RequestCoordinator::new(&ctx);
        let facts = ConnFacts { local_addr: Ipv4Addr::LOCALHOST.into(), local_port: 3128, client_port: 45678 };
        let (decision, _) = coordinator
            .admit(
                Checkpoint::HttpAccess,
                &conn.request,
                Ipv4Addr::LOCALHOST.into(),
                Ipv4Addr::LOCALHOST.into(),
                facts,
                false,
                false,
                Some(bound),
            )
            .await;

        // Before the fix, the hard-coded `None` meant a missing header
        // always produced `ChallengeRequired`; now the already-authenticated
        // "alice" is correctly evaluated and denied for not being "bob".
        assert!(matches!(decision, AdmitDecision::Denied { .. }));
    }
}
