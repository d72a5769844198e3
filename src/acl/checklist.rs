//! The mutable evaluation frame for one rule-list check (spec.md §3 "Checklist").
//!
//! Squid threads this state through a singleton-per-checklist `state_`
//! object, resumed by hand from lookup completion callbacks (spec.md §9,
//! "Coroutine control flow in ACL evaluation"). Rust's `async fn` generates
//! exactly the explicit state machine the design note asks for — each
//! `.await` point in [`Checklist::evaluate`] *is* a `{Matching(idx),
//! WaitingOn(..), Finished(..)}` transition, just compiler-derived instead of
//! hand-rolled. `destinationDomainChecked`/`sourceDomainChecked` stay as
//! plain monotone flags on the struct exactly as the source keeps them.

use crate::{
    acl::rule::{AclRuleList, Verdict},
    auth::request::AuthUserRequest,
    coordinator::WorkerContext,
    http::request::Request,
};
use std::{net::IpAddr, sync::Arc};

/// Non-owning view of the connection-level facts a checklist needs. Keeps
/// the checklist decoupled from the concrete connection type so it can be
/// constructed in tests without a live socket.
#[derive(Debug, Clone, Copy)]
pub struct ConnFacts {
    pub local_addr: IpAddr,
    pub local_port: u16,
    /// The client's real TCP source (ephemeral) port, distinct from
    /// `local_port` (spec.md §4.6: the ident query line needs both halves of
    /// the actual socket pair, `client_port,local_port`).
    pub client_port: u16,
}

/// The evaluation frame for one rule-list check.
pub struct Checklist<'a> {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub conn: ConnFacts,
    pub request: Option<&'a Request>,
    pub auth: Option<Arc<AuthUserRequest>>,
    pub ident: Option<String>,
    /// `destinationDomainChecked`: true once a reverse lookup for `dst_addr`
    /// has completed, so a term resumed a second time does not re-issue it.
    pub destination_domain_checked: bool,
    /// `sourceDomainChecked`: same, for `src_addr`.
    pub source_domain_checked: bool,
    pub destination_domain: Option<String>,
    pub source_domain: Option<String>,
    /// `lastACLResult`: short-circuit cache for the most recent verdict on
    /// this checklist, inspected by callers that re-enter after a suspension.
    pub last_result: Option<Verdict>,
    /// Name of the rule that produced `last_result`: either the rule whose
    /// AND-list matched, or — in the default-deny-after-allow-list case —
    /// the last rule in the list, whose verdict got inverted. `None` only
    /// for an empty/invalid list (spec.md §4.4), which has no rule to blame.
    decided_rule: Option<&'static str>,
}

impl<'a> Checklist<'a> {
    pub fn new(src_addr: IpAddr, dst_addr: IpAddr, conn: ConnFacts) -> Self {
        Self {
            src_addr,
            dst_addr,
            conn,
            request: None,
            auth: None,
            ident: None,
            destination_domain_checked: false,
            source_domain_checked: false,
            destination_domain: None,
            source_domain: None,
            last_result: None,
            decided_rule: None,
        }
    }

    pub fn with_request(mut self, request: &'a Request) -> Self {
        self.request = Some(request);
        self
    }

    /// Runs a rule list to completion, driving any async term lookups
    /// (DNS/ident/auth/helper) via `ctx`'s facades. Returns the final
    /// verdict per spec.md §4.4's rule-list semantics: first matching rule
    /// wins; otherwise the inverse of the last rule's verdict; an empty or
    /// invalid list fails closed (`Denied`).
    pub async fn evaluate(&mut self, rules: &AclRuleList, ctx: &WorkerContext) -> Verdict {
        if rules.rules.is_empty() || !rules.valid {
            self.last_result = Some(Verdict::Denied);
            self.decided_rule = None;
            return Verdict::Denied;
        }

        for rule in &rules.rules {
            let mut all_matched = true;
            for term in &rule.terms {
                let matched = term.acl.matches_cached(self, ctx).await;
                if matched == term.negate {
                    all_matched = false;
                    break;
                }
            }
            if all_matched {
                self.last_result = Some(rule.verdict);
                self.decided_rule = Some(rule.name);
                return rule.verdict;
            }
        }

        let last_rule = rules.rules.last().unwrap();
        let inverse = last_rule.verdict.inverse();
        self.last_result = Some(inverse);
        self.decided_rule = Some(last_rule.name);
        inverse
    }

    /// Name of the rule that produced the current `Denied` verdict, used to
    /// resolve a `deny_info` redirect (spec.md §3/§4.7). `None` whenever the
    /// last verdict wasn't a denial, or the list was empty/invalid.
    pub fn denying_rule_name(&self) -> Option<&'static str> {
        match self.last_result {
            Some(Verdict::Denied) => self.decided_rule,
            _ => None,
        }
    }

    pub fn mark_destination_domain_checked(&mut self, domain: Option<String>) {
        self.destination_domain_checked = true;
        self.destination_domain = domain;
    }

    pub fn mark_source_domain_checked(&mut self, domain: Option<String>) {
        self.source_domain_checked = true;
        self.source_domain = domain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acl::{
            data::{CidrRange, IpSet},
            rule::{AclRule, RuleTerm},
            term::{AclKind, AclTerm},
        },
        auth::{user::UserCache, AuthManager},
        config::CoreConfig,
        resolve::{DnsFacade, IdentResolver},
    };
    use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

    fn test_ctx() -> WorkerContext {
        WorkerContext {
            dns: DnsFacade::new(Duration::from_secs(60), Duration::from_secs(3600)),
            ident: IdentResolver::new(Duration::from_secs(10)),
            helpers: HashMap::new(),
            user_cache: UserCache::new(Duration::from_secs(3600)),
            auth: AuthManager::new(Vec::new(), UserCache::new(Duration::from_secs(3600))),
            config: CoreConfig::default(),
        }
    }

    fn rule(name: &'static str, terms: Vec<RuleTerm>, verdict: Verdict) -> AclRule {
        AclRule { name, terms, verdict }
    }

    /// A `source-ip` term that never matches `checklist()`'s `127.0.0.1`,
    /// so a rule carrying it always fails the short-circuit AND.
    fn unreachable_source() -> RuleTerm {
        let term = AclTerm::new(
            "not_localhost",
            AclKind::SourceIp(IpSet(vec![CidrRange { network: "10.0.0.0".parse().unwrap(), prefix_len: 8 }])),
        );
        RuleTerm { acl: term, negate: false }
    }

    fn checklist() -> Checklist<'static> {
        let facts = ConnFacts { local_addr: Ipv4Addr::LOCALHOST.into(), local_port: 3128, client_port: 45678 };
        Checklist::new(Ipv4Addr::LOCALHOST.into(), Ipv4Addr::LOCALHOST.into(), facts)
    }

    #[tokio::test]
    async fn denying_rule_name_blames_the_rule_that_actually_matched() {
        // Both rules carry `deny` verdicts, but only the second's AND-list
        // can ever match (the first's single term never does). Before the
        // fix, `denying_rule_name` scanned for the first rule with a static
        // `Denied` verdict and would have blamed `deny_one` regardless.
        let rules = AclRuleList::new(vec![
            rule("deny_one", vec![unreachable_source()], Verdict::Denied),
            rule("deny_two", Vec::new(), Verdict::Denied),
        ]);
        let ctx = test_ctx();
        let mut check = checklist();
        let verdict = check.evaluate(&rules, &ctx).await;

        assert_eq!(verdict, Verdict::Denied);
        assert_eq!(check.denying_rule_name(), Some("deny_two"));
    }

    #[tokio::test]
    async fn default_deny_after_allow_list_blames_the_last_rule() {
        // spec.md §3: "If none match, the verdict is the inverse of the
        // last rule's verdict." An allow-list whose only rule fails to
        // match produces a `Denied` verdict with no rule carrying a static
        // `Denied` verdict at all; `deny_info` must still resolve against
        // the rule whose verdict got inverted, not come back empty.
        let rules = AclRuleList::new(vec![rule("allow_admins", vec![unreachable_source()], Verdict::Allowed)]);
        let ctx = test_ctx();
        let mut check = checklist();
        let verdict = check.evaluate(&rules, &ctx).await;

        assert_eq!(verdict, Verdict::Denied);
        assert_eq!(check.denying_rule_name(), Some("allow_admins"));
    }

    #[tokio::test]
    async fn allowed_verdict_has_no_denying_rule() {
        let rules = AclRuleList::new(vec![rule("allow_all", Vec::new(), Verdict::Allowed)]);
        let ctx = test_ctx();
        let mut check = checklist();

        assert_eq!(check.evaluate(&rules, &ctx).await, Verdict::Allowed);
        assert_eq!(check.denying_rule_name(), None);
    }
}
