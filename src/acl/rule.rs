//! ACL rule lists (spec.md §3 "ACL rule", §4.4 "Ordering across rules").

use crate::acl::term::AclTerm;
use std::sync::Arc;

/// The verdict an [`AclRule`] (or a whole [`AclRuleList`]) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied,
}

impl Verdict {
    pub const fn inverse(self) -> Self {
        match self {
            Verdict::Allowed => Verdict::Denied,
            Verdict::Denied => Verdict::Allowed,
        }
    }
}

/// One AND-combined term reference within a rule, optionally negated
/// (spec.md §3 "ACL rule": "each term optionally negated").
#[derive(Debug, Clone)]
pub struct RuleTerm {
    pub acl: Arc<AclTerm>,
    pub negate: bool,
}

/// An ordered list of terms combined as a boolean AND, plus a verdict.
#[derive(Debug, Clone)]
pub struct AclRule {
    pub name: &'static str,
    pub terms: Vec<RuleTerm>,
    pub verdict: Verdict,
}

/// A rule list for one checkpoint (spec.md §4.7): `http_access`,
/// `adapted_http_access`, `miss_access`, or the ident-lookup gate.
///
/// An empty or explicitly invalidated list fails closed, matching spec.md
/// §4.4 ("If the list is empty or marked invalid, the answer is DENIED").
#[derive(Debug, Clone, Default)]
pub struct AclRuleList {
    pub rules: Vec<AclRule>,
    pub valid: bool,
}

impl AclRuleList {
    pub fn new(rules: Vec<AclRule>) -> Self {
        Self { valid: !rules.is_empty(), rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{data::IpSet, term::AclKind};

    fn allow_all() -> AclRule {
        AclRule {
            name: "allow_all",
            terms: Vec::new(),
            verdict: Verdict::Allowed,
        }
    }

    #[test]
    fn empty_rule_matches_unconditionally() {
        let list = AclRuleList::new(vec![allow_all()]);
        assert!(list.valid);
        assert_eq!(list.rules[0].terms.len(), 0);
    }

    #[test]
    fn default_list_is_invalid() {
        let list = AclRuleList::default();
        assert!(!list.valid);
    }

    #[test]
    fn negated_term_flips_match() {
        let term = AclTerm::new("local_nets", AclKind::SourceIp(IpSet(vec![])));
        let rule = AclRule {
            name: "deny_local",
            terms: vec![RuleTerm { acl: term, negate: true }],
            verdict: Verdict::Denied,
        };
        assert!(rule.terms[0].negate);
    }
}
