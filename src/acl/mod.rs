//! Typed predicate terms, rule lists, and the evaluation checklist
//! (spec.md §3 "ACL term"/"ACL rule"/"Checklist", §4.4).

pub mod checklist;
pub mod data;
pub mod rule;
pub mod term;

pub use checklist::{Checklist, ConnFacts};
pub use rule::{AclRule, AclRuleList, RuleTerm, Verdict};
pub use term::{AclKind, AclTerm, Requires};
