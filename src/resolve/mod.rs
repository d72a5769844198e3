//! Ident and DNS/FQDN facades (spec.md §4.6).

pub mod dns;
pub mod ident;

pub use dns::DnsFacade;
pub use ident::IdentResolver;
