//! warden_proxy - admission pipeline core for a caching forward/reverse HTTP proxy
//!
//! Everything between "a TCP accept completed" and "this request may be
//! handed to a fetcher": the non-blocking connection pool, the HTTP/1
//! request parser (including chunked transfer decoding), the ACL policy
//! engine with its asynchronous side-lookups (DNS, reverse DNS, identd,
//! helper subprocesses), and the pluggable authentication manager. The
//! on-disk cache store, upstream peer selection, and reply-writing are
//! deliberately out of scope — they're external collaborators this core
//! only defines trait-shaped hooks for.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, chunked encoding
//! - **HTTP/1.0**: basic protocol support for legacy clients
//! - **HTTP/0.9+**: [keep-alive variant](limits::Http09Limits) for embedders that need it
//!
//! # Modules
//!
//! - [`acl`] — typed ACL term kinds, rule lists, and the evaluation checklist
//! - [`auth`] — pluggable authentication schemes and the user cache
//! - [`helper`] — the external helper subprocess pool (concurrency, queueing, retry)
//! - [`resolve`] — async ident (RFC 1413) and DNS/FQDN facades
//! - [`coordinator`] — glues parsing, ACL, and auth into the admission decision
//! - [`config`] — the populated configuration object the core consumes
//! - [`AdmittingHandler`] — wraps any [`Handler`] with the admission check above
//!
//! # Quick Start
//!
//! ```no_run
//! use warden_proxy::{Server, Handler, Request, Response, Handled, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
pub mod acl;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod helper;
pub mod resolve;

pub(crate) mod http {
    pub(crate) mod chunked;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub mod admitting;
    pub(crate) mod connection;
    pub mod pinning;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    acl::{AclKind, AclRule, AclRuleList, Checklist, Verdict},
    auth::{AuthManager, AuthOutcome},
    config::CoreConfig,
    coordinator::{AdmitDecision, RequestCoordinator, WorkerContext},
    http::{
        query,
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Url, Version},
    },
    server::{
        admitting::{AdmittingHandler, AuthConnState, PortFlags},
        connection::{ConnectionData, ConnectionFilter},
        pinning::PinnedConnection,
        server_impl::{Handler, Server, ServerBuilder},
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    f(
        &Request::new(&crate::limits::ReqLimits::default()),
        &mut Response::new(&crate::limits::RespLimits::default()),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use warden_proxy::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        // `<()>` to check functionality
        impl Handler<()> for $name {
            async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
