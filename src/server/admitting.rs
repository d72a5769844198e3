//! [`Handler`] adapter that runs the admission pipeline ahead of an inner
//! handler (spec.md §4.7 "Request coordinator"): the wiring between the
//! fixed worker pool's per-request callback and [`RequestCoordinator::admit`].
//!
//! Grounded on `examples/original_source/src/client_side.cc`'s
//! `clientProcessRequest` calling out to `clientAccessCheck` before a request
//! reaches `clientAccessCheckDone`/`clientStartBodyHandler` — restated here
//! as one `Handler<S>` wrapping another, since the teacher's `Handler<S>`
//! trait is already the seam the connection loop calls into per request
//! (`src/server/connection.rs`'s `impl_run`), and composition over that
//! trait avoids threading coordinator state through `HttpConnection` itself.

use crate::{
    acl::ConnFacts,
    auth::request::AuthUserRequest,
    config::Checkpoint,
    coordinator::{AdmitDecision, RequestCoordinator, WorkerContext},
    http::{request::Request, response::Response},
    server::connection::ConnectionData,
    Handled, StatusCode,
};
use std::{net::IpAddr, sync::Arc};

/// Per-connection state the admission layer needs alongside whatever the
/// embedding application already stores via its own [`ConnectionData`]
/// (spec.md §3 "Client connection": "an authenticated-user handle ... a
/// pinned upstream connection handle"). Wrapping the caller's `S` through
/// this extension point keeps [`AdmittingHandler`] composable with any
/// consumer connection data without folding these fields into
/// `HttpConnection` itself.
pub struct AuthConnState<S> {
    pub auth_user: Option<Arc<AuthUserRequest>>,
    pub pinned: Option<Arc<crate::server::pinning::PinnedConnection>>,
    pub inner: S,
}

impl<S: ConnectionData> ConnectionData for AuthConnState<S> {
    fn new() -> Self {
        Self { auth_user: None, pinned: None, inner: S::new() }
    }

    fn reset(&mut self) {
        self.auth_user = None;
        self.pinned = None;
        self.inner.reset();
    }
}

/// Whether a listening port is a transparent/TPROXY intercept and/or an
/// accelerator (reverse-proxy) front end (spec.md §4.5 step 1, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFlags {
    pub intercepted: bool,
    pub accelerated: bool,
}

/// Wraps an inner [`crate::Handler`] with the `http_access` admission check.
///
/// On [`AdmitDecision::Allowed`] the inner handler runs unmodified. Every
/// other outcome renders the corresponding HTTP response itself and the
/// inner handler never sees the request, matching spec.md §4.7 ("the
/// request is handed to the fetcher only on an Allowed verdict").
pub struct AdmittingHandler<H, S: ConnectionData> {
    inner: H,
    ctx: Arc<WorkerContext>,
    checkpoint: Checkpoint,
    ports: PortFlags,
    _marker: std::marker::PhantomData<S>,
}

impl<H, S: ConnectionData> AdmittingHandler<H, S> {
    pub fn new(inner: H, ctx: Arc<WorkerContext>, checkpoint: Checkpoint, ports: PortFlags) -> Self {
        Self {
            inner,
            ctx,
            checkpoint,
            ports,
            _marker: std::marker::PhantomData,
        }
    }

    /// Resolves the request's destination address for `destination-ip`/
    /// `destination-domain` terms from the `Host` header, since the parser
    /// this core carries models origin-form targets only (CONNECT/absolute-URI
    /// handling belongs to the external fetcher this crate hooks into).
    /// Falls back to the connection's local address when the header is
    /// missing or does not resolve.
    async fn destination_addr(&self, request: &Request) -> IpAddr {
        if let Some(host_header) = request.header(b"host") {
            if let Ok(host) = std::str::from_utf8(host_header) {
                let host = host.split(':').next().unwrap_or(host);
                if let Ok(addr) = host.parse::<IpAddr>() {
                    return addr;
                }
                if let Some(mut addrs) = self.ctx.dns.forward(host).await {
                    if let Some(addr) = addrs.pop() {
                        return addr;
                    }
                }
            }
        }
        request.server_addr().ip()
    }

    fn render(&self, decision: AdmitDecision, response: &mut Response) -> Handled {
        match decision {
            AdmitDecision::Allowed => unreachable!("caller filters Allowed before rendering"),
            AdmitDecision::Denied { redirect: Some(target) } => {
                response.status(StatusCode::Found).header("location", target).body("")
            }
            AdmitDecision::Denied { redirect: None } => {
                response.status(StatusCode::Forbidden).body("Access denied")
            }
            AdmitDecision::ChallengeRequired { accelerated, challenges } => {
                let header_name = if accelerated { "www-authenticate" } else { "proxy-authenticate" };
                let status = if accelerated {
                    StatusCode::Unauthorized
                } else {
                    StatusCode::ProxyAuthenticationRequired
                };
                let mut resp = response.status(status);
                for challenge in &challenges {
                    resp = resp.header(header_name, challenge.as_str());
                }
                resp.body("")
            }
            AdmitDecision::AuthHelperBusy => response.status(StatusCode::ServiceUnavailable).body(""),
            AdmitDecision::CannotAuthenticate => response.status(StatusCode::Forbidden).body("Cannot authenticate"),
        }
    }
}

impl<H, S> crate::Handler<AuthConnState<S>> for AdmittingHandler<H, S>
where
    H: crate::Handler<AuthConnState<S>>,
    S: ConnectionData,
{
    async fn handle(&self, connection_data: &mut AuthConnState<S>, request: &Request, response: &mut Response) -> Handled {
        let src_addr = request.client_addr().ip();
        let dst_addr = self.destination_addr(request).await;
        let conn = ConnFacts {
            local_addr: request.server_addr().ip(),
            local_port: request.server_addr().port(),
            client_port: request.client_addr().port(),
        };

        let coordinator = RequestCoordinator::new(&self.ctx);
        let (decision, bound_user) = coordinator
            .admit(
                self.checkpoint,
                request,
                src_addr,
                dst_addr,
                conn,
                self.ports.intercepted,
                self.ports.accelerated,
                connection_data.auth_user.clone(),
            )
            .await;

        if bound_user.is_some() {
            connection_data.auth_user = bound_user;
        }

        match decision {
            AdmitDecision::Allowed => self.inner.handle(connection_data, request, response).await,
            other => self.render(other, response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_flags_default_to_plain_forward_proxy() {
        let flags = PortFlags::default();
        assert!(!flags.intercepted);
        assert!(!flags.accelerated);
    }
}
