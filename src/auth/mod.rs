//! Authentication manager (spec.md §4.5).

pub mod request;
pub mod scheme;
pub mod user;

use crate::{
    auth::{
        request::{AuthUserRequest, Direction},
        scheme::AuthScheme,
        user::UserCache,
    },
    coordinator::WorkerContext,
    http::request::Request,
};
use std::sync::Arc;

/// Selected header kind (spec.md §4.5 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// `Proxy-Authorization`, used on forward requests.
    Proxy,
    /// `Authorization`, used on accelerated requests.
    Origin,
}

/// Outcome of one driver pass (spec.md §4.5 step 4).
#[derive(Debug)]
pub enum AuthOutcome {
    Allowed(Arc<AuthUserRequest>),
    Challenge { header_kind: HeaderKind, challenges: Vec<String> },
    HelperBusy,
    CannotAuthenticate,
}

/// Registered schemes plus the process-wide user cache (spec.md §4.5).
pub struct AuthManager {
    pub schemes: Vec<AuthScheme>,
    pub user_cache: UserCache,
}

impl AuthManager {
    pub fn new(schemes: Vec<AuthScheme>, user_cache: UserCache) -> Self {
        Self { schemes, user_cache }
    }

    fn select_header<'a>(&self, request: &'a Request, intercepted: bool, accelerated: bool) -> Option<(HeaderKind, &'a [u8])> {
        if intercepted {
            return None; // spec.md §4.5 step 1: "reject on intercepted (transparent) connections".
        }
        let kind = if accelerated { HeaderKind::Origin } else { HeaderKind::Proxy };
        let name: &[u8] = match kind {
            HeaderKind::Proxy => b"proxy-authorization",
            HeaderKind::Origin => b"authorization",
        };
        request.header(name).map(|value| (kind, value))
    }

    /// Runs the driver algorithm of spec.md §4.5 for one request.
    pub async fn authenticate(
        &self,
        request: &Request,
        bound_user_request: Option<&AuthUserRequest>,
        intercepted: bool,
        accelerated: bool,
        ctx: &WorkerContext,
    ) -> AuthOutcome {
        let Some((header_kind, header_value)) = self.select_header(request, intercepted, accelerated) else {
            // No credentials on this request. spec.md §4.5 "Connection-oriented
            // bindings": "subsequent requests on the same connection reuse the
            // same user without another handshake" — a connection already
            // bound to a user answers from that binding instead of re-challenging.
            if !intercepted {
                if let Some(user) = bound_user_request.and_then(AuthUserRequest::user) {
                    return AuthOutcome::Allowed(self.rebind(bound_user_request.unwrap(), user, ctx));
                }
            }
            return AuthOutcome::Challenge {
                header_kind: HeaderKind::Proxy,
                challenges: self.schemes.iter().map(AuthScheme::challenge).collect(),
            };
        };
        let Ok(header_str) = std::str::from_utf8(header_value) else {
            return AuthOutcome::CannotAuthenticate;
        };

        // Step 2: a connection-bound user with matching credentials short-circuits.
        // `cached_reply` (spec.md §3 "the last-reply cache used to avoid
        // repeated authenticate() calls within one request") skips even the
        // `user()`/rebind bookkeeping once this exact binding has already
        // been resolved for these credentials.
        if let Some(bound) = bound_user_request {
            if !bound.credentials_changed(header_str) {
                if let Some(cached_ok) = bound.cached_reply() {
                    return if cached_ok {
                        match bound.user() {
                            Some(user) => AuthOutcome::Allowed(self.rebind(bound, user, ctx)),
                            None => AuthOutcome::CannotAuthenticate,
                        }
                    } else {
                        AuthOutcome::Challenge {
                            header_kind,
                            challenges: self.schemes.iter().map(AuthScheme::challenge).collect(),
                        }
                    };
                }
                if let Some(user) = bound.user() {
                    bound.cache_reply(true);
                    return AuthOutcome::Allowed(self.rebind(bound, user, ctx));
                }
            }
        }

        // Step 3: select scheme by case-insensitive prefix.
        let Some((scheme, credentials)) = self.match_scheme(header_str) else {
            return AuthOutcome::Challenge {
                header_kind,
                challenges: self.schemes.iter().map(AuthScheme::challenge).collect(),
            };
        };

        let Some((user_request, decoded)) = scheme.decode(credentials) else {
            return AuthOutcome::CannotAuthenticate;
        };

        match scheme.authenticate(&decoded, &user_request, ctx).await {
            Direction::Done => {
                user_request.set_direction(Direction::Done);
                user_request.cache_reply(true);
                if let Some(bound) = bound_user_request {
                    bound.credentials_changed(header_str);
                    bound.cache_reply(true);
                }
                AuthOutcome::Allowed(user_request)
            }
            Direction::ChallengeRequired => {
                if let Some(bound) = bound_user_request {
                    bound.cache_reply(false);
                }
                AuthOutcome::Challenge {
                    header_kind,
                    challenges: vec![scheme.challenge()],
                }
            }
            Direction::HelperBusy => AuthOutcome::HelperBusy,
            Direction::Broken => AuthOutcome::CannotAuthenticate,
        }
    }

    fn rebind(&self, _bound: &AuthUserRequest, user: Arc<user::AuthUser>, ctx: &WorkerContext) -> Arc<AuthUserRequest> {
        ctx.user_cache.touch(user.scheme, &user.name);
        let fresh = AuthUserRequest::new();
        fresh.set_user(user);
        fresh.set_direction(Direction::Done);
        fresh
    }

    fn match_scheme<'a>(&self, header: &'a str) -> Option<(&AuthScheme, &'a str)> {
        let (prefix, rest) = header.split_once(' ')?;
        self.schemes
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(prefix))
            .map(|s| (s, rest.trim()))
    }
}
