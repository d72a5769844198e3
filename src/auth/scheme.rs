//! Pluggable authentication schemes (spec.md §4.5).
//!
//! Squid registers schemes through a polymorphic `AuthScheme`/`AuthConfig`
//! pair. Only two concrete behaviors exist in this core (Basic, backed by a
//! credential-check helper; Digest, backed by a locally computed H(A1)/H(A2)
//! challenge-response) plus two connection-oriented schemes whose real
//! implementation needs an SSPI/GSSAPI backend this crate doesn't carry.
//! Four variants don't earn a `Box<dyn Trait>` plus `async-trait` — a sum
//! type (the same move the ACL term library makes, spec.md §9) keeps the
//! dispatch a plain `match` with native `async fn`.

use crate::{
    auth::{
        request::{AuthUserRequest, Direction},
        user::AuthUser,
    },
    coordinator::WorkerContext,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use md5::{Digest as Md5Digest, Md5};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BasicConfig {
    pub realm: String,
    /// Name of the registered [`crate::helper::pool::HelperPool`] that
    /// checks `user:pass` lines (Squid's `basic_ncsa`-style external helper).
    pub helper_pool: String,
}

#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub realm: String,
    /// Looks up a user's password for local H(A1) computation. A real
    /// deployment backs this with a helper too; kept as a sync callback
    /// table here since the core's job is the protocol, not credential
    /// storage (spec.md §1 treats the credential store as external).
    pub passwords: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum AuthScheme {
    Basic(BasicConfig),
    Digest(DigestConfig),
    /// Connection-oriented; real decode/authenticate needs an SSPI backend.
    Ntlm,
    /// Connection-oriented; real decode/authenticate needs a GSSAPI backend.
    Negotiate,
}

impl AuthScheme {
    pub fn name(&self) -> &'static str {
        match self {
            AuthScheme::Basic(_) => "Basic",
            AuthScheme::Digest(_) => "Digest",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Negotiate => "Negotiate",
        }
    }

    pub fn is_connection_oriented(&self) -> bool {
        matches!(self, AuthScheme::Ntlm | AuthScheme::Negotiate)
    }

    /// `fixHeader`: builds the challenge value for `WWW-Authenticate`/
    /// `Proxy-Authenticate` (spec.md §4.5).
    pub fn challenge(&self) -> String {
        match self {
            AuthScheme::Basic(cfg) => format!(r#"Basic realm="{}""#, cfg.realm),
            AuthScheme::Digest(cfg) => format!(r#"Digest realm="{}", nonce="{}""#, cfg.realm, "placeholder-nonce"),
            AuthScheme::Ntlm => "NTLM".to_owned(),
            AuthScheme::Negotiate => "Negotiate".to_owned(),
        }
    }

    /// `decode(header)`: parses the scheme-prefixed credentials into a
    /// fresh [`AuthUserRequest`], without yet validating them.
    pub fn decode(&self, credentials: &str) -> Option<(Arc<AuthUserRequest>, DecodedCreds)> {
        let request = AuthUserRequest::new();
        match self {
            AuthScheme::Basic(_) => {
                let raw = STANDARD.decode(credentials).ok()?;
                let text = String::from_utf8(raw).ok()?;
                let (user, pass) = text.split_once(':')?;
                Some((request, DecodedCreds::Basic { user: user.to_owned(), pass: pass.to_owned() }))
            }
            AuthScheme::Digest(_) => {
                let fields = parse_digest_fields(credentials);
                let (username, response) = (fields.get("username")?.clone(), fields.get("response")?.clone());
                Some((request, DecodedCreds::Digest { username, response, fields }))
            }
            AuthScheme::Ntlm | AuthScheme::Negotiate => None,
        }
    }

    /// `authenticate()`: validates credentials and returns `direction()`
    /// per spec.md §4.5's driver algorithm step 4.
    pub async fn authenticate(
        &self,
        creds: &DecodedCreds,
        request: &AuthUserRequest,
        ctx: &WorkerContext,
    ) -> Direction {
        match (self, creds) {
            (AuthScheme::Basic(cfg), DecodedCreds::Basic { user, pass }) => {
                let line = format!("{user} {pass}");
                match ctx.helpers.get(&cfg.helper_pool) {
                    Some(pool) => match pool.submit(line).await {
                        Ok(reply) if reply.ok => {
                            let authed = ctx.user_cache.get_or_insert("Basic", user);
                            request.set_user(authed);
                            Direction::Done
                        }
                        Ok(_) => Direction::ChallengeRequired,
                        Err(_) => Direction::Broken,
                    },
                    None => Direction::Broken,
                }
            }
            (AuthScheme::Digest(cfg), DecodedCreds::Digest { username, response, fields }) => {
                match cfg.passwords.get(username) {
                    Some(password) => {
                        let expected = digest_response(username, &cfg.realm, password, fields);
                        if &expected == response {
                            let authed = ctx.user_cache.get_or_insert("Digest", username);
                            request.set_user(authed);
                            Direction::Done
                        } else {
                            Direction::ChallengeRequired
                        }
                    }
                    None => Direction::ChallengeRequired,
                }
            }
            _ => Direction::Broken,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DecodedCreds {
    Basic { user: String, pass: String },
    Digest {
        username: String,
        response: String,
        fields: std::collections::HashMap<String, String>,
    },
}

fn parse_digest_fields(input: &str) -> std::collections::HashMap<String, String> {
    let mut fields = std::collections::HashMap::new();
    for part in input.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('"');
            fields.insert(key.trim().to_ascii_lowercase(), value.to_owned());
        }
    }
    fields
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// RFC 2617 digest response: `H(H(user:realm:pass):nonce:H(method:uri))`.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    fields: &std::collections::HashMap<String, String>,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let method = fields.get("method").map(String::as_str).unwrap_or("GET");
    let uri = fields.get("uri").map(String::as_str).unwrap_or("/");
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let nonce = fields.get("nonce").map(String::as_str).unwrap_or("");
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// `AuthUser` convenience re-export so callers matching on the enum above
/// don't need a second `use` for the type they just got back.
pub type User = AuthUser;
