//! Per-HTTP-request authentication state (spec.md §3 "Auth-user-request").

use crate::auth::user::AuthUser;
use std::sync::{Arc, Mutex};

/// `direction()` outcome reported by a scheme's `authenticate()` (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `-2`: fatal scheme error.
    Broken,
    /// `-1`: helper round-trip in progress.
    HelperBusy,
    /// `0`: credentials validated.
    Done,
    /// `1`: a challenge must be sent to the client.
    ChallengeRequired,
}

pub struct AuthUserRequest {
    user: Mutex<Option<Arc<AuthUser>>>,
    /// Last credentials seen on the bound connection, for connection-oriented
    /// schemes (NTLM/Negotiate) that must detect a mid-connection identity
    /// change (spec.md §4.5 "Connection-oriented bindings").
    last_credentials: Mutex<Option<String>>,
    direction: Mutex<Direction>,
    deny_message: Mutex<Option<String>>,
    /// Avoids repeated `authenticate()` calls within one request (spec.md §3).
    last_reply_cache: Mutex<Option<bool>>,
}

impl AuthUserRequest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            user: Mutex::new(None),
            last_credentials: Mutex::new(None),
            direction: Mutex::new(Direction::ChallengeRequired),
            deny_message: Mutex::new(None),
            last_reply_cache: Mutex::new(None),
        })
    }

    pub fn user(&self) -> Option<Arc<AuthUser>> {
        self.user.lock().unwrap().clone()
    }

    pub fn set_user(&self, user: Arc<AuthUser>) {
        *self.user.lock().unwrap() = Some(user);
    }

    pub fn direction(&self) -> Direction {
        *self.direction.lock().unwrap()
    }

    pub fn set_direction(&self, direction: Direction) {
        *self.direction.lock().unwrap() = direction;
    }

    pub fn deny_message(&self) -> Option<String> {
        self.deny_message.lock().unwrap().clone()
    }

    pub fn set_deny_message(&self, message: impl Into<String>) {
        *self.deny_message.lock().unwrap() = Some(message.into());
    }

    /// `true` if `credentials` differ from what this connection last
    /// presented — the trigger for the mid-connection TCP-reset rule
    /// (spec.md §4.5).
    pub fn credentials_changed(&self, credentials: &str) -> bool {
        let mut last = self.last_credentials.lock().unwrap();
        let changed = last.as_deref() != Some(credentials);
        *last = Some(credentials.to_owned());
        changed
    }

    pub fn cached_reply(&self) -> Option<bool> {
        *self.last_reply_cache.lock().unwrap()
    }

    pub fn cache_reply(&self, ok: bool) {
        *self.last_reply_cache.lock().unwrap() = Some(ok);
    }
}
