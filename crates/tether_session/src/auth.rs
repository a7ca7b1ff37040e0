//! Access tokens and the token provider seam.

use crate::user::UserId;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// A short-lived token that authorizes a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    /// Creates a token that never expires.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    /// Creates a token that expires after `ttl`.
    pub fn expiring_in(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Some(Instant::now() + ttl),
        }
    }

    /// The raw token value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns false once the token expired.
    pub fn is_valid(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outcome of asking for an access token.
#[derive(Debug, Clone)]
pub enum TokenRequest {
    /// The token is available right away.
    Ready(AccessToken),
    /// The token will be delivered later through
    /// [`SessionManager::access_token_refreshed`](crate::SessionManager::access_token_refreshed).
    Pending,
}

/// Authentication collaborator that refreshes access tokens.
pub trait TokenProvider: Send + Sync {
    /// Requests a fresh access token for `user`.
    ///
    /// Must not call back into the session manager synchronously.
    fn request_access_token(&self, user: &UserId) -> TokenRequest;
}

/// Provider that hands out the same token immediately.
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    /// Creates a provider returning `token` for every user.
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

impl Default for StaticTokenProvider {
    fn default() -> Self {
        Self::new(AccessToken::new("static-token"))
    }
}

impl TokenProvider for StaticTokenProvider {
    fn request_access_token(&self, _user: &UserId) -> TokenRequest {
        TokenRequest::Ready(self.token.clone())
    }
}

/// Provider whose requests always stay pending, for driving refreshes by hand.
#[derive(Debug, Default)]
pub struct ManualTokenProvider {
    requests: Mutex<Vec<UserId>>,
}

impl ManualTokenProvider {
    /// Creates a provider with no recorded requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Users a token was requested for, in request order.
    pub fn requests(&self) -> Vec<UserId> {
        self.requests.lock().clone()
    }
}

impl TokenProvider for ManualTokenProvider {
    fn request_access_token(&self, user: &UserId) -> TokenRequest {
        self.requests.lock().push(user.clone());
        TokenRequest::Pending
    }
}
