//! Users and the binding between users and their sessions.
//!
//! The [`CredentialBinder`] owns the `user -> sessions` fan-out set. All
//! binding changes, logins, logouts and token deliveries go through its one
//! lock, and state transitions of bound sessions are applied while holding
//! it. Anyone reading a session's state after `logout` returns therefore
//! sees the logged-out state. Connection side effects run after the lock is
//! released.

use crate::auth::AccessToken;
use crate::error::{SessionError, SessionResult};
use crate::session::SessionInner;
use crate::state::{SessionEvent, Transition};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Stable identity of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    /// Creates a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Authentication state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Sessions may run.
    LoggedIn,
    /// Every bound session is inactive.
    LoggedOut,
}

/// What the authentication layer hands over on login.
#[derive(Debug, Clone)]
pub struct Credentials {
    user_id: UserId,
    access_token: Option<AccessToken>,
}

impl Credentials {
    /// Credentials for `user_id` without a cached access token.
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: None,
        }
    }

    /// Attaches an access token obtained during login.
    pub fn with_access_token(mut self, token: AccessToken) -> Self {
        self.access_token = Some(token);
        self
    }

    /// The user these credentials belong to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

/// A user identity.
///
/// A `User` does not own its sessions; it is a handle into the binder.
/// Dropping every `Arc<User>` does not affect bound sessions.
pub struct User {
    id: UserId,
    binder: Weak<CredentialBinder>,
}

impl User {
    /// The user's id.
    pub fn id(&self) -> &UserId {
        &self.id
    }

    /// Current authentication state.
    pub fn auth_state(&self) -> AuthState {
        self.binder
            .upgrade()
            .map_or(AuthState::LoggedOut, |binder| binder.auth_state(&self.id))
    }

    /// Returns true if logged in.
    pub fn is_logged_in(&self) -> bool {
        self.auth_state() == AuthState::LoggedIn
    }

    /// The cached access token, if any and still valid.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.binder
            .upgrade()
            .and_then(|binder| binder.cached_token(&self.id))
    }

    /// Logs the user out. Every bound session is inactive when this returns.
    pub fn log_out(&self) {
        if let Some(binder) = self.binder.upgrade() {
            binder.logout(&self.id);
        }
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("auth_state", &self.auth_state())
            .finish()
    }
}

struct Binding {
    user: Weak<User>,
    auth: AuthState,
    token: Option<AccessToken>,
    sessions: Vec<Weak<SessionInner>>,
}

impl Binding {
    fn live_sessions(&mut self) -> Vec<Arc<SessionInner>> {
        self.sessions.retain(|s| s.strong_count() > 0);
        self.sessions.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Associates sessions with user identities and fans auth changes out.
pub struct CredentialBinder {
    bindings: Mutex<HashMap<UserId, Binding>>,
    self_ref: Weak<CredentialBinder>,
}

impl CredentialBinder {
    /// Creates an empty binder.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            bindings: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Logs a user in and revives every session suspended by its logout.
    ///
    /// Returns the live `User` for this identity if one exists, otherwise a
    /// new one.
    pub fn login(&self, credentials: Credentials) -> Arc<User> {
        let Credentials {
            user_id,
            access_token,
        } = credentials;

        let (user, revived) = {
            let mut bindings = self.bindings.lock();
            let binding = bindings.entry(user_id.clone()).or_insert_with(|| Binding {
                user: Weak::new(),
                auth: AuthState::LoggedOut,
                token: None,
                sessions: Vec::new(),
            });

            let user = match binding.user.upgrade() {
                Some(user) => user,
                None => {
                    let user = Arc::new(User {
                        id: user_id.clone(),
                        binder: self.self_ref.clone(),
                    });
                    binding.user = Arc::downgrade(&user);
                    user
                }
            };

            binding.auth = AuthState::LoggedIn;
            if access_token.is_some() {
                binding.token = access_token;
            }

            let revived = fan_out(binding, SessionEvent::Login);
            (user, revived)
        };

        info!(user = %user_id, sessions = revived.len(), "user logged in");
        run_side_effects(revived);
        user
    }

    /// Logs a user out. Every bound session is inactive when this returns.
    pub fn logout(&self, user_id: &UserId) {
        let stopped = {
            let mut bindings = self.bindings.lock();
            let Some(binding) = bindings.get_mut(user_id) else {
                debug!(user = %user_id, "logout of unknown user ignored");
                return;
            };
            binding.auth = AuthState::LoggedOut;
            binding.token = None;
            fan_out(binding, SessionEvent::Logout)
        };

        info!(user = %user_id, sessions = stopped.len(), "user logged out");
        run_side_effects(stopped);
    }

    /// Logs a user out and forgets the identity and its bindings.
    pub fn remove_user(&self, user_id: &UserId) {
        let stopped = {
            let mut bindings = self.bindings.lock();
            let Some(mut binding) = bindings.remove(user_id) else {
                return;
            };
            fan_out(&mut binding, SessionEvent::Logout)
        };

        info!(user = %user_id, "user removed");
        run_side_effects(stopped);
    }

    /// Stores a refreshed token and activates every waiting session of the user.
    pub fn access_token_refreshed(&self, user_id: &UserId, token: AccessToken) {
        let activated = {
            let mut bindings = self.bindings.lock();
            let Some(binding) = bindings.get_mut(user_id) else {
                debug!(user = %user_id, "token for unknown user dropped");
                return;
            };
            if binding.auth != AuthState::LoggedIn {
                debug!(user = %user_id, "token for logged out user dropped");
                return;
            }
            binding.token = Some(token.clone());
            binding
                .live_sessions()
                .into_iter()
                .map(|session| {
                    let transition = session.token_acquired(token.clone());
                    (session, transition)
                })
                .collect::<Vec<_>>()
        };

        debug!(user = %user_id, sessions = activated.len(), "access token refreshed");
        run_side_effects(activated);
    }

    /// Binds a session to its user. Fails if the user is unknown or logged out.
    pub(crate) fn bind(&self, session: &Arc<SessionInner>) -> SessionResult<()> {
        let mut bindings = self.bindings.lock();
        let binding = bindings
            .get_mut(session.user_id())
            .filter(|b| b.auth == AuthState::LoggedIn)
            .ok_or_else(|| {
                SessionError::illegal_state(format!(
                    "user {} is not logged in",
                    session.user_id()
                ))
            })?;
        binding.sessions.push(Arc::downgrade(session));
        Ok(())
    }

    /// Removes a session from its user's fan-out set.
    pub(crate) fn unbind(&self, session: &SessionInner) {
        let mut bindings = self.bindings.lock();
        if let Some(binding) = bindings.get_mut(session.user_id()) {
            binding
                .sessions
                .retain(|s| s.upgrade().is_some_and(|s| s.id() != session.id()));
        }
    }

    /// The live `User` for an identity, if the application still holds one.
    pub fn user(&self, user_id: &UserId) -> Option<Arc<User>> {
        self.bindings
            .lock()
            .get(user_id)
            .and_then(|b| b.user.upgrade())
    }

    /// Authentication state of an identity. Unknown identities are logged out.
    pub fn auth_state(&self, user_id: &UserId) -> AuthState {
        self.bindings
            .lock()
            .get(user_id)
            .map_or(AuthState::LoggedOut, |b| b.auth)
    }

    /// The cached, still valid access token of an identity.
    pub fn cached_token(&self, user_id: &UserId) -> Option<AccessToken> {
        self.bindings
            .lock()
            .get(user_id)
            .and_then(|b| b.token.clone())
            .filter(AccessToken::is_valid)
    }

    /// Number of live sessions bound to an identity.
    pub fn bound_session_count(&self, user_id: &UserId) -> usize {
        self.bindings
            .lock()
            .get_mut(user_id)
            .map_or(0, |b| b.live_sessions().len())
    }
}

impl fmt::Debug for CredentialBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBinder")
            .field("users", &self.bindings.lock().len())
            .finish()
    }
}

fn fan_out(binding: &mut Binding, event: SessionEvent) -> Vec<(Arc<SessionInner>, Transition)> {
    binding
        .live_sessions()
        .into_iter()
        .map(|session| {
            let transition = session.apply(event);
            (session, transition)
        })
        .collect()
}

fn run_side_effects(transitions: Vec<(Arc<SessionInner>, Transition)>) {
    for (session, transition) in transitions {
        session.after_transition(transition);
    }
}
