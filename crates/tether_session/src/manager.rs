//! Process-wide session registry.
//!
//! The [`SessionManager`] maps database paths to live sessions. Opening a
//! configuration yields a [`LocalHandle`]; every handle at the same path
//! shares one session. The registry itself lives as long as the manager or
//! any handle it gave out.

use crate::auth::{AccessToken, TokenProvider};
use crate::config::{ManagerConfig, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::reset::{self, ClientResetCoordinator};
use crate::session::{SessionHost, SessionId, SessionInner, SessionParts, SyncSession};
use crate::state::SessionEvent;
use crate::storage::{FileStorage, LocalStorage};
use crate::transport::{ConnectMode, FatalError, SyncTransport};
use crate::user::{AuthState, CredentialBinder, Credentials, User, UserId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Registry {
    sessions: HashMap<PathBuf, Arc<SessionInner>>,
    /// Paths whose next session starts from a full download.
    fresh: HashSet<PathBuf>,
    shut_down: bool,
}

struct ManagerShared {
    config: ManagerConfig,
    transport: Arc<dyn SyncTransport>,
    tokens: Arc<dyn TokenProvider>,
    storage: Arc<dyn LocalStorage>,
    binder: Arc<CredentialBinder>,
    resets: Arc<ClientResetCoordinator>,
    registry: Mutex<Registry>,
    self_ref: Weak<ManagerShared>,
}

impl ManagerShared {
    fn handle_closed(&self, session: &Arc<SessionInner>) {
        self.storage.release(session.path());
        let transition = session.close_handle();
        debug!(session = %session.id(), state = %transition.to, "local handle closed");
        session.after_transition(transition);
        self.session_settled(session);
    }
}

impl SessionHost for ManagerShared {
    fn session_settled(&self, session: &SessionInner) {
        let removed = {
            let mut registry = self.registry.lock();
            let registered = registry
                .sessions
                .get(session.path())
                .is_some_and(|s| s.id() == session.id());
            if !registered || !session.is_settled() {
                return;
            }
            registry.sessions.remove(session.path())
        };
        if removed.is_some() {
            self.binder.unbind(session);
            debug!(session = %session.id(), path = ?session.path(), "session torn down");
        }
    }

    fn execute_reset(
        &self,
        session_id: &SessionId,
        original: &Path,
        backup: &Path,
    ) -> SessionResult<()> {
        let removed = {
            let mut registry = self.registry.lock();
            reset::move_aside(self.storage.as_ref(), original, backup)?;
            registry.fresh.insert(original.to_path_buf());
            match registry.sessions.get(original) {
                Some(session) if session.id() == session_id => registry.sessions.remove(original),
                _ => None,
            }
        };
        if let Some(session) = removed {
            self.binder.unbind(&session);
        }
        Ok(())
    }
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        let sessions: Vec<_> = self.registry.get_mut().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let transition = session.apply(SessionEvent::Shutdown);
            session.after_transition(transition);
        }
    }
}

/// Opens sessions and owns the user bindings.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tether_session::{
///     Credentials, ManagerConfig, MockTransport, SessionConfig, SessionManager, SessionState,
///     StaticTokenProvider,
/// };
///
/// let dir = tempfile::tempdir().unwrap();
/// let manager = SessionManager::new(
///     ManagerConfig::new(dir.path()),
///     Arc::new(MockTransport::responsive()),
///     Arc::new(StaticTokenProvider::default()),
/// );
///
/// let user = manager.login(Credentials::new("alice"));
/// let handle = manager.open(&SessionConfig::new(&user, "partition")).unwrap();
/// assert_eq!(handle.session().state().unwrap(), SessionState::Active);
/// ```
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    /// Creates a manager storing database files on the local file system.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn SyncTransport>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self::with_storage(config, transport, tokens, Arc::new(FileStorage::new()))
    }

    /// Creates a manager with a custom storage collaborator.
    pub fn with_storage(
        config: ManagerConfig,
        transport: Arc<dyn SyncTransport>,
        tokens: Arc<dyn TokenProvider>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        let shared = Arc::new_cyclic(|self_ref: &Weak<ManagerShared>| {
            let host: Weak<dyn SessionHost> = self_ref.clone();
            let resets = Arc::new(ClientResetCoordinator::new(
                Arc::clone(&storage),
                config.recovery_dir_name.clone(),
                host,
            ));
            ManagerShared {
                config,
                transport,
                tokens,
                storage,
                binder: CredentialBinder::new(),
                resets,
                registry: Mutex::new(Registry::default()),
                self_ref: self_ref.clone(),
            }
        });
        info!(base_dir = ?shared.config.base_dir, "session manager created");
        Self { shared }
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// The user binder.
    pub fn binder(&self) -> &Arc<CredentialBinder> {
        &self.shared.binder
    }

    /// Logs a user in. See [`CredentialBinder::login`].
    pub fn login(&self, credentials: Credentials) -> Arc<User> {
        self.shared.binder.login(credentials)
    }

    /// Logs a user out. Every session of the user is inactive when this returns.
    pub fn logout(&self, user_id: &UserId) {
        self.shared.binder.logout(user_id);
    }

    /// Logs a user out and forgets it.
    pub fn remove_user(&self, user_id: &UserId) {
        self.shared.binder.remove_user(user_id);
    }

    /// The live `User` for an identity.
    pub fn user(&self, user_id: &UserId) -> Option<Arc<User>> {
        self.shared.binder.user(user_id)
    }

    /// Delivers a token that a [`TokenProvider`] left pending.
    pub fn access_token_refreshed(&self, user_id: &UserId, token: AccessToken) {
        self.shared.binder.access_token_refreshed(user_id, token);
    }

    /// Opens a local handle on the database described by `config`.
    ///
    /// The first handle at a path creates the session and starts it. Fails
    /// with [`SessionError::IllegalState`] if the user is not logged in or the
    /// manager was shut down. With
    /// [`initial_download`](SessionConfig::initial_download) set, a newly
    /// created session blocks until its first download completes.
    pub fn open(&self, config: &SessionConfig) -> SessionResult<LocalHandle> {
        let shared = &self.shared;
        if shared.binder.auth_state(&config.user_id) != AuthState::LoggedIn {
            return Err(SessionError::illegal_state(format!(
                "user {} is not logged in",
                config.user_id
            )));
        }
        let path = config.resolve_path(&shared.config);

        let (inner, transition, created) = {
            let mut registry = shared.registry.lock();
            if registry.shut_down {
                return Err(SessionError::illegal_state("session manager was shut down"));
            }
            shared.storage.acquire(&path)?;

            let (inner, created) = match registry.sessions.get(&path) {
                Some(inner) => (Arc::clone(inner), false),
                None => {
                    let fresh = registry.fresh.contains(&path);
                    let inner = self.create_session(config, path.clone(), fresh);
                    if let Err(err) = shared.binder.bind(&inner) {
                        shared.storage.release(&path);
                        return Err(err);
                    }
                    registry.fresh.remove(&path);
                    registry.sessions.insert(path.clone(), Arc::clone(&inner));
                    (inner, true)
                }
            };
            let transition = inner.open_handle();
            (inner, transition, created)
        };

        if created {
            info!(session = %inner.id(), path = ?path, "session created");
        }
        let handle = LocalHandle {
            shared: Arc::clone(shared),
            session: SyncSession::from_inner(Arc::clone(&inner)),
            open: true,
        };
        inner.after_transition(transition);
        if created {
            if let Some(timeout) = config.initial_download {
                inner.wait_for_download(Some(timeout))?;
            }
        }
        Ok(handle)
    }

    fn create_session(&self, config: &SessionConfig, path: PathBuf, fresh: bool) -> Arc<SessionInner> {
        let shared = &self.shared;
        let host: Weak<dyn SessionHost> = shared.self_ref.clone();
        SessionInner::new(SessionParts {
            path,
            user_id: config.user_id.clone(),
            partition: config.partition.clone(),
            stop_policy: config.stop_policy,
            error_handler: config.error_handler.clone(),
            mode: if fresh {
                ConnectMode::FreshDownload
            } else {
                ConnectMode::Resume
            },
            connection_callbacks: shared.config.connection_callbacks,
            unhandled_error_hook: shared.config.unhandled_error_hook.clone(),
            transport: Arc::clone(&shared.transport),
            tokens: Arc::clone(&shared.tokens),
            binder: Arc::downgrade(&shared.binder),
            resets: Arc::clone(&shared.resets),
            host,
        })
    }

    /// Every live session.
    pub fn sessions(&self) -> Vec<SyncSession> {
        self.shared
            .registry
            .lock()
            .sessions
            .values()
            .map(|inner| SyncSession::from_inner(Arc::clone(inner)))
            .collect()
    }

    /// The live session at `path`, if any.
    pub fn session(&self, path: &Path) -> Option<SyncSession> {
        self.shared
            .registry
            .lock()
            .sessions
            .get(path)
            .map(|inner| SyncSession::from_inner(Arc::clone(inner)))
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.registry.lock().sessions.len()
    }

    /// Delivers a synthetic client reset to `session`, as the transport would.
    pub fn simulate_client_reset(&self, session: &SyncSession) {
        warn!(session = %session.id(), "simulating client reset");
        session.inner().fatal_error(FatalError::ClientReset {
            original_path: session.path().to_path_buf(),
        });
    }

    /// Stops every session for good and refuses further opens.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut registry = self.shared.registry.lock();
            registry.shut_down = true;
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        info!(sessions = sessions.len(), "shutting down session manager");
        for session in sessions {
            let transition = session.apply(SessionEvent::Shutdown);
            session.after_transition(transition);
            self.shared.binder.unbind(&session);
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.shared.config)
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// An open local handle on a synchronized database.
///
/// Dropping the handle closes it. Once the last handle at a path is closed
/// the session's accessors fail and its stop policy applies.
pub struct LocalHandle {
    shared: Arc<ManagerShared>,
    session: SyncSession,
    open: bool,
}

impl LocalHandle {
    /// The session synchronizing this database.
    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// The database file.
    pub fn path(&self) -> &Path {
        self.session.path()
    }

    /// Records a local change and returns its version.
    pub fn commit(&self) -> SessionResult<u64> {
        self.session.inner().local_commit()
    }

    /// Closes the handle.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.open) {
            self.shared.handle_closed(self.session.inner());
        }
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHandle")
            .field("session", &self.session)
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::state::{SessionState, StopPolicy};
    use crate::transport::MockTransport;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::new(
            ManagerConfig::new(dir.path()),
            Arc::new(MockTransport::responsive()),
            Arc::new(StaticTokenProvider::default()),
        )
    }

    #[test]
    fn open_requires_logged_in_user() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let config = SessionConfig::for_user_id(UserId::from("nobody"), "p");
        let err = manager.open(&config).unwrap_err();
        assert!(matches!(err, SessionError::IllegalState { .. }));
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn handles_at_same_path_share_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager.login(Credentials::new("alice"));
        let config = SessionConfig::new(&user, "p");

        let a = manager.open(&config).unwrap();
        let b = manager.open(&config).unwrap();
        assert_eq!(a.session(), b.session());
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.session(a.path()).as_ref(), Some(a.session()));
    }

    #[test]
    fn last_handle_close_tears_down() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager.login(Credentials::new("alice"));
        let config = SessionConfig::new(&user, "p").with_stop_policy(StopPolicy::Immediately);

        let a = manager.open(&config).unwrap();
        let b = manager.open(&config).unwrap();
        let session = a.session().clone();
        a.close();
        assert_eq!(session.state().unwrap(), SessionState::Active);

        drop(b);
        assert!(session.state().unwrap_err().is_session_closed());
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.binder().bound_session_count(user.id()), 0);
    }

    #[test]
    fn never_policy_outlives_handles() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager.login(Credentials::new("alice"));
        let config = SessionConfig::new(&user, "p").with_stop_policy(StopPolicy::Never);

        let handle = manager.open(&config).unwrap();
        let path = handle.path().to_path_buf();
        drop(handle);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.session(&path).is_some());
    }

    #[test]
    fn shutdown_refuses_new_sessions() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let user = manager.login(Credentials::new("alice"));
        let handle = manager.open(&SessionConfig::new(&user, "p")).unwrap();

        manager.shutdown();
        assert_eq!(handle.session().state().unwrap(), SessionState::Inactive);
        handle.session().start().unwrap();
        assert_eq!(handle.session().state().unwrap(), SessionState::Inactive);
        assert!(manager.open(&SessionConfig::new(&user, "q")).is_err());
    }
}
