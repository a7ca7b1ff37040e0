//! The session facade and its shared core.
//!
//! A [`SyncSession`] is a cheap, cloneable view of one session. The session
//! itself lives in the manager's registry for as long as a local handle is
//! open on its file, or longer while it still has work to do.
//!
//! # Locking
//!
//! - `core` guards the logical state machine and the handle count. It is never
//!   held while calling out (transport, token provider, listeners).
//! - `serial` is a reentrant lock that orders connection reconciliation and
//!   transport connection events, so listeners observe transitions in the
//!   order they happened. A transport may report events from inside
//!   `connect` on the same thread.
//! - Lock order is `serial`, then the manager registry, then the binder,
//!   then `core`.

use crate::auth::{AccessToken, TokenProvider, TokenRequest};
use crate::config::PartitionValue;
use crate::connection::{ConnectionChange, ConnectionState, ConnectionStateTracker};
use crate::error::{SessionError, SessionResult};
use crate::listener::{ConnectionListener, ErrorHandler, ListenerRegistry, UnhandledErrorHook};
use crate::progress::{Progress, ProgressTracker};
use crate::reset::{ClientResetCoordinator, SessionErrorEvent};
use crate::state::{SessionEvent, SessionState, SessionStateMachine, StopPolicy, Transition};
use crate::transport::{ConnectMode, ConnectRequest, FatalError, SessionEvents, SyncTransport};
use crate::user::{CredentialBinder, User, UserId};
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of sessions: told when a session may be torn down and performs
/// client reset file moves.
pub(crate) trait SessionHost: Send + Sync {
    /// A session reached `Inactive` or lost its last handle.
    fn session_settled(&self, session: &SessionInner);

    /// Moves a reset session's file aside and prepares a fresh download.
    fn execute_reset(&self, session_id: &SessionId, original: &Path, backup: &Path)
        -> SessionResult<()>;
}

/// Everything needed to build a session.
pub(crate) struct SessionParts {
    pub(crate) path: PathBuf,
    pub(crate) user_id: UserId,
    pub(crate) partition: PartitionValue,
    pub(crate) stop_policy: StopPolicy,
    pub(crate) error_handler: Option<Arc<dyn ErrorHandler>>,
    pub(crate) mode: ConnectMode,
    pub(crate) connection_callbacks: bool,
    pub(crate) unhandled_error_hook: Option<UnhandledErrorHook>,
    pub(crate) transport: Arc<dyn SyncTransport>,
    pub(crate) tokens: Arc<dyn TokenProvider>,
    pub(crate) binder: Weak<CredentialBinder>,
    pub(crate) resets: Arc<ClientResetCoordinator>,
    pub(crate) host: Weak<dyn SessionHost>,
}

struct SessionCore {
    machine: SessionStateMachine,
    open_handles: usize,
    token: Option<AccessToken>,
    connect_requested: bool,
    mode: ConnectMode,
    reset_delivered: bool,
}

enum ConnectionAction {
    Connect(ConnectRequest),
    Disconnect,
}

/// Shared state of one session.
pub(crate) struct SessionInner {
    id: SessionId,
    path: PathBuf,
    user_id: UserId,
    partition: PartitionValue,
    core: Mutex<SessionCore>,
    serial: ReentrantMutex<()>,
    connection: ConnectionStateTracker,
    progress: Arc<ProgressTracker>,
    connection_listeners: ListenerRegistry<dyn ConnectionListener>,
    error_handlers: ListenerRegistry<dyn ErrorHandler>,
    connection_callbacks: bool,
    transport: Arc<dyn SyncTransport>,
    tokens: Arc<dyn TokenProvider>,
    binder: Weak<CredentialBinder>,
    resets: Arc<ClientResetCoordinator>,
    host: Weak<dyn SessionHost>,
    self_ref: Weak<SessionInner>,
}

impl SessionInner {
    pub(crate) fn new(parts: SessionParts) -> Arc<Self> {
        let SessionParts {
            path,
            user_id,
            partition,
            stop_policy,
            error_handler,
            mode,
            connection_callbacks,
            unhandled_error_hook,
            transport,
            tokens,
            binder,
            resets,
            host,
        } = parts;

        let error_handlers = ListenerRegistry::with_hook(unhandled_error_hook.clone());
        if let Some(handler) = error_handler {
            error_handlers.add(handler);
        }

        Arc::new_cyclic(|self_ref| Self {
            id: SessionId::new(),
            path,
            user_id,
            partition,
            core: Mutex::new(SessionCore {
                machine: SessionStateMachine::new(stop_policy),
                open_handles: 0,
                token: None,
                connect_requested: false,
                mode,
                reset_delivered: false,
            }),
            serial: ReentrantMutex::new(()),
            connection: ConnectionStateTracker::new(),
            progress: ProgressTracker::new(),
            connection_listeners: ListenerRegistry::with_hook(unhandled_error_hook),
            error_handlers,
            connection_callbacks,
            transport,
            tokens,
            binder,
            resets,
            host,
            self_ref: self_ref.clone(),
        })
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.core.lock().machine.state()
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.core.lock().open_handles == 0 {
            return Err(SessionError::session_closed());
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.core.lock().open_handles > 0
    }

    /// True once nothing keeps the session alive: no handles, stopped, not
    /// waiting to be revived by a login, and no client reset outstanding.
    pub(crate) fn is_settled(&self) -> bool {
        let core = self.core.lock();
        core.open_handles == 0
            && core.machine.state() == SessionState::Inactive
            && !core.machine.revives_on_login()
            && !core.reset_delivered
    }

    /// Applies an event to the state machine. Side effects are left to
    /// [`after_transition`](Self::after_transition).
    pub(crate) fn apply(&self, event: SessionEvent) -> Transition {
        let mut core = self.core.lock();
        if matches!(event, SessionEvent::Logout) {
            core.token = None;
        }
        let transition = core.machine.apply(event);
        if transition.changed() {
            debug!(session = %self.id, ?event, from = %transition.from, to = %transition.to, "applied session event");
        }
        transition
    }

    /// Stores a token and moves a waiting session to `Active`.
    pub(crate) fn token_acquired(&self, token: AccessToken) -> Transition {
        let mut core = self.core.lock();
        core.token = Some(token);
        core.machine.apply(SessionEvent::TokenAcquired)
    }

    /// Starts the session with whatever token is cached, returning the overall transition.
    fn activate(&self, cached: Option<AccessToken>) -> Transition {
        let mut core = self.core.lock();
        let from = core.machine.state();
        let has_token = cached.is_some();
        if let Some(token) = cached {
            core.token = Some(token);
        }
        core.machine.apply(SessionEvent::Start { has_token });
        if has_token {
            core.machine.apply(SessionEvent::TokenAcquired);
        }
        Transition {
            from,
            to: core.machine.state(),
        }
    }

    fn cached_token(&self) -> Option<AccessToken> {
        self.binder
            .upgrade()
            .and_then(|binder| binder.cached_token(&self.user_id))
    }

    /// Runs the side effects of a transition: token requests, connection
    /// reconciliation, and teardown notification.
    pub(crate) fn after_transition(&self, transition: Transition) {
        if transition.changed() {
            info!(
                session = %self.id,
                from = %transition.from,
                to = %transition.to,
                "session state changed"
            );
        }
        self.reconcile();
        if transition.to == SessionState::WaitingForAccessToken {
            self.request_token();
        }
        if transition.entered(SessionState::Inactive) {
            self.notify_settled();
        }
    }

    fn notify_settled(&self) {
        if let Some(host) = self.host.upgrade() {
            host.session_settled(self);
        }
    }

    /// Asks for a token: the binder's cache first, then the provider.
    pub(crate) fn request_token(&self) {
        if self.state() != SessionState::WaitingForAccessToken {
            return;
        }
        if let Some(token) = self.cached_token() {
            let transition = self.token_acquired(token);
            self.after_transition(transition);
            return;
        }

        match self.tokens.request_access_token(&self.user_id) {
            TokenRequest::Ready(token) => match self.binder.upgrade() {
                Some(binder) => binder.access_token_refreshed(&self.user_id, token),
                None => {
                    let transition = self.token_acquired(token);
                    self.after_transition(transition);
                }
            },
            TokenRequest::Pending => {
                debug!(session = %self.id, user = %self.user_id, "waiting for access token");
            }
        }
    }

    /// Brings the transport in line with the logical state.
    fn reconcile(&self) {
        let _serial = self.serial.lock();

        let (action, pending) = {
            let mut core = self.core.lock();
            let wants = core.machine.state().wants_connection();
            let action = if wants && !core.connect_requested {
                match core.token.clone() {
                    Some(token) => {
                        core.connect_requested = true;
                        let mode = std::mem::replace(&mut core.mode, ConnectMode::Resume);
                        Some(ConnectionAction::Connect(ConnectRequest {
                            session_id: self.id.clone(),
                            user_id: self.user_id.clone(),
                            path: self.path.clone(),
                            partition: self.partition.clone(),
                            token,
                            mode,
                        }))
                    }
                    None => {
                        warn!(session = %self.id, "active session has no access token");
                        None
                    }
                }
            } else if !wants && core.connect_requested {
                core.connect_requested = false;
                Some(ConnectionAction::Disconnect)
            } else {
                None
            };
            (action, self.progress.snapshot())
        };

        match action {
            Some(ConnectionAction::Connect(request)) => {
                debug!(session = %self.id, mode = ?request.mode, "connecting");
                self.transport
                    .connect(SessionEvents::new(self.id.clone(), self.self_ref.clone()), request);
                if pending.has_pending_uploads() {
                    self.transport.local_commit(&self.id, pending.local_committed);
                }
            }
            Some(ConnectionAction::Disconnect) => {
                debug!(session = %self.id, "disconnecting");
                self.transport.disconnect(&self.id);
                if let Some(change) = self.connection.transition(ConnectionState::Disconnected) {
                    self.notify_connection(change);
                }
            }
            None => {}
        }
    }

    /// Connection event reported by the transport.
    pub(crate) fn connection_event(&self, new: ConnectionState) {
        let _serial = self.serial.lock();
        if new != ConnectionState::Disconnected && !self.core.lock().connect_requested {
            debug!(session = %self.id, state = %new, "ignored connection event for stopped session");
            return;
        }
        if let Some(change) = self.connection.transition(new) {
            self.notify_connection(change);
        }
    }

    fn notify_connection(&self, change: ConnectionChange) {
        debug!(session = %self.id, old = %change.old, new = %change.new, "connection state changed");
        if self.connection_callbacks {
            self.connection_listeners
                .dispatch(|listener| listener.on_change(change.old, change.new));
        }
    }

    pub(crate) fn upload_acknowledged(&self, version: u64) {
        if self.progress.upload_acknowledged(version) {
            let transition = self.apply(SessionEvent::UploadsDrained);
            if transition.changed() {
                self.after_transition(transition);
            }
        }
    }

    pub(crate) fn download_progress(&self, downloaded: u64, remote_known: u64) {
        self.progress.download_progress(downloaded, remote_known);
    }

    pub(crate) fn fatal_error(&self, error: FatalError) {
        match error {
            FatalError::ClientReset { original_path } => {
                if let Some(session) = self.self_ref.upgrade() {
                    self.resets.deliver(&session, original_path);
                }
            }
            FatalError::Other { code, message } => {
                warn!(session = %self.id, code, %message, "fatal sync error");
                self.freeze();
                self.dispatch_error(SessionErrorEvent::Fatal { code, message });
            }
        }
    }

    /// Moves the session to `Inactive` for good.
    pub(crate) fn freeze(&self) {
        let transition = self.apply(SessionEvent::Fatal);
        self.after_transition(transition);
    }

    /// Marks a client reset as delivered. Returns false if one already was.
    pub(crate) fn begin_reset(&self) -> bool {
        let mut core = self.core.lock();
        !std::mem::replace(&mut core.reset_delivered, true)
    }

    /// Hands an error to the session's error handlers. Returns false if no
    /// handler was registered.
    pub(crate) fn dispatch_error(&self, event: SessionErrorEvent) -> bool {
        let Some(inner) = self.self_ref.upgrade() else {
            return false;
        };
        if self.error_handlers.is_empty() {
            warn!(session = %self.id, error = %event.to_error(), "no error handler registered");
            return false;
        }
        let session = SyncSession { inner };
        self.error_handlers
            .dispatch(|handler| handler.on_error(&session, &event));
        true
    }

    /// Drops an undelivered client reset. The session stays frozen and is
    /// torn down once its last handle closes; a later open starts a new one.
    pub(crate) fn abandon_reset(&self) {
        self.core.lock().reset_delivered = false;
        self.notify_settled();
    }

    /// Counts a new local handle. The first handle (re)starts the session.
    pub(crate) fn open_handle(&self) -> Transition {
        let first = {
            let mut core = self.core.lock();
            core.open_handles += 1;
            core.open_handles == 1
        };
        if !first {
            let state = self.state();
            return Transition {
                from: state,
                to: state,
            };
        }
        self.activate(self.cached_token())
    }

    /// Counts a handle less. The last handle applies the stop policy.
    pub(crate) fn close_handle(&self) -> Transition {
        let pending_uploads = self.progress.has_pending_uploads();
        let mut core = self.core.lock();
        core.open_handles = core.open_handles.saturating_sub(1);
        if core.open_handles > 0 {
            let state = core.machine.state();
            return Transition {
                from: state,
                to: state,
            };
        }
        core.machine.apply(SessionEvent::Close { pending_uploads })
    }

    pub(crate) fn local_commit(&self) -> SessionResult<u64> {
        self.ensure_open()?;
        let version = self.progress.record_local_commit();
        if self.core.lock().connect_requested {
            self.transport.local_commit(&self.id, version);
        }
        Ok(version)
    }

    pub(crate) fn wait_for_download(&self, timeout: Option<Duration>) -> SessionResult<()> {
        self.progress.wait_for_download(timeout)
    }
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to one synchronized database.
///
/// Clones refer to the same session. Two sessions are equal if they are the
/// same session, whatever their configuration.
///
/// Every state accessor and operation fails with
/// [`SessionError::IllegalState`] once the last local handle on the database
/// closed. Identity accessors ([`id`](Self::id), [`path`](Self::path),
/// [`user_id`](Self::user_id), [`user`](Self::user) and
/// [`partition`](Self::partition)) keep answering: they describe which
/// session it was, not what it is doing.
#[derive(Clone)]
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Identity of the session.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Local database file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Owner of the session.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The live user the session is bound to, if it is still known.
    pub fn user(&self) -> Option<Arc<User>> {
        self.inner
            .binder
            .upgrade()
            .and_then(|binder| binder.user(&self.inner.user_id))
    }

    /// Synchronized partition.
    pub fn partition(&self) -> &PartitionValue {
        &self.inner.partition
    }

    /// Logical state.
    pub fn state(&self) -> SessionResult<SessionState> {
        self.inner.ensure_open()?;
        Ok(self.inner.state())
    }

    /// Stop policy the session was opened with.
    pub fn stop_policy(&self) -> SessionResult<StopPolicy> {
        self.inner.ensure_open()?;
        Ok(self.inner.core.lock().machine.stop_policy())
    }

    /// Network connection state.
    pub fn connection_state(&self) -> SessionResult<ConnectionState> {
        self.inner.ensure_open()?;
        Ok(self.inner.connection.get())
    }

    /// Returns true if the connection state is `Connected`.
    pub fn is_connected(&self) -> SessionResult<bool> {
        self.inner.ensure_open()?;
        Ok(self.inner.connection.is_connected())
    }

    /// Upload and download progress.
    pub fn progress(&self) -> SessionResult<Progress> {
        self.inner.ensure_open()?;
        Ok(self.inner.progress.snapshot())
    }

    /// Starts the session. A no-op if it is already active or waiting.
    pub fn start(&self) -> SessionResult<()> {
        self.inner.ensure_open()?;
        let transition = self.inner.activate(self.inner.cached_token());
        self.inner.after_transition(transition);
        Ok(())
    }

    /// Stops the session according to its stop policy. A no-op if already stopped.
    pub fn stop(&self) -> SessionResult<()> {
        self.inner.ensure_open()?;
        let pending_uploads = self.inner.progress.has_pending_uploads();
        let transition = self.inner.apply(SessionEvent::Stop { pending_uploads });
        self.inner.after_transition(transition);
        Ok(())
    }

    /// Registers a connection listener. Returns false if it was already registered.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> SessionResult<bool> {
        self.inner.ensure_open()?;
        Ok(self.inner.connection_listeners.add(listener))
    }

    /// Removes a connection listener. Returns false if it was not registered.
    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.inner.connection_listeners.remove(listener)
    }

    /// Registers an additional error handler.
    pub fn add_error_handler(&self, handler: Arc<dyn ErrorHandler>) -> SessionResult<bool> {
        self.inner.ensure_open()?;
        Ok(self.inner.error_handlers.add(handler))
    }

    /// Removes an error handler.
    pub fn remove_error_handler(&self, handler: &Arc<dyn ErrorHandler>) -> bool {
        self.inner.error_handlers.remove(handler)
    }

    /// Blocks until every change committed before the call is acknowledged
    /// by the remote service.
    ///
    /// Fails with [`SessionError::Interrupted`] if the calling thread is
    /// interrupted (the interruption is consumed), or with
    /// [`SessionError::Timeout`] once `timeout` elapses.
    pub fn upload_all_local_changes(&self, timeout: Option<Duration>) -> SessionResult<()> {
        self.inner.ensure_open()?;
        self.inner.progress.wait_for_upload(timeout)
    }

    /// Blocks until every change known to the remote service is applied
    /// locally. Same failure modes as
    /// [`upload_all_local_changes`](Self::upload_all_local_changes).
    pub fn download_all_server_changes(&self, timeout: Option<Duration>) -> SessionResult<()> {
        self.inner.ensure_open()?;
        self.inner.progress.wait_for_download(timeout)
    }
}

impl PartialEq for SyncSession {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SyncSession {}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("partition", &self.inner.partition)
            .finish()
    }
}
