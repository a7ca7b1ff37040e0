//! Transport seam between sessions and the network layer.
//!
//! Sessions tell the transport when to connect and disconnect. The transport
//! reports back through [`SessionEvents`], usually from its own thread.

use crate::auth::AccessToken;
use crate::config::PartitionValue;
use crate::connection::ConnectionState;
use crate::session::{SessionId, SessionInner};
use crate::user::UserId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use tracing::debug;

/// How a session should synchronize once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Continue from the local history.
    Resume,
    /// Ignore local history and download everything (after a client reset).
    FreshDownload,
}

/// Everything the transport needs to open a session's connection.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Session being connected.
    pub session_id: SessionId,
    /// Owner of the session.
    pub user_id: UserId,
    /// Local database file.
    pub path: PathBuf,
    /// Remote data subset.
    pub partition: PartitionValue,
    /// Token authorizing the connection.
    pub token: AccessToken,
    /// Resume or start over.
    pub mode: ConnectMode,
}

/// Unrecoverable errors reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// Local and remote history diverged.
    ClientReset {
        /// The divergent local file.
        original_path: PathBuf,
    },
    /// Any other error that ends the session.
    Other {
        /// Transport-specific error code.
        code: i32,
        /// Human readable description.
        message: String,
    },
}

/// Network collaborator.
///
/// Implementations may report events synchronously from inside `connect`
/// and `disconnect`, or later from any thread.
pub trait SyncTransport: Send + Sync {
    /// Starts connecting a session. Progress is reported through `events`.
    fn connect(&self, events: SessionEvents, request: ConnectRequest);

    /// Closes a session's connection.
    fn disconnect(&self, session_id: &SessionId);

    /// A local commit is ready to upload.
    fn local_commit(&self, _session_id: &SessionId, _version: u64) {}
}

/// Non-owning handle the transport uses to report events to a session.
///
/// Events for a session that no longer exists are dropped.
#[derive(Clone)]
pub struct SessionEvents {
    session_id: SessionId,
    inner: Weak<SessionInner>,
}

impl SessionEvents {
    pub(crate) fn new(session_id: SessionId, inner: Weak<SessionInner>) -> Self {
        Self { session_id, inner }
    }

    /// The session these events belong to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Returns true while the session exists.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// The connection moved to `state`.
    pub fn connection_state_changed(&self, state: ConnectionState) {
        match self.inner.upgrade() {
            Some(inner) => inner.connection_event(state),
            None => debug!(session = %self.session_id, "connection event for dropped session"),
        }
    }

    /// The remote service acknowledged local versions up to `version`.
    pub fn upload_acknowledged(&self, version: u64) {
        if let Some(inner) = self.inner.upgrade() {
            inner.upload_acknowledged(version);
        }
    }

    /// Remote versions up to `downloaded` are applied; the server knows `remote_known`.
    pub fn download_progress(&self, downloaded: u64, remote_known: u64) {
        if let Some(inner) = self.inner.upgrade() {
            inner.download_progress(downloaded, remote_known);
        }
    }

    /// The connection failed in a way that cannot be retried.
    pub fn fatal_error(&self, error: FatalError) {
        match self.inner.upgrade() {
            Some(inner) => inner.fatal_error(error),
            None => debug!(session = %self.session_id, "fatal error for dropped session"),
        }
    }
}

impl std::fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEvents")
            .field("session_id", &self.session_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `connect` was called.
    Connect {
        /// Session connected.
        session_id: SessionId,
        /// Requested mode.
        mode: ConnectMode,
    },
    /// `disconnect` was called.
    Disconnect {
        /// Session disconnected.
        session_id: SessionId,
    },
    /// `local_commit` was called.
    LocalCommit {
        /// Session that committed.
        session_id: SessionId,
        /// Committed version.
        version: u64,
    },
}

/// A mock transport for testing.
///
/// Records every call and keeps the event handle of each connected session.
/// With auto-connect enabled it reports `Connecting` then `Connected` from
/// inside `connect`, and `Disconnected` from inside `disconnect`. With
/// auto-acknowledge enabled every local commit is acknowledged right away.
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    sessions: Mutex<HashMap<SessionId, SessionEvents>>,
    auto_connect: AtomicBool,
    auto_acknowledge: AtomicBool,
}

impl MockTransport {
    /// Creates a transport that only records calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that connects and acknowledges on its own.
    pub fn responsive() -> Self {
        let transport = Self::new();
        transport.set_auto_connect(true);
        transport.set_auto_acknowledge(true);
        transport
    }

    /// Enables or disables automatic connection reports.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    /// Enables or disables automatic upload acknowledgements.
    pub fn set_auto_acknowledge(&self, enabled: bool) {
        self.auto_acknowledge.store(enabled, Ordering::SeqCst);
    }

    /// Every recorded call, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Connect modes requested for a session, in order.
    pub fn connects(&self, session_id: &SessionId) -> Vec<ConnectMode> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Connect { session_id: id, mode } if id == session_id => Some(*mode),
                _ => None,
            })
            .collect()
    }

    /// Number of disconnects requested for a session.
    pub fn disconnects(&self, session_id: &SessionId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, TransportCall::Disconnect { session_id: id } if id == session_id))
            .count()
    }

    /// Event handle of a session that was connected at least once.
    pub fn events(&self, session_id: &SessionId) -> Option<SessionEvents> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl SyncTransport for MockTransport {
    fn connect(&self, events: SessionEvents, request: ConnectRequest) {
        self.calls.lock().push(TransportCall::Connect {
            session_id: request.session_id.clone(),
            mode: request.mode,
        });
        self.sessions
            .lock()
            .insert(request.session_id.clone(), events.clone());

        if self.auto_connect.load(Ordering::SeqCst) {
            events.connection_state_changed(ConnectionState::Connecting);
            events.connection_state_changed(ConnectionState::Connected);
        }
    }

    fn disconnect(&self, session_id: &SessionId) {
        self.calls.lock().push(TransportCall::Disconnect {
            session_id: session_id.clone(),
        });
        if self.auto_connect.load(Ordering::SeqCst) {
            if let Some(events) = self.events(session_id) {
                events.connection_state_changed(ConnectionState::Disconnected);
            }
        }
    }

    fn local_commit(&self, session_id: &SessionId, version: u64) {
        self.calls.lock().push(TransportCall::LocalCommit {
            session_id: session_id.clone(),
            version,
        });
        if self.auto_acknowledge.load(Ordering::SeqCst) {
            if let Some(events) = self.events(session_id) {
                events.upload_acknowledged(version);
            }
        }
    }
}
