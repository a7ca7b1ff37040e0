//! Test fixtures and session helpers.
//!
//! Provides a manager wired to mock collaborators inside a temporary
//! directory, plus listeners that record what they see.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tether_session::{
    ConnectionChange, ConnectionListener, ConnectionState, Credentials, ErrorHandler,
    LocalHandle, ManagerConfig, ManualTokenProvider, MockTransport, PartitionValue,
    SessionConfig, SessionErrorEvent, SessionEvents, SessionManager, StaticTokenProvider,
    SyncSession, SyncTransport, TokenProvider, User,
};

/// Installs a `tracing` subscriber writing to the test output.
///
/// Honors `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A session manager with mock collaborators and automatic cleanup.
pub struct TestEnv {
    /// The manager under test.
    pub manager: SessionManager,
    /// The transport every session talks to.
    pub transport: Arc<MockTransport>,
    /// Manual provider, if the environment was built with one.
    pub manual_tokens: Option<Arc<ManualTokenProvider>>,
    dir: TempDir,
}

impl TestEnv {
    /// Environment whose transport connects and acknowledges on its own and
    /// whose tokens are always ready.
    pub fn new() -> Self {
        Self::build(
            MockTransport::responsive(),
            Arc::new(StaticTokenProvider::default()),
            None,
            |config| config,
        )
    }

    /// Environment whose token requests stay pending until delivered by hand.
    pub fn with_manual_tokens() -> Self {
        let tokens = Arc::new(ManualTokenProvider::new());
        Self::build(
            MockTransport::responsive(),
            Arc::clone(&tokens) as Arc<dyn TokenProvider>,
            Some(tokens),
            |config| config,
        )
    }

    /// Environment whose transport only records calls; tests drive events.
    pub fn quiet() -> Self {
        Self::build(
            MockTransport::new(),
            Arc::new(StaticTokenProvider::default()),
            None,
            |config| config,
        )
    }

    /// Responsive environment with a customized manager configuration.
    pub fn with_config(configure: impl FnOnce(ManagerConfig) -> ManagerConfig) -> Self {
        Self::build(
            MockTransport::responsive(),
            Arc::new(StaticTokenProvider::default()),
            None,
            configure,
        )
    }

    fn build(
        transport: MockTransport,
        tokens: Arc<dyn TokenProvider>,
        manual_tokens: Option<Arc<ManualTokenProvider>>,
        configure: impl FnOnce(ManagerConfig) -> ManagerConfig,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp directory");
        let transport = Arc::new(transport);
        let shared: Arc<dyn SyncTransport> = transport.clone();
        let manager = SessionManager::new(configure(ManagerConfig::new(dir.path())), shared, tokens);
        Self {
            manager,
            transport,
            manual_tokens,
            dir,
        }
    }

    /// Root directory of database files.
    pub fn base_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Logs in `user_id` without a cached token.
    pub fn login(&self, user_id: &str) -> Arc<User> {
        self.manager.login(Credentials::new(user_id))
    }

    /// Opens a handle with the default session configuration.
    pub fn open(&self, user: &User, partition: impl Into<PartitionValue>) -> LocalHandle {
        self.open_with(&SessionConfig::new(user, partition))
    }

    /// Opens a handle with an explicit configuration.
    pub fn open_with(&self, config: &SessionConfig) -> LocalHandle {
        self.manager.open(config).expect("Failed to open session")
    }

    /// Event handle the transport received for `session`.
    pub fn events(&self, session: &SyncSession) -> SessionEvents {
        self.transport
            .events(session.id())
            .expect("Session was never connected")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection listener that records every change it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    changes: Mutex<Vec<ConnectionChange>>,
}

impl RecordingListener {
    /// Creates a listener, ready to register.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every change seen so far, in order.
    pub fn changes(&self) -> Vec<ConnectionChange> {
        self.changes.lock().clone()
    }

    /// The `new` state of every change seen so far.
    pub fn states(&self) -> Vec<ConnectionState> {
        self.changes.lock().iter().map(|c| c.new).collect()
    }
}

impl ConnectionListener for RecordingListener {
    fn on_change(&self, old: ConnectionState, new: ConnectionState) {
        self.changes.lock().push(ConnectionChange { old, new });
    }
}

/// Error handler that records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    events: Mutex<Vec<SessionErrorEvent>>,
}

impl RecordingErrorHandler {
    /// Creates a handler, ready to register.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event seen so far, in order.
    pub fn events(&self) -> Vec<SessionErrorEvent> {
        self.events.lock().clone()
    }

    /// Number of events seen so far.
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

impl ErrorHandler for RecordingErrorHandler {
    fn on_error(&self, _session: &SyncSession, event: &SessionErrorEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use tether_session::{SessionState, StopPolicy};

    /// Opens `count` sessions of one user, on partitions `p0`, `p1`, ...
    pub fn user_with_sessions(env: &TestEnv, user_id: &str, count: usize) -> (Arc<User>, Vec<LocalHandle>) {
        let user = env.login(user_id);
        let handles = (0..count)
            .map(|i| env.open(&user, format!("p{i}")))
            .collect();
        (user, handles)
    }

    /// Opens an active session with the given stop policy.
    pub fn active_session(env: &TestEnv, user: &User, policy: StopPolicy) -> LocalHandle {
        let handle = env.open_with(&SessionConfig::new(user, "active").with_stop_policy(policy));
        assert_eq!(
            handle.session().state().expect("Session should be open"),
            SessionState::Active
        );
        handle
    }
}
