//! # Tether Sync Sessions
//!
//! Client-side session management for a synchronized local database.
//!
//! This crate provides:
//! - Session state machine (waiting for token → active → dying → inactive)
//! - Connection state tracking with listener dispatch
//! - User login/logout fan-out to every bound session
//! - Blocking upload/download waits with timeout and thread interruption
//! - Client reset (backup the divergent file, then download afresh)
//! - A process-wide registry of sessions keyed by database path
//!
//! ## Architecture
//!
//! Network I/O, authentication and storage are collaborators behind traits:
//! [`SyncTransport`], [`TokenProvider`] and [`LocalStorage`]. The session
//! never performs I/O itself except the client reset file move.
//!
//! 1. [`SessionManager::open`] creates or reuses the session at a path
//! 2. The session asks for an access token, then connects
//! 3. The transport reports connection changes and progress back through
//!    [`SessionEvents`]
//!
//! ## Key Invariants
//!
//! - Logical state is authoritative: an inactive session reports `Disconnected`
//! - After `logout` returns, every session of that user is inactive
//! - Each connection transition is reported to listeners exactly once
//! - A client reset moves the file all or nothing, and only with no handle open

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod connection;
mod error;
mod interrupt;
mod listener;
mod manager;
mod progress;
mod reset;
mod session;
mod state;
mod storage;
mod transport;
mod user;

pub use auth::{AccessToken, ManualTokenProvider, StaticTokenProvider, TokenProvider, TokenRequest};
pub use config::{
    is_database_file, ManagerConfig, PartitionValue, PathStrategy, SessionConfig,
    DATABASE_EXTENSION, DEFAULT_RECOVERY_DIR,
};
pub use connection::{ConnectionChange, ConnectionState};
pub use error::{SessionError, SessionResult};
pub use interrupt::{interrupted, Interrupter};
pub use listener::{ConnectionListener, ErrorHandler, ListenerRegistry, UnhandledErrorHook};
pub use manager::{LocalHandle, SessionManager};
pub use progress::Progress;
pub use reset::{
    backup_path_for, list_backups, reset_status, ClientResetError, ResetStatus,
    SessionErrorEvent, BACKUP_SUFFIX,
};
pub use session::{SessionId, SyncSession};
pub use state::{SessionEvent, SessionState, SessionStateMachine, StopPolicy, Transition};
pub use storage::{move_atomically, FileStorage, LocalStorage};
pub use transport::{
    ConnectMode, ConnectRequest, FatalError, MockTransport, SessionEvents, SyncTransport,
    TransportCall,
};
pub use user::{AuthState, CredentialBinder, Credentials, User, UserId};
