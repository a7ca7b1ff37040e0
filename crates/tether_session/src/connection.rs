//! Raw network connection state of a session.

use parking_lot::Mutex;
use std::fmt;

/// Network connection state, driven by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and none being attempted.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Handshake completed; changes can flow.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// A reported transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionChange {
    /// State before the transition.
    pub old: ConnectionState,
    /// State after the transition.
    pub new: ConnectionState,
}

/// Owns the connection state and computes transitions.
///
/// Transitions to the current state are suppressed, so every returned
/// [`ConnectionChange`] is a real change.
#[derive(Debug)]
pub(crate) struct ConnectionStateTracker {
    state: Mutex<ConnectionState>,
}

impl ConnectionStateTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    /// Moves to `new`, returning the change unless it is a no-op.
    pub(crate) fn transition(&self, new: ConnectionState) -> Option<ConnectionChange> {
        let mut state = self.state.lock();
        let old = *state;
        if old == new {
            return None;
        }
        *state = new;
        Some(ConnectionChange { old, new })
    }
}
