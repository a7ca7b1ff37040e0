//! Logical session state machine.
//!
//! The machine is a pure function over `(state, event)`: it never fails and
//! never performs side effects. The session applies the returned
//! [`Transition`] and reconciles the connection with the new state.

use std::fmt;

/// Logical state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for an access token before connecting. Initial state.
    WaitingForAccessToken,
    /// Connected or connecting, and syncing.
    Active,
    /// Stopped. No connection is kept.
    Inactive,
    /// Stopping once pending uploads drain. Settles to [`SessionState::Inactive`].
    Dying,
}

impl SessionState {
    /// Returns true if the session should hold a connection in this state.
    pub fn wants_connection(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Dying)
    }

    /// Returns true if transport connection events are accepted in this state.
    pub fn accepts_connection(&self) -> bool {
        !matches!(self, SessionState::Inactive)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::WaitingForAccessToken => "WAITING_FOR_ACCESS_TOKEN",
            SessionState::Active => "ACTIVE",
            SessionState::Inactive => "INACTIVE",
            SessionState::Dying => "DYING",
        };
        f.write_str(name)
    }
}

/// Governs whether stopping waits for pending uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StopPolicy {
    /// Stop as soon as asked.
    Immediately,
    /// Keep uploading until local changes are acknowledged, then stop.
    #[default]
    AfterChangesUploaded,
    /// Keep the session running after its last handle closes.
    Never,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Explicit start request.
    Start {
        /// Whether a valid access token is cached.
        has_token: bool,
    },
    /// An access token became available.
    TokenAcquired,
    /// Explicit stop request.
    Stop {
        /// Whether local commits are not yet acknowledged.
        pending_uploads: bool,
    },
    /// Every local commit has been acknowledged.
    UploadsDrained,
    /// The bound user logged out.
    Logout,
    /// The bound user logged back in.
    Login,
    /// The last local handle closed.
    Close {
        /// Whether local commits are not yet acknowledged.
        pending_uploads: bool,
    },
    /// A fatal error froze the session.
    Fatal,
    /// The owning manager is shutting down.
    Shutdown,
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: SessionState,
    /// State after the event.
    pub to: SessionState,
}

impl Transition {
    /// Returns true if the state changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Returns true if this transition entered `state`.
    pub fn entered(&self, state: SessionState) -> bool {
        self.changed() && self.to == state
    }
}

/// The logical state machine of one session.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    stop_policy: StopPolicy,
    revive_on_login: bool,
    frozen: bool,
}

impl SessionStateMachine {
    /// Creates a machine in [`SessionState::WaitingForAccessToken`].
    pub fn new(stop_policy: StopPolicy) -> Self {
        Self {
            state: SessionState::WaitingForAccessToken,
            stop_policy,
            revive_on_login: false,
            frozen: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stop policy. Never changed by logout or login.
    pub fn stop_policy(&self) -> StopPolicy {
        self.stop_policy
    }

    /// Returns true once a fatal error or shutdown froze the session.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns true if a later login will revive the session.
    pub fn revives_on_login(&self) -> bool {
        self.revive_on_login
    }

    /// Applies an event. Total over every `(state, event)` pair.
    pub fn apply(&mut self, event: SessionEvent) -> Transition {
        use SessionState::*;

        let from = self.state;
        let to = match event {
            SessionEvent::Start { .. } if self.frozen => from,
            SessionEvent::Start { has_token } => match from {
                Inactive if has_token => Active,
                Inactive => WaitingForAccessToken,
                Dying => Active,
                Active | WaitingForAccessToken => from,
            },
            SessionEvent::TokenAcquired => match from {
                WaitingForAccessToken => Active,
                _ => from,
            },
            SessionEvent::Stop { pending_uploads } => {
                self.revive_on_login = false;
                match from {
                    Active | WaitingForAccessToken => self.stopped_state(pending_uploads),
                    Inactive | Dying => from,
                }
            }
            SessionEvent::UploadsDrained => match from {
                Dying => Inactive,
                _ => from,
            },
            SessionEvent::Logout => {
                // A dying session was already stopping; only running sessions revive.
                if matches!(from, Active | WaitingForAccessToken) && !self.frozen {
                    self.revive_on_login = true;
                }
                Inactive
            }
            SessionEvent::Login => {
                let revive = std::mem::take(&mut self.revive_on_login);
                match from {
                    Inactive if revive && !self.frozen => WaitingForAccessToken,
                    _ => from,
                }
            }
            SessionEvent::Close { pending_uploads } => match self.stop_policy {
                StopPolicy::Never => from,
                _ => {
                    self.revive_on_login = false;
                    match from {
                        Active | WaitingForAccessToken => self.stopped_state(pending_uploads),
                        Inactive | Dying => from,
                    }
                }
            },
            SessionEvent::Fatal | SessionEvent::Shutdown => {
                self.frozen = true;
                self.revive_on_login = false;
                Inactive
            }
        };
        self.state = to;
        Transition { from, to }
    }

    fn stopped_state(&self, pending_uploads: bool) -> SessionState {
        if self.stop_policy == StopPolicy::AfterChangesUploaded && pending_uploads {
            SessionState::Dying
        } else {
            SessionState::Inactive
        }
    }
}
