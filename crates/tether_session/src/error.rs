//! Error types for sync sessions.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Message used whenever a session whose owning handle is gone is accessed.
pub(crate) const SESSION_CLOSED: &str =
    "could not find session, the database was probably closed";

/// Errors visible to callers of the session API.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session's owning handle is closed, or the call is not valid in
    /// the current state.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Error message.
        message: String,
    },

    /// A blocking call was cancelled by interrupting the calling thread.
    ///
    /// The interruption flag has already been cleared when this is returned.
    #[error("operation interrupted")]
    Interrupted,

    /// A blocking call exceeded its deadline.
    #[error("operation timed out after {after:?}")]
    Timeout {
        /// The configured deadline.
        after: Duration,
    },

    /// Local and remote history diverged; a client reset is required.
    ///
    /// Only ever delivered to error handlers, never returned from a call.
    #[error("client reset required: {original_path:?} will be moved to {backup_path:?}")]
    FatalDivergence {
        /// Where the divergent file currently lives.
        original_path: PathBuf,
        /// Where the divergent file will be moved.
        backup_path: PathBuf,
    },

    /// A client reset was attempted while a local handle is still open.
    #[error("resource busy: a local handle is still open on {path:?}")]
    ResourceBusy {
        /// The file that is still in use.
        path: PathBuf,
    },

    /// I/O error while moving files during a client reset.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// The error every accessor of a closed session fails with.
    pub fn session_closed() -> Self {
        Self::illegal_state(SESSION_CLOSED)
    }

    /// Returns true if the same call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Interrupted | SessionError::Timeout { .. } | SessionError::ResourceBusy { .. }
        )
    }

    /// Returns true if this is the closed-session error.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, SessionError::IllegalState { message } if message == SESSION_CLOSED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SessionError::Interrupted.is_retryable());
        assert!(SessionError::Timeout {
            after: Duration::from_millis(10)
        }
        .is_retryable());
        assert!(SessionError::ResourceBusy {
            path: PathBuf::from("a.tether")
        }
        .is_retryable());
        assert!(!SessionError::session_closed().is_retryable());
        assert!(!SessionError::FatalDivergence {
            original_path: PathBuf::from("a"),
            backup_path: PathBuf::from("b"),
        }
        .is_retryable());
    }

    #[test]
    fn closed_session_message() {
        let err = SessionError::session_closed();
        assert!(err.is_session_closed());
        assert_eq!(
            err.to_string(),
            "illegal state: could not find session, the database was probably closed"
        );
        assert!(!SessionError::illegal_state("other").is_session_closed());
    }

    #[test]
    fn io_conversion() {
        let err: SessionError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SessionError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
