//! # Tether Testkit
//!
//! Test utilities for tether sync sessions.
//!
//! This crate provides:
//! - A ready-made test environment (temp directory, mock collaborators, manager)
//! - Recording connection listeners and error handlers
//! - A scripted transport peer that acknowledges from another thread
//! - Property-based test generators using proptest
//! - Concurrency stress helpers
//!
//! ## Usage
//!
//! ```rust
//! use tether_session::SessionState;
//! use tether_testkit::prelude::*;
//!
//! let env = TestEnv::new();
//! let user = env.login("alice");
//! let handle = env.open(&user, "partition");
//! assert_eq!(handle.session().state().unwrap(), SessionState::Active);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod peer;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::peer::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use peer::*;
pub use stress::*;
