//! A scripted remote peer.
//!
//! Drives a session's transport events from a background thread, the way a
//! real network layer would.

use std::thread::{self, JoinHandle};
use std::time::Duration;
use tether_session::{ConnectionState, FatalError, SessionEvents};

/// One step of a peer script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStep {
    /// Sleep before the next step.
    Pause(Duration),
    /// Report a connection state.
    Connection(ConnectionState),
    /// Acknowledge uploads up to a version.
    Acknowledge(u64),
    /// Report download progress.
    Download {
        /// Remote versions applied locally.
        downloaded: u64,
        /// Remote versions known to the server.
        remote_known: u64,
    },
    /// Report a fatal error.
    Fatal(FatalError),
}

/// Runs scripted steps against one session on a background thread.
#[derive(Debug)]
pub struct ScriptedPeer {
    events: SessionEvents,
    steps: Vec<PeerStep>,
}

impl ScriptedPeer {
    /// Creates an empty script for `events`.
    pub fn new(events: SessionEvents) -> Self {
        Self {
            events,
            steps: Vec::new(),
        }
    }

    /// Appends a pause.
    pub fn pause(mut self, duration: Duration) -> Self {
        self.steps.push(PeerStep::Pause(duration));
        self
    }

    /// Appends a connection report.
    pub fn connection(mut self, state: ConnectionState) -> Self {
        self.steps.push(PeerStep::Connection(state));
        self
    }

    /// Appends an upload acknowledgement.
    pub fn acknowledge(mut self, version: u64) -> Self {
        self.steps.push(PeerStep::Acknowledge(version));
        self
    }

    /// Appends a download progress report.
    pub fn download(mut self, downloaded: u64, remote_known: u64) -> Self {
        self.steps.push(PeerStep::Download {
            downloaded,
            remote_known,
        });
        self
    }

    /// Appends a fatal error.
    pub fn fatal(mut self, error: FatalError) -> Self {
        self.steps.push(PeerStep::Fatal(error));
        self
    }

    /// Runs the script on the calling thread.
    pub fn run(self) {
        for step in self.steps {
            match step {
                PeerStep::Pause(duration) => thread::sleep(duration),
                PeerStep::Connection(state) => self.events.connection_state_changed(state),
                PeerStep::Acknowledge(version) => self.events.upload_acknowledged(version),
                PeerStep::Download {
                    downloaded,
                    remote_known,
                } => self.events.download_progress(downloaded, remote_known),
                PeerStep::Fatal(error) => self.events.fatal_error(error),
            }
        }
    }

    /// Runs the script on a new thread.
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || self.run())
    }
}

/// Acknowledges uploads up to `version` after `delay`, from another thread.
pub fn acknowledge_later(events: SessionEvents, version: u64, delay: Duration) -> JoinHandle<()> {
    ScriptedPeer::new(events).pause(delay).acknowledge(version).spawn()
}

/// Reports a complete download of `remote_known` versions after `delay`,
/// from another thread.
pub fn download_later(events: SessionEvents, remote_known: u64, delay: Duration) -> JoinHandle<()> {
    ScriptedPeer::new(events)
        .pause(delay)
        .download(0, remote_known)
        .pause(delay)
        .download(remote_known, remote_known)
        .spawn()
}
