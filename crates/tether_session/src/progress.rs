//! Upload/download progress and the blocking waits built on it.

use crate::error::{SessionError, SessionResult};
use crate::interrupt;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot of a session's transfer progress.
///
/// Versions are monotonically increasing counters. Local commits are
/// numbered by the session; remote versions come from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Latest locally committed version.
    pub local_committed: u64,
    /// Latest local version acknowledged by the remote service.
    pub uploaded: u64,
    /// Latest remote version the transport has announced.
    pub remote_known: u64,
    /// Latest remote version applied locally.
    pub downloaded: u64,
    /// Whether the transport has reported download progress at least once.
    pub download_reported: bool,
}

impl Progress {
    /// Returns true if some local commit is not yet acknowledged.
    pub fn has_pending_uploads(&self) -> bool {
        self.uploaded < self.local_committed
    }
}

/// Tracks progress and wakes threads blocked on it.
pub(crate) struct ProgressTracker {
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl ProgressTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            progress: Mutex::new(Progress::default()),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn snapshot(&self) -> Progress {
        *self.progress.lock()
    }

    pub(crate) fn has_pending_uploads(&self) -> bool {
        self.progress.lock().has_pending_uploads()
    }

    /// Records a local commit and returns its version.
    pub(crate) fn record_local_commit(&self) -> u64 {
        let mut progress = self.progress.lock();
        progress.local_committed += 1;
        progress.local_committed
    }

    /// Returns true if every local commit is now acknowledged.
    pub(crate) fn upload_acknowledged(&self, version: u64) -> bool {
        let mut progress = self.progress.lock();
        progress.uploaded = progress.uploaded.max(version.min(progress.local_committed));
        let drained = !progress.has_pending_uploads();
        self.changed.notify_all();
        drained
    }

    pub(crate) fn download_progress(&self, downloaded: u64, remote_known: u64) {
        let mut progress = self.progress.lock();
        progress.remote_known = progress.remote_known.max(remote_known);
        progress.downloaded = progress.downloaded.max(downloaded);
        progress.download_reported = true;
        self.changed.notify_all();
    }

    /// Blocks until everything committed so far is acknowledged.
    pub(crate) fn wait_for_upload(self: &Arc<Self>, timeout: Option<Duration>) -> SessionResult<()> {
        let target = self.progress.lock().local_committed;
        self.wait(timeout, move |p| p.uploaded >= target)
    }

    /// Blocks until every remote version announced so far is applied.
    ///
    /// If nothing was announced yet, the target is taken from the first
    /// report that arrives.
    pub(crate) fn wait_for_download(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> SessionResult<()> {
        let mut target = {
            let progress = self.progress.lock();
            progress.download_reported.then_some(progress.remote_known)
        };
        self.wait(timeout, move |p| {
            if target.is_none() && p.download_reported {
                target = Some(p.remote_known);
            }
            target.is_some_and(|t| p.downloaded >= t)
        })
    }

    fn wait(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        mut done: impl FnMut(&Progress) -> bool,
    ) -> SessionResult<()> {
        let weak = Arc::downgrade(self);
        let _waker = interrupt::register_waker(move || {
            if let Some(tracker) = weak.upgrade() {
                let _progress = tracker.progress.lock();
                tracker.changed.notify_all();
            }
        });

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut progress = self.progress.lock();
        loop {
            if interrupt::take_interrupt() {
                return Err(SessionError::Interrupted);
            }
            if done(&progress) {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut progress, deadline).timed_out()
                        && !done(&progress)
                    {
                        if interrupt::take_interrupt() {
                            return Err(SessionError::Interrupted);
                        }
                        return Err(SessionError::Timeout {
                            after: timeout.unwrap_or_default(),
                        });
                    }
                }
                None => self.changed.wait(&mut progress),
            }
        }
    }
}
