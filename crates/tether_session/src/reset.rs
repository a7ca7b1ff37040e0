//! Client reset: recovery from unrecoverable local/remote divergence.
//!
//! When the transport reports a divergence, the session is frozen and a
//! [`ClientResetError`] is handed to the application's error handler. The
//! application closes its handles and calls [`ClientResetError::execute`],
//! which moves the local file aside. The next session opened at the same
//! path downloads everything from scratch.
//!
//! # On-disk convention
//!
//! For a database file `<dir>/<name>` the backup goes to
//! `<dir>/<recovery>/<name>.reset-backup`, or `<name>.reset-backup.1`,
//! `<name>.reset-backup.2` and so on if earlier backups exist. Tooling can
//! tell a completed reset by file presence alone, see [`reset_status`].

use crate::error::{SessionError, SessionResult};
use crate::session::{SessionHost, SessionId, SessionInner};
use crate::storage::LocalStorage;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Suffix appended to the file name of a reset backup.
pub const BACKUP_SUFFIX: &str = "reset-backup";

/// Error delivered to error handlers, outside of any call.
#[derive(Debug, Clone)]
pub enum SessionErrorEvent {
    /// Local and remote history diverged. The application must run the reset.
    ClientReset(ClientResetError),
    /// Another fatal error ended the session.
    Fatal {
        /// Transport-specific error code.
        code: i32,
        /// Human readable description.
        message: String,
    },
}

impl SessionErrorEvent {
    /// The client reset carried by this event, if any.
    pub fn as_client_reset(&self) -> Option<&ClientResetError> {
        match self {
            SessionErrorEvent::ClientReset(reset) => Some(reset),
            SessionErrorEvent::Fatal { .. } => None,
        }
    }

    /// Converts the event into the matching error value.
    pub fn to_error(&self) -> SessionError {
        match self {
            SessionErrorEvent::ClientReset(reset) => reset.to_error(),
            SessionErrorEvent::Fatal { code, message } => {
                SessionError::illegal_state(format!("fatal sync error {code}: {message}"))
            }
        }
    }
}

struct ResumeAction {
    session_id: SessionId,
    storage: Arc<dyn LocalStorage>,
    host: Weak<dyn SessionHost>,
    executed: Mutex<bool>,
}

/// A pending client reset.
///
/// The file at [`original_path`](Self::original_path) has not been touched
/// when the error handler receives this value.
#[derive(Clone)]
pub struct ClientResetError {
    original_path: PathBuf,
    backup_path: PathBuf,
    action: Arc<ResumeAction>,
}

impl ClientResetError {
    /// The divergent local database file.
    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    /// Where [`execute`](Self::execute) moves the original file.
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Returns true once the reset ran successfully.
    pub fn is_executed(&self) -> bool {
        *self.action.executed.lock()
    }

    /// The matching [`SessionError::FatalDivergence`].
    pub fn to_error(&self) -> SessionError {
        SessionError::FatalDivergence {
            original_path: self.original_path.clone(),
            backup_path: self.backup_path.clone(),
        }
    }

    /// Moves the original file to the backup path and lets the next session
    /// at the original path start from a full download.
    ///
    /// Blocks on file I/O. Fails with [`SessionError::ResourceBusy`] while any
    /// local handle on the original file is open, and moves nothing in that
    /// case. An I/O failure leaves both paths as they were. Succeeds at most
    /// once; later calls fail with [`SessionError::IllegalState`].
    pub fn execute(&self) -> SessionResult<()> {
        let mut executed = self.action.executed.lock();
        if *executed {
            return Err(SessionError::illegal_state("client reset was already executed"));
        }

        match self.action.host.upgrade() {
            Some(host) => {
                host.execute_reset(&self.action.session_id, &self.original_path, &self.backup_path)?
            }
            None => move_aside(
                self.action.storage.as_ref(),
                &self.original_path,
                &self.backup_path,
            )?,
        }

        *executed = true;
        info!(
            session = %self.action.session_id,
            original = ?self.original_path,
            backup = ?self.backup_path,
            "client reset executed"
        );
        Ok(())
    }
}

impl fmt::Debug for ClientResetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientResetError")
            .field("original_path", &self.original_path)
            .field("backup_path", &self.backup_path)
            .field("executed", &self.is_executed())
            .finish()
    }
}

/// Checks for open handles, then moves the file. All or nothing.
pub(crate) fn move_aside(
    storage: &dyn LocalStorage,
    original: &Path,
    backup: &Path,
) -> SessionResult<()> {
    if storage.has_local_handle_open(original) {
        return Err(SessionError::ResourceBusy {
            path: original.to_path_buf(),
        });
    }
    storage.move_file(original, backup)?;
    Ok(())
}

/// Builds client reset errors and delivers them to sessions.
pub(crate) struct ClientResetCoordinator {
    storage: Arc<dyn LocalStorage>,
    recovery_dir: String,
    host: Weak<dyn SessionHost>,
}

impl ClientResetCoordinator {
    pub(crate) fn new(
        storage: Arc<dyn LocalStorage>,
        recovery_dir: String,
        host: Weak<dyn SessionHost>,
    ) -> Self {
        Self {
            storage,
            recovery_dir,
            host,
        }
    }

    /// Freezes `session` and hands a reset error to its error handlers.
    ///
    /// A session gets at most one reset error.
    pub(crate) fn deliver(&self, session: &Arc<SessionInner>, original_path: PathBuf) {
        if !session.begin_reset() {
            warn!(session = %session.id(), "duplicate client reset ignored");
            return;
        }
        session.freeze();

        let backup_path = backup_path_for(&original_path, &self.recovery_dir);
        warn!(
            session = %session.id(),
            original = ?original_path,
            backup = ?backup_path,
            "client reset required"
        );
        let error = ClientResetError {
            original_path,
            backup_path,
            action: Arc::new(ResumeAction {
                session_id: session.id().clone(),
                storage: Arc::clone(&self.storage),
                host: self.host.clone(),
                executed: Mutex::new(false),
            }),
        };
        if !session.dispatch_error(SessionErrorEvent::ClientReset(error)) {
            session.abandon_reset();
        }
    }
}

fn backup_dir(original: &Path, recovery_dir: &str) -> PathBuf {
    original
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(recovery_dir)
}

fn file_name(original: &Path) -> String {
    original
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// First backup path for `original` that does not exist yet.
pub fn backup_path_for(original: &Path, recovery_dir: &str) -> PathBuf {
    let dir = backup_dir(original, recovery_dir);
    let base = format!("{}.{BACKUP_SUFFIX}", file_name(original));
    let first = dir.join(&base);
    if !first.exists() {
        return first;
    }
    (1u64..)
        .map(|n| dir.join(format!("{base}.{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// Index of a backup file name: `Some(0)` for the unnumbered one.
fn backup_index(name: &str, base: &str) -> Option<u64> {
    let rest = name.strip_prefix(base)?;
    if rest.is_empty() {
        return Some(0);
    }
    rest.strip_prefix('.')?.parse().ok()
}

/// Existing backups of `original`, oldest first.
pub fn list_backups(original: &Path, recovery_dir: &str) -> io::Result<Vec<PathBuf>> {
    let dir = backup_dir(original, recovery_dir);
    let base = format!("{}.{BACKUP_SUFFIX}", file_name(original));
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = backup_index(&name, &base) {
            backups.push((index, entry.path()));
        }
    }
    backups.sort();
    Ok(backups.into_iter().map(|(_, path)| path).collect())
}

/// Reset state of a database file, derived from file presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetStatus {
    /// No backups exist.
    Clean,
    /// A backup exists and the original is gone.
    ResetCompleted,
    /// A backup exists and a fresh original was downloaded since.
    ResetCompletedRedownloaded,
}

impl fmt::Display for ResetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetStatus::Clean => "clean",
            ResetStatus::ResetCompleted => "reset-completed",
            ResetStatus::ResetCompletedRedownloaded => "reset-completed-redownloaded",
        };
        f.write_str(name)
    }
}

/// Reset state of `original`.
pub fn reset_status(original: &Path, recovery_dir: &str) -> io::Result<ResetStatus> {
    if list_backups(original, recovery_dir)?.is_empty() {
        return Ok(ResetStatus::Clean);
    }
    Ok(if original.exists() {
        ResetStatus::ResetCompletedRedownloaded
    } else {
        ResetStatus::ResetCompleted
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn backup_paths_never_collide() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("s_p.tether");

        let first = backup_path_for(&original, "recovery");
        assert_eq!(first, dir.path().join("recovery").join("s_p.tether.reset-backup"));
        touch(&first);

        let second = backup_path_for(&original, "recovery");
        assert_eq!(second, dir.path().join("recovery").join("s_p.tether.reset-backup.1"));
        touch(&second);

        let third = backup_path_for(&original, "recovery");
        assert!(third.ends_with("s_p.tether.reset-backup.2"));
    }

    #[test]
    fn list_backups_in_order() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("db.tether");
        let recovery = dir.path().join("recovery");
        touch(&recovery.join("db.tether.reset-backup.10"));
        touch(&recovery.join("db.tether.reset-backup"));
        touch(&recovery.join("db.tether.reset-backup.2"));
        touch(&recovery.join("other.tether.reset-backup"));
        touch(&recovery.join("db.tether.reset-backup.bak"));

        let names: Vec<_> = list_backups(&original, "recovery")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "db.tether.reset-backup",
                "db.tether.reset-backup.2",
                "db.tether.reset-backup.10"
            ]
        );
    }

    #[test]
    fn status_follows_file_presence() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("db.tether");
        assert_eq!(reset_status(&original, "recovery").unwrap(), ResetStatus::Clean);

        touch(&original);
        assert_eq!(reset_status(&original, "recovery").unwrap(), ResetStatus::Clean);

        let backup = backup_path_for(&original, "recovery");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::rename(&original, &backup).unwrap();
        assert_eq!(
            reset_status(&original, "recovery").unwrap(),
            ResetStatus::ResetCompleted
        );

        touch(&original);
        assert_eq!(
            reset_status(&original, "recovery").unwrap(),
            ResetStatus::ResetCompletedRedownloaded
        );
        assert_eq!(
            ResetStatus::ResetCompletedRedownloaded.to_string(),
            "reset-completed-redownloaded"
        );
    }

    #[test]
    fn move_aside_refuses_open_handles() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("db.tether");
        let backup = backup_path_for(&original, "recovery");
        let storage = FileStorage::new();
        storage.acquire(&original).unwrap();

        let err = move_aside(&storage, &original, &backup).unwrap_err();
        assert!(matches!(err, SessionError::ResourceBusy { .. }));
        assert!(original.exists());
        assert!(!backup.exists());

        storage.release(&original);
        move_aside(&storage, &original, &backup).unwrap();
        assert!(!original.exists());
        assert!(backup.exists());
    }
}
