//! Local storage seam: open handle tracking and file moves.
//!
//! The session manager never touches database contents. It only needs to
//! know whether a handle is open on a file and to move a file during a
//! client reset.

use fs2::FileExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Storage collaborator used by sessions and client reset.
pub trait LocalStorage: Send + Sync {
    /// Opens (creating if needed) the file and counts one more handle on it.
    fn acquire(&self, path: &Path) -> io::Result<()>;

    /// Counts one handle less on the file.
    fn release(&self, path: &Path);

    /// Returns true if any handle on `path` is open.
    fn has_local_handle_open(&self, path: &Path) -> bool;

    /// Moves `from` to `to`, all or nothing.
    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;
}

struct OpenFile {
    file: File,
    handles: usize,
}

/// File-system storage.
///
/// Holds one shared advisory lock per open database file for as long as at
/// least one handle is open on it.
#[derive(Default)]
pub struct FileStorage {
    open: Mutex<HashMap<PathBuf, OpenFile>>,
}

impl FileStorage {
    /// Creates a storage with no open files.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles open on `path`.
    pub fn handle_count(&self, path: &Path) -> usize {
        self.open.lock().get(path).map_or(0, |f| f.handles)
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("open_files", &self.open.lock().len())
            .finish()
    }
}

impl LocalStorage for FileStorage {
    fn acquire(&self, path: &Path) -> io::Result<()> {
        let mut open = self.open.lock();
        if let Some(entry) = open.get_mut(path) {
            entry.handles += 1;
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        FileExt::try_lock_shared(&file)?;
        open.insert(path.to_path_buf(), OpenFile { file, handles: 1 });
        debug!(path = ?path, "opened database file");
        Ok(())
    }

    fn release(&self, path: &Path) {
        let mut open = self.open.lock();
        let Some(entry) = open.get_mut(path) else {
            warn!(path = ?path, "release without a matching acquire");
            return;
        };
        entry.handles -= 1;
        if entry.handles == 0 {
            if let Some(entry) = open.remove(path) {
                let _ = FileExt::unlock(&entry.file);
                debug!(path = ?path, "closed database file");
            }
        }
    }

    fn has_local_handle_open(&self, path: &Path) -> bool {
        self.handle_count(path) > 0
    }

    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        move_atomically(from, to)
    }
}

/// Moves `from` to `to` so that either both paths end in their original
/// state or the move completed.
///
/// Tries `rename` first. If that fails (for example across file systems),
/// falls back to copy, fsync, checksum verification, then delete, rolling
/// back the copy on any failure.
pub fn move_atomically(from: &Path, to: &Path) -> io::Result<()> {
    move_with(from, to, |a, b| fs::rename(a, b))
}

pub(crate) fn move_with(
    from: &Path,
    to: &Path,
    rename: impl Fn(&Path, &Path) -> io::Result<()>,
) -> io::Result<()> {
    if !from.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source file does not exist: {}", from.display()),
        ));
    }
    if to.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination already exists: {}", to.display()),
        ));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }

    match rename(from, to) {
        Ok(()) => return Ok(()),
        Err(err) => {
            debug!(error = %err, "rename failed, falling back to copy");
        }
    }

    if let Err(err) = copy_verified(from, to) {
        let _ = fs::remove_file(to);
        return Err(err);
    }
    if let Err(err) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(err);
    }
    Ok(())
}

fn copy_verified(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    File::open(to)?.sync_all()?;
    if file_digest(from)? != file_digest(to)? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("copy of {} does not match its source", from.display()),
        ));
    }
    Ok(())
}

fn file_digest(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn acquire_and_release_count_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("user").join("db.tether");
        let storage = FileStorage::new();

        storage.acquire(&path).unwrap();
        storage.acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(storage.handle_count(&path), 2);

        storage.release(&path);
        assert!(storage.has_local_handle_open(&path));
        storage.release(&path);
        assert!(!storage.has_local_handle_open(&path));

        // unmatched release is ignored
        storage.release(&path);
        assert_eq!(storage.handle_count(&path), 0);
    }

    #[test]
    fn move_by_rename() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("db.tether");
        let to = dir.path().join("recovery").join("db.tether.reset-backup");
        write(&from, b"contents");

        move_atomically(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"contents");
    }

    #[test]
    fn move_falls_back_to_copy() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("db.tether");
        let to = dir.path().join("backup").join("db.bak");
        write(&from, &vec![7u8; 20_000]);

        move_with(&from, &to, |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "cross-device link"))
        })
        .unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), vec![7u8; 20_000]);
    }

    #[test]
    fn move_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        write(&from, b"a");
        write(&to, b"b");

        let err = move_atomically(&from, &to).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&from).unwrap(), b"a");
        assert_eq!(fs::read(&to).unwrap(), b"b");
    }

    #[test]
    fn failed_move_leaves_both_paths_untouched() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("db.tether");
        write(&from, b"data");
        // the destination's parent is a regular file, so nothing can be created there
        let blocker = dir.path().join("blocker");
        write(&blocker, b"");
        let to = blocker.join("db.bak");

        assert!(move_atomically(&from, &to).is_err());
        assert_eq!(fs::read(&from).unwrap(), b"data");
        assert!(!to.exists());
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = move_atomically(&dir.path().join("nope"), &dir.path().join("b")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
