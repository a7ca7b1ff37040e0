//! Status command implementation.

use serde::Serialize;
use std::path::Path;
use tether_session::{is_database_file, list_backups, reset_status, ResetStatus};
use tracing::{debug, warn};

/// Client reset status of one database file.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Database path.
    pub path: String,
    /// Whether the database file exists.
    pub exists: bool,
    /// Reset status derived from file presence.
    pub status: ResetStatus,
    /// Number of reset backups.
    pub backup_count: usize,
}

/// Collects the status of `path`.
pub fn collect(path: &Path, recovery_dir: &str) -> std::io::Result<StatusReport> {
    if !is_database_file(path) {
        warn!(path = ?path, "path does not look like a database file");
    }
    let backups = list_backups(path, recovery_dir)?;
    debug!(path = ?path, backups = backups.len(), "scanned recovery directory");
    Ok(StatusReport {
        path: path.display().to_string(),
        exists: path.exists(),
        status: reset_status(path, recovery_dir)?,
        backup_count: backups.len(),
    })
}

/// Runs the status command.
pub fn run(path: &Path, recovery_dir: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = collect(path, recovery_dir)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("Database: {}", report.path);
            println!("  Exists:  {}", report.exists);
            println!("  Status:  {}", report.status);
            println!("  Backups: {}", report.backup_count);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tether_session::backup_path_for;

    #[test]
    fn reports_completed_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s_p.tether");
        fs::write(&path, b"db").unwrap();

        let report = collect(&path, "recovery").unwrap();
        assert_eq!(report.status, ResetStatus::Clean);
        assert!(report.exists);

        let backup = backup_path_for(&path, "recovery");
        fs::create_dir_all(backup.parent().unwrap()).unwrap();
        fs::rename(&path, &backup).unwrap();

        let report = collect(&path, "recovery").unwrap();
        assert_eq!(report.status, ResetStatus::ResetCompleted);
        assert_eq!(report.backup_count, 1);
        assert!(!report.exists);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "reset-completed");
    }
}
