//! Backups command implementation.

use serde::Serialize;
use std::fs;
use std::path::Path;
use tether_session::list_backups;

/// One reset backup file.
#[derive(Debug, Serialize)]
pub struct BackupEntry {
    /// Backup path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
}

/// Lists the backups of `path`, oldest first.
pub fn collect(path: &Path, recovery_dir: &str) -> std::io::Result<Vec<BackupEntry>> {
    list_backups(path, recovery_dir)?
        .into_iter()
        .map(|backup| {
            let size = fs::metadata(&backup)?.len();
            Ok(BackupEntry {
                path: backup.display().to_string(),
                size,
            })
        })
        .collect()
}

/// Runs the backups command.
pub fn run(path: &Path, recovery_dir: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let backups = collect(path, recovery_dir)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&backups)?);
        }
        _ => {
            if backups.is_empty() {
                println!("No reset backups for {}", path.display());
            }
            for backup in &backups {
                println!("{:>12} bytes  {}", backup.size, backup.path);
            }
        }
    }

    Ok(())
}
