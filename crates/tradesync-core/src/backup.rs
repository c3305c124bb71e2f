//! Timestamped ledger backups
//!
//! A backup is a byte-for-byte copy of the ledger as it was on disk before a
//! mutating write, named `<stem>_<YYYYMMDD>_<HHMMSS>.<ext>`. An existing file
//! with the same name is never overwritten.

use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// `chrono` format of the timestamp embedded in backup names
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A backup file found on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Full path to the backup
    pub path: PathBuf,
    /// Timestamp parsed from the file name
    pub timestamp: NaiveDateTime,
    /// Size in bytes
    pub size: u64,
}

fn stem_and_extension(ledger_path: &Path) -> Result<(String, String)> {
    let stem = ledger_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "ledger path '{}' has no file name",
                ledger_path.display()
            ))
        })?;
    let extension = ledger_path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "csv".to_string());
    Ok((stem, extension))
}

/// File name of the backup taken at `timestamp`
pub fn backup_file_name(ledger_path: &Path, timestamp: NaiveDateTime) -> Result<String> {
    let (stem, extension) = stem_and_extension(ledger_path)?;
    Ok(format!(
        "{}_{}.{}",
        stem,
        timestamp.format(BACKUP_TIMESTAMP_FORMAT),
        extension
    ))
}

/// Write `contents` (the ledger's current on-disk bytes) to a new backup.
///
/// Fails with [`Error::BackupCollision`] if the target name already exists.
pub fn create_backup(
    ledger_path: &Path,
    contents: &[u8],
    backup_dir: &Path,
    timestamp: NaiveDateTime,
) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir).map_err(|e| Error::FileWrite {
        path: backup_dir.to_path_buf(),
        source: e,
    })?;

    let backup_path = backup_dir.join(backup_file_name(ledger_path, timestamp)?);

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&backup_path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Error::BackupCollision(backup_path));
        }
        Err(e) => {
            return Err(Error::FileWrite {
                path: backup_path,
                source: e,
            })
        }
    };

    if let Err(e) = file.write_all(contents).and_then(|_| file.sync_all()) {
        drop(file);
        // Only remove what this call created
        let _ = fs::remove_file(&backup_path);
        return Err(Error::FileWrite {
            path: backup_path,
            source: e,
        });
    }

    log::info!("backup created: {}", backup_path.display());

    Ok(backup_path)
}

/// Parse the timestamp out of a backup file name for this ledger
pub fn parse_backup_name(ledger_path: &Path, file_name: &str) -> Option<NaiveDateTime> {
    let (stem, extension) = stem_and_extension(ledger_path).ok()?;
    let timestamp = file_name
        .strip_prefix(&stem)?
        .strip_prefix('_')?
        .strip_suffix(&extension)?
        .strip_suffix('.')?;
    NaiveDateTime::parse_from_str(timestamp, BACKUP_TIMESTAMP_FORMAT).ok()
}

/// List the backups of a ledger, newest first
pub fn list_backups(ledger_path: &Path, backup_dir: &Path) -> Result<Vec<BackupEntry>> {
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();

    for entry in WalkDir::new(backup_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        let Some(timestamp) = parse_backup_name(ledger_path, &file_name) else {
            continue;
        };

        backups.push(BackupEntry {
            path: entry.path().to_path_buf(),
            timestamp,
            size: entry.metadata()?.len(),
        });
    }

    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    Ok(backups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_backup_file_name() {
        let name = backup_file_name(Path::new("data/account_transactions.csv"), ts(7, 5, 3)).unwrap();
        assert_eq!(name, "account_transactions_20240309_070503.csv");
    }

    #[test]
    fn test_create_backup_copies_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        let contents = b"Data;Tipo\r\n2024-01-01;Buy\r\n";

        let path = create_backup(&ledger, contents, &dir.path().join("backups"), ts(10, 0, 0)).unwrap();

        assert_eq!(path, dir.path().join("backups/ledger_20240309_100000.csv"));
        assert_eq!(fs::read(&path).unwrap(), contents);
    }

    #[test]
    fn test_collision_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        let backups = dir.path().join("backups");

        create_backup(&ledger, b"first", &backups, ts(10, 0, 0)).unwrap();
        let err = create_backup(&ledger, b"second", &backups, ts(10, 0, 0)).unwrap_err();

        assert!(matches!(err, Error::BackupCollision(_)));
        assert_eq!(fs::read(backups.join("ledger_20240309_100000.csv")).unwrap(), b"first");
    }

    #[test]
    fn test_parse_backup_name() {
        let ledger = Path::new("ledger.csv");
        assert_eq!(parse_backup_name(ledger, "ledger_20240309_070503.csv"), Some(ts(7, 5, 3)));
        assert_eq!(parse_backup_name(ledger, "other_20240309_070503.csv"), None);
        assert_eq!(parse_backup_name(ledger, "ledger_notatime.csv"), None);
        assert_eq!(parse_backup_name(ledger, "ledger_20240309_070503.txt"), None);
    }

    #[test]
    fn test_list_backups_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        let backups = dir.path().join("backups");

        create_backup(&ledger, b"a", &backups, ts(8, 0, 0)).unwrap();
        create_backup(&ledger, b"bb", &backups, ts(9, 0, 0)).unwrap();
        fs::write(backups.join("notes.txt"), "ignored").unwrap();

        let listed = list_backups(&ledger, &backups).unwrap();

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].timestamp, ts(9, 0, 0));
        assert_eq!(listed[0].size, 2);
        assert_eq!(listed[1].timestamp, ts(8, 0, 0));
    }

    #[test]
    fn test_list_backups_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let listed = list_backups(&dir.path().join("ledger.csv"), &dir.path().join("none")).unwrap();
        assert!(listed.is_empty());
    }
}
