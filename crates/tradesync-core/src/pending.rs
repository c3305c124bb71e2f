//! Marker for an update that was written but not yet published
//!
//! `<ledger>.pending` is written right before the publish step and removed
//! once the sink accepts the update. A later run that finds nothing new
//! publishes from the marker instead.

use crate::error::{Error, Result};
use crate::ledger::write_atomic;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What still has to be published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPublication {
    pub message: String,
    pub backup: Option<PathBuf>,
    pub written_at: String,
}

/// Path of the marker for `ledger_path`
pub fn pending_path_for(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".pending");
    ledger_path.with_file_name(name)
}

pub fn save_pending(ledger_path: &Path, pending: &PendingPublication) -> Result<()> {
    let path = pending_path_for(ledger_path);
    let json = serde_json::to_vec_pretty(pending).map_err(|e| Error::FileWrite {
        path: path.clone(),
        source: io::Error::from(e),
    })?;
    write_atomic(&path, &json)
}

/// The marker, if one exists. An unreadable marker is reported and ignored.
pub fn load_pending(ledger_path: &Path) -> Result<Option<PendingPublication>> {
    let path = pending_path_for(ledger_path);
    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::FileRead { path, source: e }),
    };

    match serde_json::from_slice(&contents) {
        Ok(pending) => Ok(Some(pending)),
        Err(e) => {
            log::warn!("ignoring unreadable publish marker {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

pub fn clear_pending(ledger_path: &Path) -> Result<()> {
    let path = pending_path_for(ledger_path);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::FileWrite { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        assert_eq!(load_pending(&ledger).unwrap(), None);

        let pending = PendingPublication {
            message: "Update transactions 2024-03-09 10:00:00 (+1)".to_string(),
            backup: Some(dir.path().join("backups/ledger_20240309_100000.csv")),
            written_at: "2024-03-09T10:00:00+01:00".to_string(),
        };
        save_pending(&ledger, &pending).unwrap();

        assert!(dir.path().join("ledger.csv.pending").exists());
        assert_eq!(load_pending(&ledger).unwrap(), Some(pending));

        clear_pending(&ledger).unwrap();
        assert_eq!(load_pending(&ledger).unwrap(), None);
        clear_pending(&ledger).unwrap();
    }

    #[test]
    fn test_corrupt_marker_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        fs::write(pending_path_for(&ledger), "{not json").unwrap();

        assert_eq!(load_pending(&ledger).unwrap(), None);
    }
}
