//! Single-writer lock next to the ledger
//!
//! A run holds `<ledger>.lock` from before it reads the ledger until after it
//! publishes. The file records who holds it; a lock whose process is gone or
//! which is older than [`LOCK_STALE_AFTER_SECS`] is archived and taken over.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Age after which a lock is considered abandoned
pub const LOCK_STALE_AFTER_SECS: i64 = 6 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created_at: String,
    operation: String,
}

/// Path of the lock file guarding `ledger_path`
pub fn lock_path_for(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    ledger_path.with_file_name(name)
}

/// Held for the duration of a mutating run, released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    pub fn acquire(ledger_path: &Path, operation: &str) -> Result<Self> {
        let path = lock_path_for(ledger_path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        if path.exists() {
            match read_info(&path)? {
                Some(info) if !is_stale(&info) => {
                    return Err(Error::LockHeld {
                        path,
                        pid: info.pid,
                        since: info.created_at,
                    });
                }
                Some(info) => {
                    log::warn!(
                        "taking over stale lock held by pid {} since {}",
                        info.pid,
                        info.created_at
                    );
                    archive(&path, "stale")?;
                }
                None => {
                    log::warn!("lock file {} is unreadable, archiving it", path.display());
                    archive(&path, "corrupt")?;
                }
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            created_at: Utc::now().to_rfc3339(),
            operation: operation.to_string(),
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost a race with another run
                let holder = read_info(&path)?;
                return Err(Error::LockHeld {
                    pid: holder.as_ref().map(|i| i.pid).unwrap_or_default(),
                    since: holder.map(|i| i.created_at).unwrap_or_default(),
                    path,
                });
            }
            Err(e) => {
                return Err(Error::FileWrite { path, source: e });
            }
        };

        if let Err(e) = write_info(&mut file, &path, &info) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        log::debug!("acquired lock {} for {}", path.display(), operation);

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, reporting failure
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::FileWrite {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

fn write_info(file: &mut fs::File, path: &Path, info: &LockInfo) -> Result<()> {
    let file_write_err = |source| Error::FileWrite {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(info).map_err(|e| file_write_err(io::Error::from(e)))?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(file_write_err)
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::warn!("failed to release lock: {}", e);
        }
    }
}

fn read_info(path: &Path) -> Result<Option<LockInfo>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        // Released between exists() and read
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(None),
        Err(e) => {
            return Err(Error::FileRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    Ok(serde_json::from_str(&contents).ok())
}

fn is_stale(info: &LockInfo) -> bool {
    if !pid_is_alive(info.pid) {
        return true;
    }

    match DateTime::parse_from_rfc3339(&info.created_at) {
        Ok(created) => Utc::now().signed_duration_since(created).num_seconds() > LOCK_STALE_AFTER_SECS,
        Err(_) => true,
    }
}

fn archive(path: &Path, reason: &str) -> Result<()> {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.{}", reason, Utc::now().timestamp_millis()));
    let archived = path.with_file_name(name);

    match fs::rename(path, &archived) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::FileWrite {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn write_lock(path: &Path, pid: u32, created_at: DateTime<Utc>) {
        let info = LockInfo {
            pid,
            created_at: created_at.to_rfc3339(),
            operation: "run".to_string(),
        };
        fs::write(path, serde_json::to_string(&info).unwrap()).unwrap();
    }

    #[test]
    fn test_write_info_failure_is_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.csv.lock");
        fs::write(&path, "").unwrap();
        let info = LockInfo {
            pid: 1,
            created_at: Utc::now().to_rfc3339(),
            operation: "run".to_string(),
        };

        // Read-only handle: the write is refused
        let mut file = fs::File::open(&path).unwrap();
        let err = write_info(&mut file, &path, &info).unwrap_err();

        assert!(matches!(&err, Error::FileWrite { path: p, .. } if *p == path));
        assert_eq!(err.kind(), crate::error::FailureKind::WriteFailure);
    }

    #[test]
    fn test_lock_path_for() {
        assert_eq!(
            lock_path_for(Path::new("data/ledger.csv")),
            PathBuf::from("data/ledger.csv.lock")
        );
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");

        let _held = RunLock::acquire(&ledger, "run").unwrap();
        let err = RunLock::acquire(&ledger, "run").unwrap_err();

        match err {
            Error::LockHeld { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("expected LockHeld, got {:?}", other),
        }
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");

        {
            let lock = RunLock::acquire(&ledger, "run").unwrap();
            assert!(lock.path().exists());
        }

        assert!(!lock_path_for(&ledger).exists());
        RunLock::acquire(&ledger, "run").unwrap().release().unwrap();
        assert!(!lock_path_for(&ledger).exists());
    }

    #[test]
    fn test_old_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        write_lock(
            &lock_path_for(&ledger),
            std::process::id(),
            Utc::now() - Duration::hours(7),
        );

        let lock = RunLock::acquire(&ledger, "run").unwrap();

        assert!(lock.path().exists());
        let archived = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("ledger.csv.lock.stale."))
            .count();
        assert_eq!(archived, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dead_holder_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        write_lock(&lock_path_for(&ledger), u32::MAX, Utc::now());

        assert!(RunLock::acquire(&ledger, "run").is_ok());
    }

    #[test]
    fn test_corrupt_lock_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("ledger.csv");
        fs::write(lock_path_for(&ledger), "not json").unwrap();

        assert!(RunLock::acquire(&ledger, "run").is_ok());
    }
}
