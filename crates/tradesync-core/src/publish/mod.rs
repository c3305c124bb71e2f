//! Publishing the updated ledger to a durable sink
//!
//! Two sinks are supported: a git repository (commit and push) and a Google
//! Drive folder (upload by stable file id). Both sit behind [`Publisher`].

pub mod drive;
pub mod git;

pub use drive::{DriveOptions, DrivePublisher, RetryPolicy};
pub use git::GitPublisher;

use chrono::{DateTime, TimeZone};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a publisher
#[derive(Debug, Error)]
pub enum PublishError {
    /// git found no staged changes
    #[error("nothing to commit")]
    NothingToCommit,

    /// The remote refused the push, usually because it is ahead
    #[error("push rejected by remote: {0}")]
    PushRejected(String),

    /// git could not authenticate or reach the remote
    #[error("git authentication or network failure: {0}")]
    AuthOrNetwork(String),

    /// The cloud access token is missing, expired or lacks permission
    #[error("cloud authentication failed: {0}")]
    AuthExpired(String),

    /// Cloud quota exhausted, rate limited, server or transport failure
    #[error("cloud quota or network failure: {0}")]
    QuotaOrNetwork(String),

    /// A remote object referenced by id does not exist
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// An external step did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// A command failed for a reason not classified above
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// A path to publish lies outside the git repository
    #[error("'{0}' is not inside the repository")]
    OutsideRepository(PathBuf),

    /// The remote answered with something unexpected
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// Local IO failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What to publish for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// The updated ledger
    pub ledger: PathBuf,
    /// Snapshot of the previous ledger, if one was taken
    pub backup: Option<PathBuf>,
    /// Commit message / description
    pub message: String,
}

impl Publication {
    /// All files that make up this publication
    pub fn paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.ledger.as_path()];
        if let Some(backup) = &self.backup {
            paths.push(backup.as_path());
        }
        paths
    }
}

/// Confirmation returned by a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Which sink handled it
    pub sink: &'static str,
    /// Sink-specific detail (branch pushed, file id, ...)
    pub detail: String,
}

impl fmt::Display for PublishReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.sink, self.detail)
    }
}

/// A durable sink: accepts files, reports success or failure
pub trait Publisher {
    /// Name used in logs and receipts
    fn name(&self) -> &'static str;

    /// Deliver the publication
    fn publish(&self, publication: &Publication) -> Result<PublishReceipt, PublishError>;
}

/// Sink that keeps everything local
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnly;

impl Publisher for LocalOnly {
    fn name(&self) -> &'static str {
        "local"
    }

    fn publish(&self, publication: &Publication) -> Result<PublishReceipt, PublishError> {
        log::info!("publishing disabled, ledger kept at {}", publication.ledger.display());
        Ok(PublishReceipt {
            sink: self.name(),
            detail: "not published".to_string(),
        })
    }
}

/// Message shared by every sink: timestamp and number of additions
pub fn publish_message<Tz>(timestamp: &DateTime<Tz>, added: usize) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!(
        "Update transactions {} (+{})",
        timestamp.format("%Y-%m-%d %H:%M:%S"),
        added
    )
}
