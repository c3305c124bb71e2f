//! Error types for tradesync-core

use crate::export::ExportError;
use crate::publish::PublishError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tradesync-core
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV error from the csv crate
    #[error("CSV error in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// The ledger file does not exist and the policy forbids creating it
    #[error("ledger '{0}' does not exist")]
    LedgerNotFound(PathBuf),

    /// The ledger header differs from the expected header
    #[error("header mismatch in '{path}': expected '{expected}', found '{found}'")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// A persisted ledger row has the wrong number of fields
    #[error("malformed row at line {line} in '{path}': expected {expected} fields, found {found}")]
    MalformedLedgerRow {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    /// A persisted ledger row is not valid UTF-8
    #[error("invalid UTF-8 at line {line} in '{path}'")]
    InvalidUtf8 { path: PathBuf, line: u64 },

    /// The export produced no header at all
    #[error("export is empty: no header row found")]
    EmptyExport,

    /// The export header differs from the expected header
    #[error("export header mismatch: expected '{expected}', found '{found}'")]
    ExportHeaderMismatch { expected: String, found: String },

    /// Every record of the export was malformed
    #[error("export contained no usable rows ({skipped} malformed records skipped)")]
    NoUsableRows { skipped: usize },

    /// The export provider failed
    #[error(transparent)]
    Export(#[from] ExportError),

    /// A backup with the same name already exists
    #[error("backup '{0}' already exists, refusing to overwrite")]
    BackupCollision(PathBuf),

    /// The publish step failed
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Another run holds the ledger lock
    #[error("ledger is locked by pid {pid} since {since}; remove '{path}' if that process is dead")]
    LockHeld {
        path: PathBuf,
        pid: u32,
        since: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("failed to parse config '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Directory traversal error
    #[error("failed to traverse directory: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a run failed, as reported to CLI callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The export produced nothing parseable
    IngestionFatal,
    /// The export utility failed, timed out or could not be launched
    ExportFailed,
    /// The ledger on disk does not have the expected format
    LedgerFormatMismatch,
    /// The ledger does not exist
    LedgerMissing,
    /// The backup target already exists
    BackupCollision,
    /// Persisting the ledger or backup failed
    WriteFailure,
    /// The durable sink rejected the update
    PublishFailure,
    /// Another run is operating on the same ledger
    LockHeld,
    /// Configuration is missing or invalid
    Configuration,
}

impl FailureKind {
    /// Stable identifier used in CLI output
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::IngestionFatal => "ingestion-fatal",
            FailureKind::ExportFailed => "export-failed",
            FailureKind::LedgerFormatMismatch => "ledger-format-mismatch",
            FailureKind::LedgerMissing => "ledger-missing",
            FailureKind::BackupCollision => "backup-collision",
            FailureKind::WriteFailure => "write-failure",
            FailureKind::PublishFailure => "publish-failure",
            FailureKind::LockHeld => "lock-held",
            FailureKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error into a run failure reason
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::EmptyExport | Error::ExportHeaderMismatch { .. } | Error::NoUsableRows { .. } => {
                FailureKind::IngestionFatal
            }
            Error::Export(_) => FailureKind::ExportFailed,
            Error::HeaderMismatch { .. }
            | Error::MalformedLedgerRow { .. }
            | Error::InvalidUtf8 { .. }
            | Error::Csv { .. } => FailureKind::LedgerFormatMismatch,
            Error::LedgerNotFound(_) => FailureKind::LedgerMissing,
            Error::BackupCollision(_) => FailureKind::BackupCollision,
            Error::FileWrite { .. } | Error::Io(_) | Error::Json(_) => FailureKind::WriteFailure,
            Error::Publish(_) => FailureKind::PublishFailure,
            Error::LockHeld { .. } => FailureKind::LockHeld,
            Error::Config(_)
            | Error::ConfigParse { .. }
            | Error::FileRead { .. }
            | Error::WalkDir(_) => FailureKind::Configuration,
        }
    }
}
