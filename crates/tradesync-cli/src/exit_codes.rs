//! Process exit codes
//!
//! 0-2 are generic; 10 and up name the reason a run failed so schedulers
//! can tell a broken export from a rejected push.

use tradesync_core::{Error, FailureKind};

pub const EXIT_SUCCESS: u8 = 0;

/// Failure not attributable to a specific step
pub const EXIT_ERROR: u8 = 1;

/// Bad arguments or configuration
pub const EXIT_USAGE: u8 = 2;

pub const EXIT_INGESTION: u8 = 10;
pub const EXIT_EXPORT: u8 = 11;
pub const EXIT_LEDGER_FORMAT: u8 = 12;
pub const EXIT_LEDGER_MISSING: u8 = 13;
pub const EXIT_BACKUP_COLLISION: u8 = 14;
pub const EXIT_WRITE: u8 = 15;
pub const EXIT_PUBLISH: u8 = 16;
pub const EXIT_LOCK_HELD: u8 = 17;

pub fn for_kind(kind: FailureKind) -> u8 {
    match kind {
        FailureKind::IngestionFatal => EXIT_INGESTION,
        FailureKind::ExportFailed => EXIT_EXPORT,
        FailureKind::LedgerFormatMismatch => EXIT_LEDGER_FORMAT,
        FailureKind::LedgerMissing => EXIT_LEDGER_MISSING,
        FailureKind::BackupCollision => EXIT_BACKUP_COLLISION,
        FailureKind::WriteFailure => EXIT_WRITE,
        FailureKind::PublishFailure => EXIT_PUBLISH,
        FailureKind::LockHeld => EXIT_LOCK_HELD,
        FailureKind::Configuration => EXIT_USAGE,
    }
}

pub fn for_error(error: &Error) -> u8 {
    match error {
        // Run steps report write errors as FileWrite with a path; bare
        // Io/Json only come from the CLI itself, e.g. printing output
        Error::Io(_) | Error::Json(_) => EXIT_ERROR,
        other => for_kind(other.kind()),
    }
}
