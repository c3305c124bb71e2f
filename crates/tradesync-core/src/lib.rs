//! tradesync-core: Core library for keeping a brokerage transaction ledger up to date
//!
//! This library provides functionality to:
//! - Run the broker export utility and ingest its CSV, skipping malformed records
//! - Load and atomically rewrite the append-only ledger
//! - Merge new transactions by exact-row identity, preserving ledger order
//! - Snapshot the ledger into timestamped backups before each write
//! - Publish the result to a git remote or a Google Drive folder, retrying
//!   unpublished updates on the next run

pub mod backup;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod ledger;
pub mod lock;
pub mod merger;
pub mod pending;
pub mod process;
pub mod publish;
pub mod row;
pub mod runner;

pub use backup::{create_backup, list_backups, BackupEntry};
pub use config::{write_template, Config, MissingLedger, SinkKind};
pub use error::{Error, FailureKind, Result};
pub use export::{CommandExportProvider, ExportError, ExportProvider, FileExportProvider};
pub use ingest::{ingest_export, ExportBatch, SkipReason, SkippedRecord};
pub use ledger::{read_ledger, write_ledger, Ledger, LedgerFormat, LineEnding};
pub use lock::RunLock;
pub use merger::{find_duplicates, merge, MergeResult};
pub use pending::PendingPublication;
pub use publish::{Publication, PublishError, PublishReceipt, Publisher};
pub use row::Row;
pub use runner::{Orchestrator, RunOutcome, RunSettings, RunSummary};
