//! One end-to-end run: export, ingest, merge, backup, write, publish
//!
//! Every fatal error before the write leaves the ledger, the backup directory
//! and the sink untouched. A publish failure happens after the write; the
//! ledger on disk is then already updated and a pending marker records what
//! still has to be published. The next run that finds nothing new publishes
//! from the marker.

use crate::backup::create_backup;
use crate::config::{Config, MissingLedger};
use crate::error::{Error, FailureKind, Result};
use crate::export::ExportProvider;
use crate::ingest::{ingest_export, SkippedRecord};
use crate::ledger::{parse_ledger, read_ledger_bytes, write_ledger, Ledger, LedgerFormat};
use crate::lock::RunLock;
use crate::merger::merge;
use crate::pending::{clear_pending, load_pending, save_pending, PendingPublication};
use crate::publish::{publish_message, Publication, PublishError, PublishReceipt, Publisher};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Source of the run timestamp
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
}

/// Wall clock in local time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Paths and policies for a run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub ledger_path: PathBuf,
    pub backup_dir: PathBuf,
    pub format: LedgerFormat,
    pub missing: MissingLedger,
    /// Stop after the merge
    pub dry_run: bool,
}

impl RunSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            ledger_path: config.ledger_path().to_path_buf(),
            backup_dir: config.backup_dir(),
            format: config.ledger_format()?,
            missing: config.ledger.missing,
            dry_run: false,
        })
    }
}

/// Counts and artifacts of a run that got past the merge
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Data records in the export
    pub fetched: usize,
    /// Records excluded as malformed
    pub skipped: usize,
    #[serde(skip)]
    pub skipped_samples: Vec<SkippedRecord>,
    /// Rows appended to the ledger
    pub added: usize,
    /// Ledger rows after the run
    pub total: usize,
    pub backup: Option<PathBuf>,
    #[serde(skip)]
    pub receipt: Option<PublishReceipt>,
}

/// Result of [`Orchestrator::run_once`]
#[derive(Debug)]
pub enum RunOutcome {
    /// Nothing new: no write, no backup, no publish
    NoNewTransactions(RunSummary),
    /// Written, backed up and published
    Updated(RunSummary),
    /// Dry run found additions; nothing was written
    WouldUpdate(RunSummary),
    /// Nothing new, but an update left unpublished by an earlier run was published
    Republished(RunSummary),
    Failed(Error),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RunOutcome::Failed(_))
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunOutcome::NoNewTransactions(s)
            | RunOutcome::Updated(s)
            | RunOutcome::WouldUpdate(s)
            | RunOutcome::Republished(s) => Some(s),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RunOutcome::Failed(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Sequences one run against a single ledger
pub struct Orchestrator {
    settings: RunSettings,
    exporter: Box<dyn ExportProvider>,
    publisher: Box<dyn Publisher>,
    clock: Box<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        exporter: Box<dyn ExportProvider>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            settings,
            exporter,
            publisher,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build from configuration; `export_file` replaces the export command
    pub fn from_config(config: &Config, export_file: Option<&Path>, dry_run: bool) -> Result<Self> {
        let mut settings = RunSettings::from_config(config)?;
        settings.dry_run = dry_run;
        Ok(Self::new(
            settings,
            config.export_provider(export_file),
            config.publisher()?,
        ))
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Perform one run. Never panics on run errors; they become [`RunOutcome::Failed`].
    pub fn run_once(&self) -> RunOutcome {
        match self.try_run() {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("run failed ({}): {}", e.kind(), e);
                RunOutcome::Failed(e)
            }
        }
    }

    fn try_run(&self) -> Result<RunOutcome> {
        let settings = &self.settings;
        let path = settings.ledger_path.as_path();
        let operation = if settings.dry_run { "dry-run" } else { "run" };
        let _lock = RunLock::acquire(path, operation)?;

        // The ledger is checked before the export so a bad setup fails
        // without an interactive login
        let previous = self.load_previous()?;
        let ledger = match &previous {
            Some(bytes) => parse_ledger(bytes, path, &settings.format)?,
            None => Ledger::new(settings.format.header.clone(), settings.format.line_ending),
        };
        log::info!("ledger {} has {} rows", path.display(), ledger.len());

        log::info!("fetching export from {}", self.exporter.describe());
        let raw = self.exporter.fetch()?;
        let batch = ingest_export(&raw, &settings.format)?;
        log::info!(
            "export: {} records, {} usable, {} skipped",
            batch.total_records,
            batch.usable_count(),
            batch.skipped_count
        );

        let result = merge(ledger, &batch.rows);
        let mut summary = RunSummary {
            fetched: batch.total_records,
            skipped: batch.skipped_count,
            skipped_samples: batch.skipped_samples,
            added: result.added,
            total: result.ledger.len(),
            backup: None,
            receipt: None,
        };

        if result.is_noop() {
            log::info!("no new transactions");
            if !settings.dry_run {
                if let Some(pending) = load_pending(path)? {
                    summary.backup = pending.backup.clone();
                    summary.receipt = self.republish(pending)?;
                    return Ok(RunOutcome::Republished(summary));
                }
            }
            return Ok(RunOutcome::NoNewTransactions(summary));
        }
        if settings.dry_run {
            log::info!("dry run: {} transactions would be added", result.added);
            return Ok(RunOutcome::WouldUpdate(summary));
        }

        let now = self.clock.now();
        if let Some(bytes) = &previous {
            summary.backup = Some(create_backup(
                path,
                bytes,
                &settings.backup_dir,
                now.naive_local(),
            )?);
        }

        write_ledger(path, &result.ledger, &settings.format)?;
        log::info!("ledger updated: +{} rows, {} total", result.added, summary.total);

        let publication = Publication {
            ledger: path.to_path_buf(),
            backup: summary.backup.clone(),
            message: publish_message(&now, result.added),
        };
        save_pending(
            path,
            &PendingPublication {
                message: publication.message.clone(),
                backup: publication.backup.clone(),
                written_at: now.to_rfc3339(),
            },
        )?;
        let receipt = self.publisher.publish(&publication).map_err(|e| {
            log::warn!("ledger was written but not published, the next run retries");
            Error::Publish(e)
        })?;
        clear_pending(path)?;
        log::info!("published via {}", receipt);
        summary.receipt = Some(receipt);

        Ok(RunOutcome::Updated(summary))
    }

    /// Publish an update an earlier run wrote but failed to publish.
    /// `None` means the sink already had it.
    fn republish(&self, pending: PendingPublication) -> Result<Option<PublishReceipt>> {
        let path = self.settings.ledger_path.as_path();
        log::info!(
            "publishing update left pending since {}: {}",
            pending.written_at,
            pending.message
        );

        let publication = Publication {
            ledger: path.to_path_buf(),
            backup: pending.backup.filter(|backup| backup.exists()),
            message: pending.message,
        };
        match self.publisher.publish(&publication) {
            Ok(receipt) => {
                clear_pending(path)?;
                log::info!("published via {}", receipt);
                Ok(Some(receipt))
            }
            Err(PublishError::NothingToCommit) => {
                log::info!("{} already has the pending update", self.publisher.name());
                clear_pending(path)?;
                Ok(None)
            }
            Err(e) => {
                log::warn!("pending update still not published");
                Err(Error::Publish(e))
            }
        }
    }

    /// Current on-disk bytes, or `None` if the missing-ledger policy allows creating it
    fn load_previous(&self) -> Result<Option<Vec<u8>>> {
        match read_ledger_bytes(&self.settings.ledger_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::LedgerNotFound(path)) if self.settings.missing == MissingLedger::Create => {
                log::info!("ledger {} does not exist, it will be created", path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
