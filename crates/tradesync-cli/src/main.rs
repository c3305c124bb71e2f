//! tradesync CLI
//!
//! Command-line tool for exporting broker transactions, merging them into the
//! ledger and publishing the result.

mod exit_codes;

use clap::{Parser, Subcommand};
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use tradesync_core::config::SinkKind;
use tradesync_core::{
    find_duplicates, list_backups, read_ledger, write_template, Config, Orchestrator, RunOutcome,
    RunSummary,
};

#[derive(Parser)]
#[command(name = "tradesync")]
#[command(about = "Keep a brokerage transaction ledger up to date", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/tradesync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export, merge, back up, write and publish
    Run {
        /// Stop after the merge and report what would be added
        #[arg(long)]
        dry_run: bool,

        /// Use an existing export instead of running the export command
        #[arg(long)]
        export_file: Option<PathBuf>,
    },

    /// Merge an export file into a ledger without publishing
    Merge {
        /// Ledger to update
        #[arg(short, long)]
        ledger: PathBuf,

        /// Export CSV to merge
        #[arg(short, long)]
        export: PathBuf,

        /// Backup directory (default: from configuration)
        #[arg(short, long)]
        backup_dir: Option<PathBuf>,
    },

    /// Validate a ledger and report duplicate rows
    Check {
        /// Ledger to check (default: from configuration)
        #[arg(short, long)]
        ledger: Option<PathBuf>,
    },

    /// List ledger backups, newest first
    Backups,

    /// Write a configuration template
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli) {
        Ok(()) => exit_codes::EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_codes::for_error(&e)
        }
    };
    process::exit(i32::from(code));
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn run(cli: Cli) -> tradesync_core::Result<()> {
    let config_path = cli.config.as_deref();
    let json = cli.json;
    log::debug!("tradesync {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run {
            dry_run,
            export_file,
        } => cmd_run(config_path, dry_run, export_file.as_deref(), json),
        Commands::Merge {
            ledger,
            export,
            backup_dir,
        } => cmd_merge(config_path, &ledger, &export, backup_dir, json),
        Commands::Check { ledger } => cmd_check(config_path, ledger, json),
        Commands::Backups => cmd_backups(config_path, json),
        Commands::Init { force } => cmd_init(config_path, force),
    }
}

fn cmd_run(
    config_path: Option<&Path>,
    dry_run: bool,
    export_file: Option<&Path>,
    json: bool,
) -> tradesync_core::Result<()> {
    let config = Config::discover(config_path)?;
    let orchestrator = Orchestrator::from_config(&config, export_file, dry_run)?;
    report(orchestrator.run_once(), json)
}

fn cmd_merge(
    config_path: Option<&Path>,
    ledger: &Path,
    export: &Path,
    backup_dir: Option<PathBuf>,
    json: bool,
) -> tradesync_core::Result<()> {
    let mut config = Config::discover(config_path)?.with_ledger(ledger);
    if let Some(dir) = backup_dir {
        config.ledger.backup_dir = if dir.is_absolute() {
            dir
        } else {
            env::current_dir()?.join(dir)
        };
    }
    config.publish.sink = SinkKind::None;

    let orchestrator = Orchestrator::from_config(&config, Some(export), false)?;
    report(orchestrator.run_once(), json)
}

/// How a successful run ended, as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    NoNewTransactions,
    Updated,
    WouldUpdate,
    Republished,
}

impl Ending {
    fn label(self) -> &'static str {
        match self {
            Ending::NoNewTransactions => "no-new-transactions",
            Ending::Updated => "updated",
            Ending::WouldUpdate => "would-update",
            Ending::Republished => "republished",
        }
    }
}

fn report(outcome: RunOutcome, json: bool) -> tradesync_core::Result<()> {
    let (ending, summary) = match outcome {
        RunOutcome::NoNewTransactions(s) => (Ending::NoNewTransactions, s),
        RunOutcome::Updated(s) => (Ending::Updated, s),
        RunOutcome::WouldUpdate(s) => (Ending::WouldUpdate, s),
        RunOutcome::Republished(s) => (Ending::Republished, s),
        RunOutcome::Failed(e) => return Err(e),
    };

    if json {
        let value = serde_json::json!({
            "outcome": ending.label(),
            "summary": &summary,
            "published": summary.receipt.as_ref().map(|r| r.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print_summary(ending, &summary);
    Ok(())
}

fn headline(ending: Ending, summary: &RunSummary) -> String {
    match ending {
        Ending::NoNewTransactions => "No new transactions".to_string(),
        Ending::WouldUpdate => format!("Dry run: {} new transaction(s) would be added", summary.added),
        Ending::Updated => format!("Added {} new transaction(s)", summary.added),
        Ending::Republished if summary.receipt.is_some() => {
            "No new transactions; published the update left pending by an earlier run".to_string()
        }
        Ending::Republished => {
            "No new transactions; the update left pending by an earlier run was already published"
                .to_string()
        }
    }
}

fn print_summary(ending: Ending, summary: &RunSummary) {
    println!("{}", headline(ending, summary));
    println!("  Export records: {}", summary.fetched);
    println!("  Skipped:        {}", summary.skipped);
    println!("  Ledger rows:    {}", summary.total);
    if let Some(backup) = &summary.backup {
        println!("  Backup:         {}", backup.display());
    }
    if let Some(receipt) = &summary.receipt {
        println!("  Published:      {}", receipt);
    }

    if !summary.skipped_samples.is_empty() {
        println!();
        println!("Skipped records:");
        for sample in &summary.skipped_samples {
            println!("  line {} ({}): {}", sample.line, sample.reason, sample.raw);
        }
        if summary.skipped > summary.skipped_samples.len() {
            println!("  ... ({} more)", summary.skipped - summary.skipped_samples.len());
        }
    }
}

fn cmd_check(
    config_path: Option<&Path>,
    ledger: Option<PathBuf>,
    json: bool,
) -> tradesync_core::Result<()> {
    let mut config = Config::discover(config_path)?;
    if let Some(path) = ledger {
        config = config.with_ledger(path);
    }
    let format = config.ledger_format()?;
    let ledger = read_ledger(config.ledger_path(), &format)?;
    let duplicates = find_duplicates(ledger.rows());

    if json {
        let pairs: Vec<_> = duplicates
            .iter()
            .map(|(first, dup)| serde_json::json!({ "first_line": first + 2, "duplicate_line": dup + 2 }))
            .collect();
        let value = serde_json::json!({
            "ledger": config.ledger_path(),
            "rows": ledger.len(),
            "line_ending": ledger.line_ending(),
            "duplicates": pairs,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Ledger: {}", config.ledger_path().display());
    println!("  Header:      ok ({} fields)", format.field_count());
    println!("  Rows:        {}", ledger.len());
    println!("  Line ending: {:?}", ledger.line_ending());

    if duplicates.is_empty() {
        println!("  Duplicates:  none");
    } else {
        println!("  Duplicates:  {}", duplicates.len());
        // Line numbers count the header as line 1
        for (first, dup) in &duplicates {
            println!("    line {} repeats line {}: {}", dup + 2, first + 2, ledger.rows()[*dup]);
        }
    }

    Ok(())
}

fn cmd_backups(config_path: Option<&Path>, json: bool) -> tradesync_core::Result<()> {
    let config = Config::discover(config_path)?;
    let backup_dir = config.backup_dir();
    let backups = list_backups(config.ledger_path(), &backup_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
        return Ok(());
    }

    if backups.is_empty() {
        println!("No backups in {}", backup_dir.display());
        return Ok(());
    }

    println!("Backups in {} ({}):", backup_dir.display(), backups.len());
    for backup in &backups {
        println!(
            "  {}  {:>10} bytes  {}",
            backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
            backup.size,
            backup.path.display()
        );
    }

    Ok(())
}

fn cmd_init(config_path: Option<&Path>, force: bool) -> tradesync_core::Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_path().ok_or_else(|| {
            tradesync_core::Error::Config(
                "cannot determine the configuration directory, pass --config".to_string(),
            )
        })?,
    };

    write_template(&path, force)?;
    println!("Wrote configuration template to {}", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradesync_core::PublishReceipt;

    #[test]
    fn test_headline_per_ending() {
        let summary = RunSummary {
            added: 3,
            ..RunSummary::default()
        };

        assert_eq!(headline(Ending::Updated, &summary), "Added 3 new transaction(s)");
        assert_eq!(
            headline(Ending::WouldUpdate, &summary),
            "Dry run: 3 new transaction(s) would be added"
        );
        assert_eq!(headline(Ending::NoNewTransactions, &summary), "No new transactions");
        assert!(headline(Ending::Republished, &summary).contains("already published"));

        let published = RunSummary {
            receipt: Some(PublishReceipt {
                sink: "git",
                detail: "pushed to origin/main".to_string(),
            }),
            ..RunSummary::default()
        };
        assert!(headline(Ending::Republished, &published).contains("published the update"));
    }

    #[test]
    fn test_labels_are_distinct() {
        let endings = [
            Ending::NoNewTransactions,
            Ending::Updated,
            Ending::WouldUpdate,
            Ending::Republished,
        ];
        let mut labels: Vec<&str> = endings.iter().map(|e| e.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), endings.len());
    }
}
