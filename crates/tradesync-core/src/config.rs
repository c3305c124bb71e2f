//! Configuration file handling
//!
//! Everything a run needs is read once from a TOML file into an immutable
//! [`Config`], which is then handed to the orchestrator explicitly.

use crate::error::{Error, Result};
use crate::export::{CommandExportProvider, ExportProvider, FileExportProvider};
use crate::ledger::{write_atomic, LedgerFormat, LineEnding, DEFAULT_HEADER};
use crate::publish::drive::state_path_for;
use crate::publish::{DriveOptions, DrivePublisher, GitPublisher, LocalOnly, Publisher};
use crate::row::Row;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ledger file name used when none is configured
pub const DEFAULT_LEDGER_NAME: &str = "account_transactions.csv";

/// Written by `tradesync init`
pub const TEMPLATE: &str = r#"# tradesync configuration
#
# Relative paths are resolved against the directory of this file.

[ledger]
path = "account_transactions.csv"
# Relative to the ledger's directory
backup_dir = "backups"
header = ["Data", "Tipo", "Valore", "Note", "ISIN", "Azioni", "Commissioni", "Tasse"]
delimiter = ";"
# Line ending for a newly created ledger: "crlf" or "lf"
line_ending = "crlf"
# What to do when the ledger does not exist: "create" or "error"
missing = "create"

[export]
# The output file path is appended as the last argument
command = ["uvx", "pytr@latest", "export_transactions"]
timeout_secs = 600

[publish]
# "git", "drive" or "none"
sink = "none"

[publish.git]
# Defaults to the ledger's directory
# repo = "."
remote = "origin"
branch = "main"
timeout_secs = 120

[publish.drive]
# folder_id = "..."
# file_id = "..."
# target_name = "account_transactions.csv"
backup_folder_name = "backups"
# Environment variable holding the OAuth access token
token_env = "TRADESYNC_DRIVE_TOKEN"
timeout_secs = 120
# Attempts per read or upload on quota, network or timeout failures
retry_attempts = 4
"#;

/// Policy when the ledger file does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingLedger {
    /// Treat as header-only, create on first write
    #[default]
    Create,
    /// Fail the run
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Git,
    Drive,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub backup_dir: PathBuf,
    pub header: Vec<String>,
    pub delimiter: String,
    pub line_ending: LineEnding,
    pub missing: MissingLedger,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LEDGER_NAME),
            backup_dir: PathBuf::from("backups"),
            header: DEFAULT_HEADER.iter().map(|s| s.to_string()).collect(),
            delimiter: ";".to_string(),
            line_ending: LineEnding::default(),
            missing: MissingLedger::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "uvx".to_string(),
                "pytr@latest".to_string(),
                "export_transactions".to_string(),
            ],
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitConfig {
    pub repo: Option<PathBuf>,
    pub remote: String,
    pub branch: String,
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo: None,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriveConfig {
    pub folder_id: Option<String>,
    pub file_id: Option<String>,
    /// Defaults to the ledger's file name
    pub target_name: Option<String>,
    pub backup_folder_name: String,
    pub token_env: String,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub api_base: String,
    pub upload_base: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            folder_id: None,
            file_id: None,
            target_name: None,
            backup_folder_name: "backups".to_string(),
            token_env: "TRADESYNC_DRIVE_TOKEN".to_string(),
            timeout_secs: 120,
            retry_attempts: 4,
            api_base: crate::publish::drive::DEFAULT_API_BASE.to_string(),
            upload_base: crate::publish::drive::DEFAULT_UPLOAD_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    pub sink: SinkKind,
    pub git: GitConfig,
    pub drive: DriveConfig,
}

/// Complete tool configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub export: ExportConfig,
    pub publish: PublishConfig,
}

impl Config {
    /// `<config_dir>/tradesync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tradesync").join("config.toml"))
    }

    /// Load and validate the file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config = Self::parse(&contents, path)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load an explicit file, or the default file if it exists, or built-in defaults
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                log::debug!("no configuration file found, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse TOML without resolving paths. `source` is only used in errors.
    pub fn parse(contents: &str, source: &Path) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::ConfigParse {
            path: source.to_path_buf(),
            source: e,
        })
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.ledger.path.is_relative() {
            self.ledger.path = base.join(&self.ledger.path);
        }
        if let Some(repo) = &self.publish.git.repo {
            if repo.is_relative() {
                self.publish.git.repo = Some(base.join(repo));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.header.is_empty() {
            return Err(Error::Config("ledger.header must not be empty".to_string()));
        }
        if self.ledger.path.file_name().is_none() {
            return Err(Error::Config(format!(
                "ledger.path '{}' does not name a file",
                self.ledger.path.display()
            )));
        }
        self.delimiter()?;
        if self.export.command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(Error::Config("export.command must not be empty".to_string()));
        }
        if self.publish.sink == SinkKind::Drive
            && self.publish.drive.folder_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::Config(
                "publish.drive.folder_id is required for the drive sink".to_string(),
            ));
        }
        if self.publish.drive.retry_attempts == 0 {
            return Err(Error::Config(
                "publish.drive.retry_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn delimiter(&self) -> Result<u8> {
        match self.ledger.delimiter.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(Error::Config(format!(
                "ledger.delimiter must be a single byte, got {:?}",
                self.ledger.delimiter
            ))),
        }
    }

    /// Replace the ledger path, e.g. from a command-line flag
    pub fn with_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger.path = path.into();
        self
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger.path
    }

    pub fn ledger_format(&self) -> Result<LedgerFormat> {
        Ok(LedgerFormat::new(Row::new(self.ledger.header.iter()))
            .with_delimiter(self.delimiter()?)
            .with_line_ending(self.ledger.line_ending))
    }

    /// Backup directory, resolved against the ledger's directory
    pub fn backup_dir(&self) -> PathBuf {
        if self.ledger.backup_dir.is_absolute() {
            return self.ledger.backup_dir.clone();
        }
        self.ledger_dir().join(&self.ledger.backup_dir)
    }

    fn ledger_dir(&self) -> PathBuf {
        match self.ledger.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// The configured export, or a pre-exported file when given
    pub fn export_provider(&self, export_file: Option<&Path>) -> Box<dyn ExportProvider> {
        match export_file {
            Some(path) => Box::new(FileExportProvider::new(path)),
            None => Box::new(CommandExportProvider::new(
                self.export.command.clone(),
                Duration::from_secs(self.export.timeout_secs),
            )),
        }
    }

    /// Build the configured sink
    pub fn publisher(&self) -> Result<Box<dyn Publisher>> {
        match self.publish.sink {
            SinkKind::None => Ok(Box::new(LocalOnly)),
            SinkKind::Git => {
                let git = &self.publish.git;
                let repo = git.repo.clone().unwrap_or_else(|| self.ledger_dir());
                Ok(Box::new(GitPublisher::new(
                    repo,
                    git.remote.clone(),
                    git.branch.clone(),
                    Duration::from_secs(git.timeout_secs),
                )))
            }
            SinkKind::Drive => {
                let drive = &self.publish.drive;
                let token = env::var(&drive.token_env)
                    .ok()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "drive access token not set: export it as {}",
                            drive.token_env
                        ))
                    })?;
                let folder_id = drive.folder_id.clone().ok_or_else(|| {
                    Error::Config("publish.drive.folder_id is required".to_string())
                })?;
                let target_name = match &drive.target_name {
                    Some(name) => name.clone(),
                    None => self
                        .ledger
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| DEFAULT_LEDGER_NAME.to_string()),
                };

                let mut options = DriveOptions::new(token, folder_id, target_name);
                options.file_id = drive.file_id.clone();
                options.backup_folder_name = drive.backup_folder_name.clone();
                options.timeout = Duration::from_secs(drive.timeout_secs);
                options.api_base = drive.api_base.clone();
                options.upload_base = drive.upload_base.clone();
                options.retry.attempts = drive.retry_attempts;
                options.state_path = Some(state_path_for(self.ledger_path()));

                Ok(Box::new(DrivePublisher::new(options)?))
            }
        }
    }
}

/// Write [`TEMPLATE`] to `path`, refusing to overwrite unless `force`
pub fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "'{}' already exists, use --force to overwrite",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    write_atomic(path, TEMPLATE.as_bytes())?;
    log::info!("wrote configuration template to {}", path.display());
    Ok(())
}
