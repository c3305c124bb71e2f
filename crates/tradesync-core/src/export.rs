//! Export providers: where the raw transaction export comes from

use crate::process::wait_with_timeout;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

/// File name handed to the export command as its output argument
pub const EXPORT_FILE_NAME: &str = "account_transactions.csv";

/// Errors produced while obtaining a raw export
#[derive(Debug, Error)]
pub enum ExportError {
    /// No program configured
    #[error("export command is empty")]
    EmptyCommand,

    /// The program could not be started
    #[error("failed to launch export command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program exited unsuccessfully
    #[error("export command failed ({status})")]
    Failed { status: String },

    /// The program did not finish in time and was killed
    #[error("export command timed out after {0:?}")]
    Timeout(Duration),

    /// The program exited successfully but wrote no file
    #[error("export command did not create '{0}'")]
    MissingOutput(PathBuf),

    /// The program wrote an empty file
    #[error("export output '{0}' is empty")]
    EmptyOutput(PathBuf),

    /// The export file could not be read
    #[error("failed to read export '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Any other IO failure while running the export
    #[error("export IO error: {0}")]
    Io(#[from] io::Error),
}

/// Source of raw export bytes for one run
pub trait ExportProvider {
    /// Produce the raw export text
    fn fetch(&self) -> Result<Vec<u8>, ExportError>;

    /// Short description for log messages
    fn describe(&self) -> String;
}

/// Runs an external export utility, appending an output path as its last argument.
///
/// The utility inherits the terminal so interactive login prompts work.
#[derive(Debug, Clone)]
pub struct CommandExportProvider {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandExportProvider {
    /// Create a provider for an argv-style command
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl ExportProvider for CommandExportProvider {
    fn fetch(&self) -> Result<Vec<u8>, ExportError> {
        let (program, args) = self.command.split_first().ok_or(ExportError::EmptyCommand)?;

        let work_dir = tempfile::Builder::new()
            .prefix("tradesync-export")
            .tempdir()?;
        let output = work_dir.path().join(EXPORT_FILE_NAME);

        log::info!("running export: {} {}", self.command.join(" "), output.display());

        let mut child = Command::new(program)
            .args(args)
            .arg(&output)
            .spawn()
            .map_err(|e| ExportError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        match wait_with_timeout(&mut child, self.timeout)? {
            None => return Err(ExportError::Timeout(self.timeout)),
            Some(status) if !status.success() => {
                return Err(ExportError::Failed {
                    status: status.to_string(),
                })
            }
            Some(_) => {}
        }

        read_export_file(&output)
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.command.join(" "))
    }
}

/// Reads an export that was produced beforehand
#[derive(Debug, Clone)]
pub struct FileExportProvider {
    path: PathBuf,
}

impl FileExportProvider {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl ExportProvider for FileExportProvider {
    fn fetch(&self) -> Result<Vec<u8>, ExportError> {
        read_export_file(&self.path)
    }

    fn describe(&self) -> String {
        format!("file '{}'", self.path.display())
    }
}

fn read_export_file(path: &Path) -> Result<Vec<u8>, ExportError> {
    let bytes = fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ExportError::MissingOutput(path.to_path_buf())
        } else {
            ExportError::Read {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    if bytes.is_empty() {
        return Err(ExportError::EmptyOutput(path.to_path_buf()));
    }

    log::debug!("read {} export bytes from '{}'", bytes.len(), path.display());

    Ok(bytes)
}
