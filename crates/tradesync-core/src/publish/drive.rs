//! Publish by uploading to a Google Drive folder
//!
//! The ledger is written into one stable Drive file so its id (and any
//! share links) survive across runs. Once resolved, the id is kept in a
//! state file next to the ledger. Backups go to a sub-folder as new files.
//!
//! Reads and media uploads are retried on quota, network and timeout
//! failures with doubling backoff; file creation is not.

use super::{Publication, PublishError, PublishReceipt, Publisher};
use crate::ledger::write_atomic;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const CSV_MIME: &str = "text/csv";

/// Upper bound on a single wait between attempts
const MAX_RETRY_WAIT: Duration = Duration::from_secs(60);

const QUOTA_REASONS: [&str; 4] = [
    "ratelimitexceeded",
    "userratelimitexceeded",
    "quotaexceeded",
    "storagequotaexceeded",
];

/// Connection and placement settings for the Drive sink
#[derive(Debug, Clone)]
pub struct DriveOptions {
    pub api_base: String,
    pub upload_base: String,
    /// OAuth bearer token
    pub token: String,
    /// Folder holding the ledger
    pub folder_id: String,
    /// Known id of the ledger file; looked up by name when absent
    pub file_id: Option<String>,
    /// Name of the ledger file inside the folder
    pub target_name: String,
    /// Sub-folder for backups
    pub backup_folder_name: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Where the resolved ledger file id is remembered between runs
    pub state_path: Option<PathBuf>,
}

impl DriveOptions {
    pub fn new(
        token: impl Into<String>,
        folder_id: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            token: token.into(),
            folder_id: folder_id.into(),
            file_id: None,
            target_name: target_name.into(),
            backup_folder_name: "backups".to_string(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            state_path: None,
        }
    }
}

/// How often and how patiently transient failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Wait before the first retry; doubles after each one
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// A failed attempt and the wait the server asked for, if any
#[derive(Debug)]
struct FailedAttempt {
    error: PublishError,
    retry_after: Option<Duration>,
}

impl From<PublishError> for FailedAttempt {
    fn from(error: PublishError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

fn is_transient(error: &PublishError) -> bool {
    matches!(
        error,
        PublishError::QuotaOrNetwork(_) | PublishError::Timeout { .. }
    )
}

/// Run `attempt` until it succeeds, fails permanently or the policy runs out
fn with_retry<T, F>(policy: &RetryPolicy, operation: &str, mut attempt: F) -> Result<T, PublishError>
where
    F: FnMut() -> Result<T, FailedAttempt>,
{
    let mut backoff = policy.initial_backoff;
    let mut tries = 1;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(failed) if tries < policy.attempts && is_transient(&failed.error) => {
                let wait = failed.retry_after.unwrap_or(backoff).min(MAX_RETRY_WAIT);
                log::warn!(
                    "drive: {} failed ({}), retry {}/{} in {:?}",
                    operation,
                    failed.error,
                    tries,
                    policy.attempts - 1,
                    wait
                );
                thread::sleep(wait);
                backoff = backoff.saturating_mul(2);
                tries += 1;
            }
            Err(failed) => return Err(failed.error),
        }
    }
}

/// `Retry-After` in seconds; HTTP dates are ignored
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Ledger file id remembered from an earlier publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DriveState {
    folder_id: String,
    target_name: String,
    file_id: String,
}

/// Path of the Drive state file for `ledger_path`
pub fn state_path_for(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".drive.json");
    ledger_path.with_file_name(name)
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Uploads the ledger (and backup) through the Drive v3 REST API
pub struct DrivePublisher {
    options: DriveOptions,
    http: Client,
}

impl DrivePublisher {
    pub fn new(options: DriveOptions) -> Result<Self, PublishError> {
        let http = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| PublishError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { options, http })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.options.api_base.trim_end_matches('/'), path)
    }

    fn upload(&self, path: &str) -> String {
        format!("{}/{}", self.options.upload_base.trim_end_matches('/'), path)
    }

    /// One attempt at `request`
    fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, FailedAttempt> {
        log::debug!("drive: {}", operation);

        let response = request
            .bearer_auth(&self.options.token)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout {
                        operation: operation.to_string(),
                        after: self.options.timeout,
                    }
                } else {
                    PublishError::QuotaOrNetwork(format!("{}: {}", operation, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().unwrap_or_default();
        Err(FailedAttempt {
            error: classify_status(status.as_u16(), &body),
            retry_after,
        })
    }

    /// Send a request that is safe to repeat; `build` makes a fresh one per attempt
    fn send_idempotent<F>(&self, operation: &str, build: F) -> Result<Response, PublishError>
    where
        F: Fn() -> RequestBuilder,
    {
        with_retry(&self.options.retry, operation, || self.send(operation, build()))
    }

    fn read_json<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T, PublishError> {
        response
            .json::<T>()
            .map_err(|e| PublishError::Protocol(format!("{}: {}", operation, e)))
    }

    fn get_file(&self, id: &str) -> Result<DriveFile, PublishError> {
        let operation = format!("get file {}", id);
        let response = self.send_idempotent(&operation, || {
            self.http
                .get(self.api(&format!("files/{}", id)))
                .query(&[("fields", "id"), ("supportsAllDrives", "true")])
        })?;
        Self::read_json(&operation, response)
    }

    fn find_by_name(
        &self,
        name: &str,
        parent: &str,
        mime_type: Option<&str>,
    ) -> Result<Option<DriveFile>, PublishError> {
        let mut q = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(parent)
        );
        if let Some(mime) = mime_type {
            q.push_str(&format!(" and mimeType = '{}'", mime));
        }

        let operation = format!("find '{}'", name);
        let response = self.send_idempotent(&operation, || {
            self.http.get(self.api("files")).query(&[
                ("q", q.as_str()),
                ("fields", "files(id)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
        })?;
        let list: FileList = Self::read_json(&operation, response)?;

        if list.files.len() > 1 {
            log::warn!("{} files named '{}' in folder, using the first", list.files.len(), name);
        }
        Ok(list.files.into_iter().next())
    }

    fn create_file(
        &self,
        name: &str,
        parent: &str,
        mime_type: &str,
    ) -> Result<DriveFile, PublishError> {
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent],
            "mimeType": mime_type,
        });
        let request = self
            .http
            .post(self.api("files"))
            .query(&[("fields", "id"), ("supportsAllDrives", "true")])
            .json(&metadata);
        let operation = format!("create '{}'", name);
        let response = self.send(&operation, request).map_err(|failed| failed.error)?;
        let created: DriveFile = Self::read_json(&operation, response)?;
        log::info!("drive: created '{}' ({})", name, created.id);
        Ok(created)
    }

    /// Replace the content of file `id`. A media PATCH is idempotent.
    fn upload_content(&self, id: &str, contents: Vec<u8>) -> Result<(), PublishError> {
        self.send_idempotent(&format!("upload {}", id), || {
            self.http
                .patch(self.upload(&format!("files/{}", id)))
                .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
                .header(reqwest::header::CONTENT_TYPE, CSV_MIME)
                .body(contents.clone())
        })?;
        Ok(())
    }

    /// Id of the ledger file: the configured id, else the remembered one,
    /// else by name, else newly created
    fn resolve_target(&self) -> Result<String, PublishError> {
        if let Some(id) = &self.options.file_id {
            return Ok(self.get_file(id)?.id);
        }

        if let Some(id) = self.stored_target() {
            match self.get_file(&id) {
                Ok(file) => return Ok(file.id),
                Err(PublishError::NotFound(_)) => {
                    log::warn!("drive: remembered file {} is gone, looking up by name", id);
                }
                Err(e) => return Err(e),
            }
        }

        let id = match self.find_by_name(&self.options.target_name, &self.options.folder_id, None)? {
            Some(file) => file.id,
            None => {
                self.create_file(&self.options.target_name, &self.options.folder_id, CSV_MIME)?
                    .id
            }
        };
        self.store_target(&id);
        Ok(id)
    }

    /// Remembered id, if it was stored for the same folder and name
    fn stored_target(&self) -> Option<String> {
        let path = self.options.state_path.as_deref()?;
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("drive: cannot read {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice::<DriveState>(&contents) {
            Ok(state)
                if state.folder_id == self.options.folder_id
                    && state.target_name == self.options.target_name =>
            {
                Some(state.file_id)
            }
            Ok(_) => None,
            Err(e) => {
                log::warn!("drive: ignoring unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Best effort; a lost state file only costs a lookup by name
    fn store_target(&self, file_id: &str) {
        let Some(path) = self.options.state_path.as_deref() else {
            return;
        };
        let state = DriveState {
            folder_id: self.options.folder_id.clone(),
            target_name: self.options.target_name.clone(),
            file_id: file_id.to_string(),
        };
        let stored = serde_json::to_vec_pretty(&state)
            .map_err(|e| e.to_string())
            .and_then(|json| write_atomic(path, &json).map_err(|e| e.to_string()));
        match stored {
            Ok(()) => log::debug!("drive: remembered file {} in {}", file_id, path.display()),
            Err(e) => log::warn!("drive: cannot remember file id in {}: {}", path.display(), e),
        }
    }

    fn ensure_folder(&self, name: &str) -> Result<String, PublishError> {
        match self.find_by_name(name, &self.options.folder_id, Some(FOLDER_MIME))? {
            Some(folder) => Ok(folder.id),
            None => Ok(self.create_file(name, &self.options.folder_id, FOLDER_MIME)?.id),
        }
    }
}

impl Publisher for DrivePublisher {
    fn name(&self) -> &'static str {
        "drive"
    }

    fn publish(&self, publication: &Publication) -> Result<PublishReceipt, PublishError> {
        let contents = fs::read(&publication.ledger)?;
        let target = self.resolve_target()?;
        self.upload_content(&target, contents)?;
        log::info!(
            "drive: uploaded '{}' ({}): {}",
            self.options.target_name,
            target,
            publication.message
        );

        if let Some(backup) = &publication.backup {
            let name = backup
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| PublishError::Protocol(format!("backup '{}' has no file name", backup.display())))?;
            let folder = self.ensure_folder(&self.options.backup_folder_name)?;
            let created = self.create_file(&name, &folder, CSV_MIME)?;
            self.upload_content(&created.id, fs::read(backup)?)?;
        }

        Ok(PublishReceipt {
            sink: self.name(),
            detail: format!("uploaded {} as file {}", self.options.target_name, target),
        })
    }
}

/// Map an unsuccessful HTTP status to a publish error
pub fn classify_status(status: u16, body: &str) -> PublishError {
    let summary = format!("HTTP {}: {}", status, body.trim());
    let lower = body.to_lowercase();

    match status {
        401 => PublishError::AuthExpired(summary),
        403 if QUOTA_REASONS.iter().any(|r| lower.contains(r)) => {
            PublishError::QuotaOrNetwork(summary)
        }
        403 => PublishError::AuthExpired(summary),
        404 => PublishError::NotFound(summary),
        429 | 500..=599 => PublishError::QuotaOrNetwork(summary),
        _ => PublishError::Protocol(summary),
    }
}

/// Escape a literal for use inside a Drive query string
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
