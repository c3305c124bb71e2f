//! Publish by committing to a git repository and pushing

use super::{Publication, PublishError, PublishReceipt, Publisher};
use crate::process::{run_captured, CapturedOutput};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const REJECTED_MARKERS: [&str; 3] = ["rejected", "non-fast-forward", "fetch first"];

const AUTH_OR_NETWORK_MARKERS: [&str; 8] = [
    "authentication failed",
    "permission denied",
    "could not read username",
    "could not read from remote repository",
    "could not resolve host",
    "unable to access",
    "connection timed out",
    "connection refused",
];

/// Stages, commits and pushes the published files
#[derive(Debug, Clone)]
pub struct GitPublisher {
    repo: PathBuf,
    remote: String,
    branch: String,
    timeout: Duration,
}

impl GitPublisher {
    pub fn new(
        repo: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo: repo.into(),
            remote: remote.into(),
            branch: branch.into(),
            timeout,
        }
    }

    /// Paths of the publication relative to the repository root
    fn repo_relative(&self, publication: &Publication) -> Result<Vec<PathBuf>, PublishError> {
        let repo = fs::canonicalize(&self.repo)?;
        publication
            .paths()
            .into_iter()
            .map(|path| {
                let absolute = fs::canonicalize(path)?;
                absolute
                    .strip_prefix(&repo)
                    .map(Path::to_path_buf)
                    .map_err(|_| PublishError::OutsideRepository(path.to_path_buf()))
            })
            .collect()
    }

    /// Commits on HEAD that the remote branch does not have. Without a
    /// remote-tracking branch every local commit counts.
    fn unpushed_commits(&self) -> Result<usize, PublishError> {
        let range = format!("{}/{}..HEAD", self.remote, self.branch);
        let output = self.git(&["rev-list".to_string(), "--count".to_string(), range])?;
        if output.status.success() {
            return Ok(output.stdout.trim().parse().unwrap_or(0));
        }

        let output = self.git(&["rev-list".to_string(), "--count".to_string(), "HEAD".to_string()])?;
        if !output.status.success() {
            return Ok(0);
        }
        Ok(output.stdout.trim().parse().unwrap_or(0))
    }

    fn git(&self, args: &[String]) -> Result<CapturedOutput, PublishError> {
        let command = format!("git {}", args.join(" "));
        log::debug!("running `{}` in {}", command, self.repo.display());

        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo).args(args);

        run_captured(&mut cmd, self.timeout)?.ok_or(PublishError::Timeout {
            operation: command,
            after: self.timeout,
        })
    }
}

impl Publisher for GitPublisher {
    fn name(&self) -> &'static str {
        "git"
    }

    fn publish(&self, publication: &Publication) -> Result<PublishReceipt, PublishError> {
        let paths = self.repo_relative(publication)?;

        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let output = self.git(&add)?;
        if !output.status.success() {
            return Err(PublishError::CommandFailed {
                command: "git add".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        let commit = vec![
            "commit".to_string(),
            "-m".to_string(),
            publication.message.clone(),
        ];
        let output = self.git(&commit)?;
        if output.status.success() {
            log::info!("commit created: {}", publication.message);
        } else {
            match classify_commit_failure(&output.stdout, &output.stderr) {
                // An earlier publish may have committed and then failed to push
                PublishError::NothingToCommit if self.unpushed_commits()? > 0 => {
                    log::info!("nothing new to commit, pushing earlier commits");
                }
                err => return Err(err),
            }
        }

        let push = vec!["push".to_string(), self.remote.clone(), self.branch.clone()];
        let output = self.git(&push)?;
        if !output.status.success() {
            return Err(classify_push_failure(&output.stderr));
        }
        log::info!("pushed to {}/{}", self.remote, self.branch);

        Ok(PublishReceipt {
            sink: self.name(),
            detail: format!("pushed to {}/{}", self.remote, self.branch),
        })
    }
}

/// Map a failed `git commit` to a publish error
pub fn classify_commit_failure(stdout: &str, stderr: &str) -> PublishError {
    let combined = format!("{}\n{}", stdout, stderr).to_lowercase();
    if combined.contains("nothing to commit") || combined.contains("no changes added to commit") {
        PublishError::NothingToCommit
    } else {
        PublishError::CommandFailed {
            command: "git commit".to_string(),
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Map a failed `git push` to a publish error
pub fn classify_push_failure(stderr: &str) -> PublishError {
    let lower = stderr.to_lowercase();
    let summary = stderr.trim().to_string();

    if REJECTED_MARKERS.iter().any(|m| lower.contains(m)) {
        PublishError::PushRejected(summary)
    } else if AUTH_OR_NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        PublishError::AuthOrNetwork(summary)
    } else {
        PublishError::CommandFailed {
            command: "git push".to_string(),
            stderr: summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_nothing_to_commit() {
        let err = classify_commit_failure(
            "On branch main\nnothing to commit, working tree clean\n",
            "",
        );
        assert!(matches!(err, PublishError::NothingToCommit));

        let other = classify_commit_failure("", "fatal: unable to auto-detect email address");
        assert!(matches!(other, PublishError::CommandFailed { .. }));
    }

    #[test]
    fn test_classify_push_rejected() {
        let stderr = "To github.com:me/data.git\n ! [rejected]        main -> main (fetch first)\n\
                      error: failed to push some refs to 'github.com:me/data.git'\n";
        assert!(matches!(classify_push_failure(stderr), PublishError::PushRejected(_)));
    }

    #[test]
    fn test_classify_push_auth_and_network() {
        let auth = "remote: Invalid username or password.\nfatal: Authentication failed for 'https://github.com/me/data.git/'";
        assert!(matches!(classify_push_failure(auth), PublishError::AuthOrNetwork(_)));

        let ssh = "git@github.com: Permission denied (publickey).\nfatal: Could not read from remote repository.";
        assert!(matches!(classify_push_failure(ssh), PublishError::AuthOrNetwork(_)));

        let dns = "fatal: unable to access 'https://github.com/me/data.git/': Could not resolve host: github.com";
        assert!(matches!(classify_push_failure(dns), PublishError::AuthOrNetwork(_)));
    }

    #[test]
    fn test_classify_push_other() {
        let err = classify_push_failure("fatal: 'origin' does not appear to be a git repository");
        assert!(matches!(err, PublishError::CommandFailed { .. }));
    }

    #[test]
    fn test_path_outside_repository_is_rejected() {
        let repo = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let ledger = elsewhere.path().join("ledger.csv");
        fs::write(&ledger, "Data\n").unwrap();

        let publisher = GitPublisher::new(repo.path(), "origin", "main", Duration::from_secs(5));
        let publication = Publication {
            ledger: ledger.clone(),
            backup: None,
            message: "Update transactions".to_string(),
        };

        let err = publisher.publish(&publication).unwrap_err();
        assert!(matches!(err, PublishError::OutsideRepository(p) if p == ledger));
    }

    #[cfg(unix)]
    mod end_to_end {
        use crate::publish::git::GitPublisher;
        use crate::publish::{Publication, PublishError, Publisher};
        use std::fs;
        use std::path::{Path, PathBuf};
        use std::process::Command;
        use std::time::Duration;

        fn git(dir: &Path, args: &[&str]) -> String {
            let output = Command::new("git")
                .current_dir(dir)
                .args(args)
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
            String::from_utf8(output.stdout).unwrap()
        }

        fn git_available() -> bool {
            Command::new("git").arg("--version").output().is_ok()
        }

        /// A bare remote and a clone on branch `main` with a local identity
        fn remote_and_clone(root: &Path) -> (PathBuf, PathBuf) {
            let remote = root.join("remote.git");
            let work = root.join("work");
            git(root, &["init", "--bare", "--quiet", "remote.git"]);
            git(root, &["clone", "--quiet", "remote.git", "work"]);
            git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
            git(&work, &["config", "user.name", "Ledger Bot"]);
            git(&work, &["config", "user.email", "ledger@example.com"]);
            git(&work, &["config", "commit.gpgsign", "false"]);
            (remote, work)
        }

        fn publication(work: &Path, message: &str) -> Publication {
            Publication {
                ledger: work.join("ledger.csv"),
                backup: Some(work.join("backups").join("ledger_20240309_100000.csv")),
                message: message.to_string(),
            }
        }

        #[test]
        fn test_publish_commits_and_pushes() {
            if !git_available() {
                return;
            }
            let root = tempfile::tempdir().unwrap();
            let (remote, work) = remote_and_clone(root.path());
            fs::write(work.join("ledger.csv"), "Data;Tipo\r\n2024-01-01;Buy\r\n").unwrap();
            fs::create_dir(work.join("backups")).unwrap();
            fs::write(work.join("backups/ledger_20240309_100000.csv"), "Data;Tipo\r\n").unwrap();
            fs::write(work.join("unrelated.txt"), "not published").unwrap();

            let publisher = GitPublisher::new(&work, "origin", "main", Duration::from_secs(30));
            let message = "Update transactions 2024-03-09 10:00:00 (+1)";
            let receipt = publisher.publish(&publication(&work, message)).unwrap();
            assert_eq!(receipt.detail, "pushed to origin/main");

            let subject = git(&remote, &["log", "-1", "--format=%s", "main"]);
            assert_eq!(subject.trim(), message);
            let files = git(&remote, &["ls-tree", "-r", "--name-only", "main"]);
            let files: Vec<&str> = files.lines().collect();
            assert_eq!(files, ["backups/ledger_20240309_100000.csv", "ledger.csv"]);

            // Unchanged files: nothing to commit and nothing to push
            let again = publisher.publish(&publication(&work, "Update transactions again"));
            assert!(matches!(again, Err(PublishError::NothingToCommit)));
            let count = git(&remote, &["rev-list", "--count", "main"]);
            assert_eq!(count.trim(), "1");
        }

        #[test]
        fn test_unpushed_commit_is_pushed_on_republish() {
            if !git_available() {
                return;
            }
            let root = tempfile::tempdir().unwrap();
            let (remote, work) = remote_and_clone(root.path());
            fs::write(work.join("ledger.csv"), "Data;Tipo\r\n").unwrap();
            fs::create_dir(work.join("backups")).unwrap();
            fs::write(work.join("backups/ledger_20240309_100000.csv"), "Data;Tipo\r\n").unwrap();

            // Committed by an earlier publish whose push failed
            let message = "Update transactions 2024-03-09 10:00:00 (+1)";
            git(&work, &["add", "--", "ledger.csv", "backups"]);
            git(&work, &["commit", "--quiet", "-m", message]);

            let publisher = GitPublisher::new(&work, "origin", "main", Duration::from_secs(30));
            publisher.publish(&publication(&work, message)).unwrap();

            let subject = git(&remote, &["log", "-1", "--format=%s", "main"]);
            assert_eq!(subject.trim(), message);
        }
    }
}
