//! Running external commands with a deadline

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Output of a command whose stdout and stderr were captured
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Wait for `child` to exit, killing it once `timeout` has elapsed.
///
/// Returns `Ok(None)` if the child was killed.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            log::warn!("process {} exceeded {:?}, killing it", child.id(), timeout);
            // The child may exit between try_wait and kill
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut pipe) = pipe {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            out = String::from_utf8_lossy(&bytes).into_owned();
        }
        out
    })
}

/// Run `command` capturing stdout and stderr.
///
/// Returns `Ok(None)` on timeout. The pipes are drained on separate threads so
/// a chatty child cannot block on a full pipe.
pub fn run_captured(command: &mut Command, timeout: Duration) -> io::Result<Option<CapturedOutput>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let Some(status) = wait_with_timeout(&mut child, timeout)? else {
        // Grandchildren may still hold the pipes; leave the drain threads detached
        return Ok(None);
    };

    Ok(Some(CapturedOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_captured_collects_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = run_captured(&mut cmd, Duration::from_secs(10)).unwrap().unwrap();

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_timeout_kills_child() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 5"]);

        let started = Instant::now();
        let output = run_captured(&mut cmd, Duration::from_millis(200)).unwrap();

        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
