//! Invokes a provider as a CLI subprocess (C6 — ProviderAdapter).
//!
//! Environment layering for the child process: `defaults < stored
//! providerConfig < caller env` — each layer overwrites keys from the one
//! before it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::cancellation::CancellationToken;
use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub data_url: String,
    pub media_type: String,
    pub name: Option<String>,
}

impl ImageAttachment {
    /// Spec §3: images are filtered to `image/*` data URLs.
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub cwd: PathBuf,
    pub system_prompt: Option<String>,
    pub message: String,
    pub images: Vec<ImageAttachment>,
    /// `defaults < stored providerConfig < caller env`, already merged by
    /// the caller (InvocationExecutor) before this is built.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// Flipped when the caller stops listening (§5 — an HTTP client
    /// disconnecting drops its `StreamSubscription`, which cancels this).
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct InvokeResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub provider_session_id: Option<String>,
}

fn uv_cwd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)uv_cwd|process\.cwd failed.*EPERM").unwrap())
}

fn session_lock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)session file locked(?:.*?pid[:=]?\s*(\d+))?").unwrap())
}

/// Classifies a non-zero-exit or spawn failure into the taxonomy the
/// executor's retry policy dispatches on (§4.6–§4.7).
pub fn classify_failure(stderr: &str) -> Option<ProviderError> {
    if let Some(caps) = session_lock_re().captures(stderr) {
        let owner_pid = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
        return Some(ProviderError::SessionLockContention {
            owner_pid,
            message: stderr.to_string(),
            retry_after: Duration::from_secs(5),
        });
    }
    if uv_cwd_re().is_match(stderr) {
        return Some(ProviderError::UvCwdFailure(stderr.to_string()));
    }
    None
}

pub struct ProviderAdapter {
    /// Executable name, read from `OPENCLAW_CMD` at config load time.
    pub command: String,
    /// Extra CLI arguments, read from `OPENCLAW_ARGUMENTS`.
    pub extra_args: Vec<String>,
}

impl ProviderAdapter {
    pub fn new(command: impl Into<String>, arguments: &str) -> Self {
        Self {
            command: command.into(),
            extra_args: shell_split(arguments),
        }
    }

    /// Spawns the provider CLI, feeds `message` on stdin, and waits (bounded
    /// by `options.timeout`) for it to exit. Stdout/stderr are captured in
    /// full and also streamed to `on_output` as they arrive, so the caller
    /// can forward lines into the StreamBroker as `stdout`/`stderr` events.
    pub async fn invoke<F>(
        &self,
        options: InvokeOptions,
        mut on_output: F,
    ) -> Result<InvokeResult, ProviderError>
    where
        F: FnMut(bool, &str),
    {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.extra_args)
            .current_dir(&options.cwd)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(prompt) = &options.system_prompt {
            cmd.env("OPENGOAT_SYSTEM_PROMPT", prompt);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::CommandNotFound(self.command.clone())
            } else {
                ProviderError::Other(format!("failed to spawn {}: {e}", self.command))
            }
        })?;

        {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(options.message.as_bytes()).await;
                drop(stdin);
            }
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        enum RunOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
        }

        let run = async {
            loop {
                tokio::select! {
                    _ = options.cancel.cancelled() => {
                        return RunOutcome::Cancelled;
                    }
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                on_output(false, &line);
                                stdout_buf.push_str(&line);
                                stdout_buf.push('\n');
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    line = stderr_lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                on_output(true, &line);
                                stderr_buf.push_str(&line);
                                stderr_buf.push('\n');
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                    status = child.wait() => {
                        return RunOutcome::Exited(status);
                    }
                }
            }
        };

        let wait_result = tokio::time::timeout(options.timeout, run).await;

        let status = match wait_result {
            Ok(RunOutcome::Exited(status)) => {
                status.map_err(|e| ProviderError::Other(e.to_string()))?
            }
            Ok(RunOutcome::Cancelled) => {
                return Err(terminate_cancelled(&mut child).await);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(ProviderError::Other(format!(
                    "provider timed out after {:?}",
                    options.timeout
                )));
            }
        };

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            if let Some(classified) = classify_failure(&stderr_buf) {
                return Err(classified);
            }
        }

        Ok(InvokeResult {
            code,
            stdout: stdout_buf,
            stderr: stderr_buf,
            provider_session_id: None,
        })
    }
}

/// SIGTERM, a 5s grace window, then SIGKILL. Mirrors the teacher's own stop
/// sequence in `session/claude.rs` — SIGCONT first in case the process is
/// paused (a stopped process never observes SIGTERM), then SIGTERM, then a
/// hard kill if it hasn't exited by the end of the grace window. stdin was
/// already closed after the initial write, well before this runs.
async fn terminate_cancelled(child: &mut tokio::process::Child) -> ProviderError {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGCONT);
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .is_err()
    {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    ProviderError::Cancelled
}

/// Minimal whitespace-aware split good enough for `OPENCLAW_ARGUMENTS`
/// (no quoting support — arguments needing quotes belong in config.toml's
/// structured provider profile instead).
fn shell_split(s: &str) -> Vec<String> {
    s.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_session_lock_with_pid() {
        let err = classify_failure("error: session file locked by pid=4821").unwrap();
        match err {
            ProviderError::SessionLockContention { owner_pid, .. } => {
                assert_eq!(owner_pid, Some(4821));
            }
            other => panic!("expected SessionLockContention, got {other:?}"),
        }
    }

    #[test]
    fn classifies_uv_cwd_failure() {
        let err = classify_failure("uv_cwd: process.cwd failed: EPERM").unwrap();
        assert!(matches!(err, ProviderError::UvCwdFailure(_)));
    }

    #[test]
    fn unrecognised_stderr_classifies_to_none() {
        assert!(classify_failure("totally unrelated failure").is_none());
    }

    #[test]
    fn shell_split_handles_plain_whitespace() {
        assert_eq!(
            shell_split("--flag value --other"),
            vec!["--flag", "value", "--other"]
        );
    }

    #[tokio::test]
    async fn command_not_found_classifies_correctly() {
        let adapter = ProviderAdapter::new("opengoat-definitely-not-a-real-binary", "");
        let options = InvokeOptions {
            cwd: std::env::temp_dir(),
            system_prompt: None,
            message: "hi".to_string(),
            images: vec![],
            env: HashMap::new(),
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        };
        let err = adapter.invoke(options, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, ProviderError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn cancelling_mid_invocation_terminates_the_child_promptly() {
        let adapter = ProviderAdapter::new("sleep", "5");
        let cancel = CancellationToken::new();
        let options = InvokeOptions {
            cwd: std::env::temp_dir(),
            system_prompt: None,
            message: String::new(),
            images: vec![],
            env: HashMap::new(),
            timeout: Duration::from_secs(30),
            cancel: cancel.clone(),
        };
        let invocation = tokio::spawn(async move { adapter.invoke(options, |_, _| {}).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = std::time::Instant::now();
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(3), invocation)
            .await
            .expect("invoke must return promptly once cancelled, not wait out the full sleep")
            .unwrap();
        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
