//! Guarded shell command execution
//!
//! Shell commands requested by agent output are screened against a
//! blocked-pattern set, run under a per-invocation timeout, and have their
//! captured output truncated to a configurable cap.

use crate::error::{Result, ToolingError};
use regex::RegexSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Patterns that are never allowed to run, regardless of node configuration.
const BLOCKED_PATTERNS: &[&str] = &[
    r"(?i)rm\s+(-[rf]{1,2}|--recursive)\s+/\S*",
    r"(?i)mkfs\.",
    r"(?i)dd\s+.*if=/dev/(zero|random)",
    r":\(\)\s*\{.*\};\s*:",
    r">\s*/dev/sd[a-z]",
    r"(?i)chmod\s+(-R\s+)?777\s+/\s*$",
];

fn blocked_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(BLOCKED_PATTERNS).expect("blocked patterns compile"))
}

/// Captured output of a guarded command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code, if the process ran to completion.
    pub status_code: Option<i32>,
    /// Captured stdout, truncated to the configured cap.
    pub stdout: String,
    /// Captured stderr, truncated to the configured cap.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    /// Best human-readable summary: stdout, else stderr, else a placeholder.
    pub fn summary(&self) -> &str {
        if !self.stdout.trim().is_empty() {
            self.stdout.trim()
        } else if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            "Success (no output)"
        }
    }
}

/// Screens and executes shell commands.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    /// Wall-clock budget per invocation.
    pub timeout: Duration,
    /// Per-stream capture cap in bytes.
    pub max_output_bytes: usize,
}

impl Default for CommandGuard {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_output_bytes: 8192,
        }
    }
}

impl CommandGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Reject the command if it matches any blocked pattern.
    pub fn screen(&self, command: &str) -> Result<()> {
        if blocked_set().is_match(command) {
            warn!(command, "blocked dangerous command");
            return Err(ToolingError::BlockedCommand(command.to_string()));
        }
        Ok(())
    }

    /// Screen and run `command` through the shell in `cwd`.
    ///
    /// On timeout the child is killed and [`ToolingError::Timeout`] is
    /// returned.
    pub async fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput> {
        self.run_with_timeout(command, cwd, self.timeout).await
    }

    /// Like [`CommandGuard::run`] with an explicit timeout override.
    pub async fn run_with_timeout(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.screen(command)?;
        debug!(command, cwd = %cwd.display(), "running guarded command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    status_code: output.status.code(),
                    stdout: truncate_bytes(&output.stdout, self.max_output_bytes),
                    stderr: truncate_bytes(&output.stderr, self.max_output_bytes),
                })
            }
            Err(_) => {
                warn!(command, ?timeout, "command timed out");
                Err(ToolingError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }
}

fn truncate_bytes(bytes: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        return text.into_owned();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n*(truncated...)*", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn screens_blocked_commands() {
        let guard = CommandGuard::default();
        assert!(guard.screen("rm -rf /").is_err());
        assert!(guard.screen("rm -rf /home").is_err());
        assert!(guard.screen("mkfs.ext4 /dev/sda1").is_err());
        assert!(guard.screen("dd if=/dev/zero of=/dev/sda").is_err());
        assert!(guard.screen(":(){ :|:& };:").is_err());
        assert!(guard.screen("echo hi > /dev/sda").is_err());
        assert!(guard.screen("chmod 777 /").is_err());
    }

    #[test]
    fn allows_ordinary_commands() {
        let guard = CommandGuard::default();
        assert!(guard.screen("ls -la").is_ok());
        assert!(guard.screen("cargo build --release").is_ok());
        assert!(guard.screen("rm -rf target").is_ok());
        assert!(guard.screen("chmod 755 script.sh").is_ok());
    }

    #[tokio::test]
    async fn runs_and_captures_output() {
        let dir = TempDir::new().unwrap();
        let guard = CommandGuard::default();
        let output = guard.run("echo hello", dir.path()).await.unwrap();
        assert!(output.success());
        assert_eq!(output.summary(), "hello");
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let dir = TempDir::new().unwrap();
        let guard = CommandGuard::default();
        let result = guard
            .run_with_timeout("sleep 5", dir.path(), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ToolingError::Timeout { .. })));
    }

    #[tokio::test]
    async fn truncates_long_output() {
        let dir = TempDir::new().unwrap();
        let guard = CommandGuard {
            max_output_bytes: 32,
            ..CommandGuard::default()
        };
        let output = guard.run("head -c 1000 /dev/zero | tr '\\0' 'x'", dir.path())
            .await
            .unwrap();
        assert!(output.stdout.contains("truncated"));
        assert!(output.stdout.len() < 100);
    }
}
