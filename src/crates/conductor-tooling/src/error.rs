//! Error types for the safety layer.

use std::time::Duration;
use thiserror::Error;

/// Result type for tooling operations.
pub type Result<T> = std::result::Result<T, ToolingError>;

/// Errors raised by sandbox, command, and URL validation.
#[derive(Debug, Error)]
pub enum ToolingError {
    /// A path escapes the sandbox base directory.
    #[error("path violation: {0}")]
    PathViolation(String),

    /// A shell command matched the blocked-pattern set.
    #[error("blocked command: {0}")]
    BlockedCommand(String),

    /// A URL failed SSRF validation.
    #[error("blocked url: {0}")]
    BlockedUrl(String),

    /// A subprocess exceeded its timeout.
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
