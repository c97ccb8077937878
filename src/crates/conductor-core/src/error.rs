//! Error types for the workflow engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised during workflow validation and execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow structure is invalid (dangling edge, cyclic non-feedback
    /// subgraph, unknown reference).
    #[error("validation error: {0}")]
    Validation(String),

    /// A node step failed.
    #[error("node '{node}' failed: {error}")]
    NodeExecution { node: String, error: String },

    /// Snapshot index out of range or history unavailable.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Provider layer failure surfaced to the engine.
    #[error("provider error: {0}")]
    Provider(#[from] conductor_llm::LlmError),

    /// Safety layer rejection.
    #[error("safety error: {0}")]
    Safety(#[from] conductor_tooling::ToolingError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Convenience constructor for node failures.
    pub fn node(node: impl Into<String>, error: impl Into<String>) -> Self {
        EngineError::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }
}
