//! Error types for the provider layer.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when working with LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// API authentication failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Request timeout.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Model not found or unavailable.
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Provider service unavailable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Invalid response from provider.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Unknown provider type requested from the registry.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to serialize/deserialize data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General provider error.
    #[error("Provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServiceUnavailable(_) | LlmError::Timeout(_) | LlmError::RateLimit(_)
        )
    }

    /// Check if this error is due to authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, LlmError::Authentication(_))
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::Serialization(err.to_string())
    }
}
