//! The provider contract.
//!
//! Every backend adapter implements [`Provider`]. The engine never talks to
//! an adapter directly; calls are routed through the
//! [`FailoverManager`](crate::FailoverManager), which relies on the
//! `"Error: …"` string convention to classify failures without needing a
//! shared exception taxonomy across backends.

use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked with each reasoning fragment a backend emits while
/// generating (native reasoning fields or streamed `<think>` content).
pub type ThoughtSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A single generation request.
#[derive(Clone, Default)]
pub struct GenerateRequest {
    /// System prompt (persona, memory, tool catalogue, blackboard state).
    pub system_prompt: String,
    /// The user-facing message for this turn.
    pub user_message: String,
    /// Optional pre-built context from predecessor nodes.
    pub context: Option<String>,
    /// Overrides the provider's configured model for this call.
    pub model_override: Option<String>,
    /// Receives reasoning fragments as they are produced.
    pub on_thought: Option<ThoughtSink>,
}

impl GenerateRequest {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_thought_sink(mut self, sink: ThoughtSink) -> Self {
        self.on_thought = Some(sink);
        self
    }
}

impl std::fmt::Debug for GenerateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateRequest")
            .field("system_prompt_len", &self.system_prompt.len())
            .field("user_message_len", &self.user_message.len())
            .field("context", &self.context.as_ref().map(|c| c.len()))
            .field("model_override", &self.model_override)
            .field("on_thought", &self.on_thought.is_some())
            .finish()
    }
}

/// Contract every LLM backend adapter implements.
///
/// `generate` returns the completion text on success. Failures are returned
/// as strings starting with `"Error: "`; adapters that raise internally must
/// translate at this edge.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Establish the backend connection. Bounded probe, `true` on success.
    async fn initialize(&self) -> bool;

    /// Lightweight availability check.
    async fn health_check(&self) -> bool;

    /// Generate a completion for the request.
    async fn generate(&self, request: GenerateRequest) -> String;

    /// Release any held resources. Default is a no-op.
    async fn close(&self) {}

    /// The default model this instance was configured with.
    fn model(&self) -> &str;
}

/// Whether a generation result follows the error convention.
pub fn is_error_result(result: &str) -> bool {
    result.starts_with("Error:")
}
