//! Simulation provider.
//!
//! A deterministic backend for tests and offline workflow development. It
//! supports scripted responses (consumed in order), a configurable delay,
//! and role-flavored defaults keyed off the system prompt. Responses that
//! contain `<think>` blocks have the reasoning streamed through the thought
//! sink and stripped from the returned text.

use crate::provider::{GenerateRequest, Provider};
use crate::thinking::strip_thinking;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Mock provider for running workflows without external backends.
pub struct MockProvider {
    model: String,
    delay: Duration,
    scripted: Mutex<VecDeque<String>>,
    emit_thoughts: bool,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            delay: Duration::ZERO,
            scripted: Mutex::new(VecDeque::new()),
            emit_thoughts: false,
        }
    }
}

impl MockProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Build from a registry config map. Recognized keys: `model` (string),
    /// `delay` (seconds, float), `responses` (array of strings),
    /// `emit_thoughts` (bool).
    pub fn from_config(config: &Map<String, Value>) -> Self {
        let model = config
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let delay = config
            .get("delay")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO);
        let scripted = config
            .get("responses")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let emit_thoughts = config
            .get("emit_thoughts")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            model,
            delay,
            scripted: Mutex::new(scripted),
            emit_thoughts,
        }
    }

    /// Queue scripted responses consumed by subsequent `generate` calls.
    pub fn script(&self, responses: impl IntoIterator<Item = impl Into<String>>) {
        let mut scripted = self.scripted.lock().expect("scripted lock");
        scripted.extend(responses.into_iter().map(Into::into));
    }

    fn canned_response(&self, request: &GenerateRequest) -> String {
        let prompt = request.system_prompt.to_lowercase();
        if prompt.contains("architect") || prompt.contains("proposer") {
            format!(
                "**Proposal for: {}**\n\n1. Core module\n2. API layer\n3. Data store",
                request.user_message.chars().take(60).collect::<String>()
            )
        } else if prompt.contains("critic") || prompt.contains("adversary") {
            "## Critical Analysis\n\nThe proposal is sound but lacks a timeline.".to_string()
        } else if prompt.contains("auditor") || prompt.contains("consensus") {
            "approved: output meets agreement parameters".to_string()
        } else {
            format!(
                "Mock response to: {}",
                request.user_message.chars().take(100).collect::<String>()
            )
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn initialize(&self) -> bool {
        true
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn generate(&self, request: GenerateRequest) -> String {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.emit_thoughts {
            if let Some(sink) = &request.on_thought {
                sink("Analyzing the request parameters...");
                sink("Drafting response content...");
            }
        }

        let scripted = self.scripted.lock().expect("scripted lock").pop_front();
        let raw = scripted.unwrap_or_else(|| self.canned_response(&request));

        // Scripted responses may embed reasoning; stream it and return the
        // cleaned text, like a real thinking backend would.
        if raw.contains("<think>") {
            let (clean, thoughts) = strip_thinking(&raw);
            if let Some(sink) = &request.on_thought {
                for thought in &thoughts {
                    sink(thought);
                }
            }
            clean
        } else {
            raw
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}
