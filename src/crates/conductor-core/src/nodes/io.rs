//! Input, output, and generative-UI executors.

use crate::error::{EngineError, Result};
use crate::registry::{ExecContext, ExecOutcome, NodeExecutor};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::info;

/// INPUT returns the run's initial input unchanged.
pub struct InputExecutor;

#[async_trait]
impl NodeExecutor for InputExecutor {
    async fn execute(
        &self,
        _inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        Ok(ExecOutcome::text(ctx.initial_input))
    }
}

/// OUTPUT writes its context to `save_path` (or an auto-timestamped file in
/// the session export folder) and passes the content through.
pub struct OutputExecutor;

impl OutputExecutor {
    fn resolve_target(ctx: &ExecContext<'_>) -> Option<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        match &ctx.node.save_path {
            Some(raw) => {
                let base = if std::path::Path::new(raw).is_absolute() {
                    PathBuf::from(raw)
                } else {
                    ctx.services.base_dir.join(raw)
                };
                if raw.ends_with('/') || raw.ends_with('\\') || base.is_dir() {
                    Some(base.join(format!("output_{stamp}.md")))
                } else {
                    Some(base)
                }
            }
            None => ctx
                .session_dir
                .map(|dir| dir.join(format!("output_{stamp}.md"))),
        }
    }
}

#[async_trait]
impl NodeExecutor for OutputExecutor {
    async fn execute(
        &self,
        _inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let mut output = if !ctx.context_str.is_empty() {
            ctx.context_str.to_string()
        } else {
            ctx.initial_input.to_string()
        };
        if output.is_empty() {
            output = "No Content".to_string();
        }

        match Self::resolve_target(&ctx) {
            Some(target) => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        EngineError::node(&ctx.node.name, format!("failed to save: {e}"))
                    })?;
                }
                tokio::fs::write(&target, &output).await.map_err(|e| {
                    EngineError::node(&ctx.node.name, format!("failed to save: {e}"))
                })?;
                info!(node = %ctx.node.name, path = %target.display(), "output saved");
            }
            None => info!(node = %ctx.node.name, "no save target configured for output node"),
        }

        Ok(ExecOutcome::text(output))
    }
}

/// A2UI broadcasts a UI schema taken from the node's static inputs.
pub struct A2uiExecutor;

#[async_trait]
impl NodeExecutor for A2uiExecutor {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let schema = inputs
            .get("schema")
            .or_else(|| ctx.node.provider_config.get("schema"))
            .cloned()
            .unwrap_or_else(|| Value::Object(inputs.clone()));

        Ok(ExecOutcome {
            output: "UI schema emitted".to_string(),
            data: Some(schema.clone()),
            ui_event: Some(schema),
        })
    }
}
