//! Shell and script executors.
//!
//! Both run subprocesses through the guarded command layer: blocked-pattern
//! screening, per-invocation timeouts, capped output, and a working
//! directory pinned to the engine's sandbox base.

use crate::error::{EngineError, Result};
use crate::registry::{ExecContext, ExecOutcome, NodeExecutor};
use async_trait::async_trait;
use conductor_tooling::{CommandGuard, Sandbox};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Interpreters a script node may request.
const ALLOWED_INTERPRETERS: &[&str] = &["python3", "python", "node", "sh", "bash"];

fn configured_timeout(config: &Map<String, Value>) -> Duration {
    config
        .get("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(120))
}

/// Runs a shell command taken from the node's inputs or config.
pub struct ShellExecutor;

#[async_trait]
impl NodeExecutor for ShellExecutor {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let command = inputs
            .get("command")
            .or_else(|| ctx.node.provider_config.get("command"))
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::node(&ctx.node.name, "no command configured"))?;

        let guard = CommandGuard::new(configured_timeout(&ctx.node.provider_config));
        let output = guard
            .run(command, &ctx.services.base_dir)
            .await
            .map_err(|e| EngineError::node(&ctx.node.name, e.to_string()))?;

        if !output.success() {
            return Err(EngineError::node(
                &ctx.node.name,
                format!(
                    "command exited with {:?}: {}",
                    output.status_code,
                    output.summary()
                ),
            ));
        }

        Ok(ExecOutcome {
            output: output.summary().to_string(),
            data: Some(json!({
                "status_code": output.status_code,
                "stderr": output.stderr,
            })),
            ui_event: None,
        })
    }
}

/// Runs the node's `script_code` through an allow-listed interpreter.
///
/// The script is materialized inside the sandbox; the node's context is
/// written next to it and passed as the script's first argument.
pub struct ScriptExecutor;

#[async_trait]
impl NodeExecutor for ScriptExecutor {
    async fn execute(
        &self,
        _inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        if ctx.node.script_code.trim().is_empty() {
            return Err(EngineError::node(&ctx.node.name, "no script_code configured"));
        }

        let interpreter = ctx
            .node
            .provider_config
            .get("interpreter")
            .and_then(Value::as_str)
            .unwrap_or("python3");
        if !ALLOWED_INTERPRETERS.contains(&interpreter) {
            return Err(EngineError::node(
                &ctx.node.name,
                format!("interpreter '{interpreter}' not allowed"),
            ));
        }

        let sandbox = Sandbox::new(&ctx.services.base_dir)
            .map_err(|e| EngineError::node(&ctx.node.name, e.to_string()))?;
        let run_id = crate::workflow::short_id();
        let script_path = sandbox
            .resolve(format!(".scripts/{run_id}.script"))
            .map_err(|e| EngineError::node(&ctx.node.name, e.to_string()))?;
        let input_path = sandbox
            .resolve(format!(".scripts/{run_id}.input"))
            .map_err(|e| EngineError::node(&ctx.node.name, e.to_string()))?;

        if let Some(parent) = script_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&script_path, &ctx.node.script_code).await?;
        tokio::fs::write(&input_path, ctx.context_str).await?;

        let guard = CommandGuard::new(configured_timeout(&ctx.node.provider_config));
        let command = format!(
            "{interpreter} {} {}",
            script_path.display(),
            input_path.display()
        );
        let result = guard.run(&command, &ctx.services.base_dir).await;

        let _ = tokio::fs::remove_file(&script_path).await;
        let _ = tokio::fs::remove_file(&input_path).await;

        let output = result.map_err(|e| EngineError::node(&ctx.node.name, e.to_string()))?;
        if !output.success() {
            return Err(EngineError::node(
                &ctx.node.name,
                format!("script failed: {}", output.summary()),
            ));
        }

        Ok(ExecOutcome::text(output.summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EngineServices;
    use crate::workflow::{NodeKind, WorkflowNode};
    use tempfile::TempDir;

    fn services(base: &std::path::Path) -> EngineServices {
        let bus = crate::events::EventBus::default();
        EngineServices {
            bus: bus.clone(),
            blackboard: crate::blackboard::Blackboard::new(bus),
            traffic: std::sync::Arc::new(crate::traffic::TrafficController::new(1)),
            failover: std::sync::Arc::new(conductor_llm::FailoverManager::default()),
            providers: std::sync::Arc::new(conductor_llm::ProviderRegistry::new()),
            memory: tokio::sync::Mutex::new(crate::memory::MemoryStore::in_memory()),
            conversation: tokio::sync::Mutex::new(crate::memory::SummaryBufferMemory::new()),
            base_dir: base.to_path_buf(),
        }
    }

    fn ctx_for<'a>(
        services: &'a EngineServices,
        node: &'a WorkflowNode,
        context: &'a str,
    ) -> ExecContext<'a> {
        ExecContext {
            services,
            node,
            context_str: context,
            initial_input: "",
            persona_override: None,
            session_dir: None,
        }
    }

    #[tokio::test]
    async fn shell_runs_configured_command() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());
        let mut node = WorkflowNode::new("Shell", NodeKind::Shell);
        node.provider_config =
            serde_json::from_value(serde_json::json!({"command": "echo shell-works"})).unwrap();

        let outcome = ShellExecutor
            .execute(&Map::new(), ctx_for(&services, &node, ""))
            .await
            .unwrap();
        assert_eq!(outcome.output, "shell-works");
    }

    #[tokio::test]
    async fn shell_blocks_dangerous_commands() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());
        let mut node = WorkflowNode::new("Shell", NodeKind::Shell);
        node.provider_config =
            serde_json::from_value(serde_json::json!({"command": "rm -rf /"})).unwrap();

        let err = ShellExecutor
            .execute(&Map::new(), ctx_for(&services, &node, ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn script_receives_context_via_input_file() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());
        let mut node = WorkflowNode::new("Script", NodeKind::Script);
        node.provider_config =
            serde_json::from_value(serde_json::json!({"interpreter": "sh"})).unwrap();
        node.script_code = "cat \"$1\"".to_string();

        let outcome = ScriptExecutor
            .execute(&Map::new(), ctx_for(&services, &node, "context payload"))
            .await
            .unwrap();
        assert_eq!(outcome.output, "context payload");
    }

    #[tokio::test]
    async fn script_rejects_unknown_interpreter() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());
        let mut node = WorkflowNode::new("Script", NodeKind::Script);
        node.provider_config =
            serde_json::from_value(serde_json::json!({"interpreter": "perl"})).unwrap();
        node.script_code = "print 1".to_string();

        let err = ScriptExecutor
            .execute(&Map::new(), ctx_for(&services, &node, ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn script_cleans_up_temp_files() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());
        let mut node = WorkflowNode::new("Script", NodeKind::Script);
        node.provider_config =
            serde_json::from_value(serde_json::json!({"interpreter": "sh"})).unwrap();
        node.script_code = "echo done".to_string();

        ScriptExecutor
            .execute(&Map::new(), ctx_for(&services, &node, ""))
            .await
            .unwrap();

        let scripts_dir = dir.path().join(".scripts");
        let leftover = std::fs::read_dir(&scripts_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }
}
