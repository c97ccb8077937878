//! Agent node executor.
//!
//! The richest node kind: assembles the system prompt (persona, backstory,
//! summarized conversation memory, tool catalogue, blackboard snapshot),
//! routes generation through the failover manager, streams extracted
//! reasoning, and drives the validation/auto-retry loop.

use crate::error::{EngineError, Result};
use crate::registry::{ExecContext, ExecOutcome, NodeExecutor};
use crate::validator;
use async_trait::async_trait;
use conductor_llm::provider::is_error_result;
use conductor_llm::{
    strip_thinking, FailoverCallback, GenerateRequest, TaskCategory, ThoughtSink,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Model used when tier scaling upgrades a heavy paid-tier call.
const HIGH_WEIGHT_MODEL: &str = "large-general";
/// Cheaper sibling free-tier nodes are downshifted to.
const ECONOMY_MODEL: &str = "fast-general";
/// Assembled user messages longer than this trigger the upgrade.
const HEAVY_INPUT_CHARS: usize = 5000;

/// Catalogue of the tool tags the processor understands, injected into
/// every agent system prompt.
const TOOL_CATALOGUE: &str = r#"
## Tools

You can interact with the project environment using these XML tags in your output:

### Files and directories
<read_file path="path/to/file"/>
<write_file path="path/to/file">content</write_file>
<append_file path="path/to/file">content</append_file>
<delete_file path="path/to/file"/>
<create_dir path="path/to/dir"/>
<list_dir path="path/to/dir"/>
<delete_dir path="path/to/dir"/>
<copy path="source" to="destination"/>
<move path="source" to="destination"/>

### Projects and packages
<scaffold_project name="project-name" template="web-app|static-site|cli-tool"/>
<install_package name="package" manager="npm|yarn|pnpm|pip|cargo"/>
<install_tool name="tool"/>

### Commands
<run_command command="your command" timeout="120"/>
<run_build command="npm run build"/>

### Shared state and scheduling
<set_state key="name" value="value"/>
<set_state key="name">multi-line value</set_state>
<dispatch_task node="NodeName" input="priority instruction"/>
<sleep duration="30s"/>

All paths are relative to the project directory.
"#;

/// Standard agent/LLM executor with tool awareness and validation.
pub struct AgentExecutor {
    max_retries: usize,
}

impl Default for AgentExecutor {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl AgentExecutor {
    fn build_system_prompt(&self, ctx: &ExecContext<'_>, memory_context: &str) -> String {
        let node = ctx.node;
        let mut parts: Vec<String> = Vec::new();

        let persona = ctx
            .persona_override
            .map(str::to_string)
            .unwrap_or_else(|| node.persona.clone());
        parts.push(persona);

        if !node.backstory.is_empty() {
            parts.push(format!("\n## Backstory & Context\n{}", node.backstory));
        }
        if !memory_context.is_empty() {
            parts.push(format!(
                "\n## Conversation History (Summarized)\n{memory_context}"
            ));
        }
        parts.push(TOOL_CATALOGUE.to_string());

        let board = ctx.services.blackboard.snapshot();
        if !board.is_empty() {
            let rendered =
                serde_json::to_string_pretty(&board).unwrap_or_else(|_| "{}".to_string());
            parts.push(format!("\n[CURRENT GLOBAL STATE]:\n{rendered}\n"));
        }

        parts.join("\n")
    }

    fn resolve_category(&self, ctx: &ExecContext<'_>, prompt_text: &str) -> TaskCategory {
        ctx.node
            .category
            .as_deref()
            .and_then(TaskCategory::parse)
            .unwrap_or_else(|| conductor_llm::infer_category(prompt_text))
    }
}

#[async_trait]
impl NodeExecutor for AgentExecutor {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let services = ctx.services;
        let node = ctx.node;

        let base_user_message = if !ctx.context_str.is_empty() {
            ctx.context_str.to_string()
        } else {
            inputs
                .get("text")
                .or_else(|| inputs.get("query"))
                .and_then(Value::as_str)
                .unwrap_or(ctx.initial_input)
                .to_string()
        };

        let memory_context = services.conversation.lock().await.render();
        let system_prompt = self.build_system_prompt(&ctx, &memory_context);

        services
            .conversation
            .lock()
            .await
            .add_message("user", &base_user_message);

        // Tier scaling: heavy paid-tier calls are advisorily upgraded to a
        // higher-capability sibling.
        let scaling_enabled = node
            .provider_config
            .get("tier_scaling")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let mut model = node.model.clone();
        if scaling_enabled && node.tier == "free" && model == HIGH_WEIGHT_MODEL {
            services.bus.emit(crate::events::EngineEvent::log(
                &node.name,
                format!("Tier optimization: switched to {ECONOMY_MODEL}"),
            ));
            model = ECONOMY_MODEL.to_string();
        }
        if node.tier == "paid"
            && scaling_enabled
            && base_user_message.len() > HEAVY_INPUT_CHARS
            && model != HIGH_WEIGHT_MODEL
        {
            services.bus.emit(crate::events::EngineEvent::log(
                &node.name,
                format!(
                    "[HIGH WEIGHT] Context heavy ({} chars). Scaled to {HIGH_WEIGHT_MODEL}.",
                    base_user_message.len()
                ),
            ));
            model = HIGH_WEIGHT_MODEL.to_string();
        }

        let category = self.resolve_category(&ctx, &format!("{base_user_message} {system_prompt}"));

        let thought_sink: ThoughtSink = {
            let bus = services.bus.clone();
            let name = node.name.clone();
            Arc::new(move |thought: &str| {
                bus.emit(crate::events::EngineEvent::thought(&name, thought));
            })
        };
        let failover_log: FailoverCallback = {
            let bus = services.bus.clone();
            let name = node.name.clone();
            Arc::new(move |old_p, old_m, new_p, new_m, reason| {
                bus.emit(crate::events::EngineEvent::log(
                    &name,
                    format!("Failover: {old_p}/{old_m} -> {new_p}/{new_m} ({reason})"),
                ));
            })
        };

        let system_prompt = Arc::new(system_prompt);
        let mut correction = String::new();
        let mut last_failure = String::new();

        for attempt in 0..self.max_retries {
            let user_message = if correction.is_empty() {
                base_user_message.clone()
            } else {
                format!(
                    "{base_user_message}\n\n**ERROR IN PREVIOUS ATTEMPT:**\n{correction}\n\n\
                     Please fix the output and try again."
                )
            };

            let providers = services.providers.clone();
            let system_prompt = system_prompt.clone();
            let user_message = Arc::new(user_message);
            let sink = thought_sink.clone();
            let task = move |provider_id: String, task_model: String| {
                let providers = providers.clone();
                let system_prompt = system_prompt.clone();
                let user_message = user_message.clone();
                let sink = sink.clone();
                async move {
                    match providers.acquire(&provider_id, &task_model).await {
                        Ok(provider) => {
                            let request =
                                GenerateRequest::new((*system_prompt).clone(), (*user_message).clone())
                                    .with_model_override(task_model)
                                    .with_thought_sink(sink);
                            provider.generate(request).await
                        }
                        Err(e) => format!("Error: provider {provider_id} unavailable: {e}"),
                    }
                }
            };

            let outcome = services
                .failover
                .execute_with_failover(
                    &node.provider,
                    &model,
                    task,
                    Some(failover_log.clone()),
                    Some(category),
                )
                .await;

            if is_error_result(&outcome.result) {
                warn!(node = %node.name, attempt, error = %outcome.result, "generation failed");
                last_failure = outcome.result;
                if attempt + 1 < self.max_retries {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                continue;
            }

            if outcome.provider_id != node.provider || outcome.model != model {
                services.bus.emit(crate::events::EngineEvent::log(
                    &node.name,
                    format!(
                        "[FAILOVER SUCCESS] Completed using {}/{}",
                        outcome.provider_id, outcome.model
                    ),
                ));
            }

            // Final catch for reasoning that was not streamed.
            let (clean_output, thoughts) = strip_thinking(&outcome.result);
            for thought in &thoughts {
                services
                    .bus
                    .emit(crate::events::EngineEvent::thought(&node.name, thought));
            }

            {
                let mut conversation = services.conversation.lock().await;
                let preview: String = clean_output.chars().take(500).collect();
                let preview = if clean_output.chars().count() > 500 {
                    format!("{preview}...")
                } else {
                    preview
                };
                conversation.add_message("assistant", preview);
                if let Ok(provider) = services
                    .providers
                    .acquire(&outcome.provider_id, &outcome.model)
                    .await
                {
                    conversation.prune(&provider).await;
                }
            }

            let report = validator::validate(&clean_output, &node.agreement_rules);
            if report.passed() {
                return Ok(ExecOutcome::text(clean_output));
            }

            let failed = report.failed_required.clone();
            last_failure = format!("Validation failed: {}", failed.join(", "));
            if attempt + 1 >= self.max_retries {
                break;
            }

            services.bus.emit(crate::events::EngineEvent::log(
                &node.name,
                format!(
                    "Validation failed (required: {}). Retrying {}/{}...",
                    failed.join(", "),
                    attempt + 1,
                    self.max_retries
                ),
            ));
            correction = format!(
                "Your output failed the following validation rules: {}.",
                failed.join(", ")
            );
            let json_rule_failed = node
                .agreement_rules
                .iter()
                .any(|rule| failed.contains(&rule.name) && matches!(rule.kind.as_str(), "json" | "schema"));
            if json_rule_failed {
                correction.push_str(
                    " Please ensure your output is valid JSON or matches the requested schema.",
                );
            }
        }

        Err(EngineError::node(&node.name, last_failure))
    }
}
