//! Memory node executor.
//!
//! `store` adds the node's context to the long-term retrieval store;
//! `retrieve` returns the top-scoring records for a query.

use crate::error::{EngineError, Result};
use crate::registry::{ExecContext, ExecOutcome, NodeExecutor};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

const DEFAULT_LIMIT: usize = 5;

pub struct MemoryExecutor;

#[async_trait]
impl NodeExecutor for MemoryExecutor {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome> {
        let config = &ctx.node.memory_config;
        let action = config
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("store");

        match action {
            "store" => {
                let content = if !ctx.context_str.is_empty() {
                    ctx.context_str
                } else {
                    inputs
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or(ctx.initial_input)
                };
                if content.is_empty() {
                    return Err(EngineError::node(&ctx.node.name, "nothing to store"));
                }
                let tags: Vec<String> = config
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                let id = ctx.services.memory.lock().await.add(content, tags);
                Ok(ExecOutcome {
                    output: format!("Stored memory {id}"),
                    data: Some(json!({"id": id})),
                    ui_event: None,
                })
            }
            "retrieve" => {
                let query = inputs
                    .get("query")
                    .and_then(Value::as_str)
                    .filter(|q| !q.is_empty())
                    .unwrap_or(if !ctx.context_str.is_empty() {
                        ctx.context_str
                    } else {
                        ctx.initial_input
                    });
                let limit = config
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_LIMIT);

                let hits = ctx.services.memory.lock().await.search(query, limit);
                let rendered = if hits.is_empty() {
                    "No relevant memories found.".to_string()
                } else {
                    hits.iter()
                        .map(|hit| format!("- ({:.2}) {}", hit.score, hit.entry.content))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                let data = json!(hits
                    .iter()
                    .map(|hit| json!({
                        "id": hit.entry.id,
                        "content": hit.entry.content,
                        "tags": hit.entry.tags,
                        "score": hit.score,
                    }))
                    .collect::<Vec<_>>());

                Ok(ExecOutcome {
                    output: rendered,
                    data: Some(data),
                    ui_event: None,
                })
            }
            other => Err(EngineError::node(
                &ctx.node.name,
                format!("unknown memory action '{other}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EngineServices;
    use crate::workflow::{NodeKind, WorkflowNode};
    use serde_json::json;
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

    #[tokio::test]
    async fn store_then_retrieve() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());

        let mut store_node = WorkflowNode::new("Mem", NodeKind::Memory);
        store_node.memory_config =
            serde_json::from_value(json!({"action": "store", "tags": ["facts"]})).unwrap();
        let ctx = ExecContext {
            services: &services,
            node: &store_node,
            context_str: "the gateway listens on port nine thousand",
            initial_input: "",
            persona_override: None,
            session_dir: None,
        };
        let outcome = MemoryExecutor.execute(&Map::new(), ctx).await.unwrap();
        assert!(outcome.output.starts_with("Stored memory"));

        // Filler entry keeps shared-term IDF positive.
        services
            .memory
            .lock()
            .await
            .add("unrelated trivia entry", vec![]);

        let mut retrieve_node = WorkflowNode::new("Mem", NodeKind::Memory);
        retrieve_node.memory_config =
            serde_json::from_value(json!({"action": "retrieve", "limit": 3})).unwrap();
        let mut inputs = Map::new();
        inputs.insert("query".to_string(), json!("which port does the gateway use"));
        let ctx = ExecContext {
            services: &services,
            node: &retrieve_node,
            context_str: "",
            initial_input: "",
            persona_override: None,
            session_dir: None,
        };
        let outcome = MemoryExecutor.execute(&inputs, ctx).await.unwrap();
        assert!(outcome.output.contains("nine thousand"));
    }

    #[tokio::test]
    async fn unknown_action_fails_the_node() {
        let dir = TempDir::new().unwrap();
        let services = services(dir.path());
        let mut node = WorkflowNode::new("Mem", NodeKind::Memory);
        node.memory_config = serde_json::from_value(json!({"action": "compact"})).unwrap();
        let ctx = ExecContext {
            services: &services,
            node: &node,
            context_str: "x",
            initial_input: "x",
            persona_override: None,
            session_dir: None,
        };
        assert!(MemoryExecutor.execute(&Map::new(), ctx).await.is_err());
    }
}
