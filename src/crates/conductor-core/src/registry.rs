//! Node registry and the executor contract.
//!
//! A registry maps node-kind tags to executors implementing a uniform
//! contract. The table is extensible at runtime (plug-in executors for
//! integration kinds register through [`NodeRegistry::register`]); kinds
//! with no registered executor run through the agent executor, which is the
//! engine's final fallback.

use crate::blackboard::Blackboard;
use crate::error::Result;
use crate::events::EventBus;
use crate::memory::{MemoryStore, SummaryBufferMemory};
use crate::traffic::TrafficController;
use crate::workflow::WorkflowNode;
use async_trait::async_trait;
use conductor_llm::{FailoverManager, ProviderRegistry};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::info;

/// Shared services handed to every executor.
pub struct EngineServices {
    pub bus: EventBus,
    pub blackboard: Blackboard,
    pub traffic: Arc<TrafficController>,
    pub failover: Arc<FailoverManager>,
    pub providers: Arc<ProviderRegistry>,
    pub memory: Mutex<MemoryStore>,
    pub conversation: Mutex<SummaryBufferMemory>,
    /// Sandbox base directory for tool and subprocess work.
    pub base_dir: PathBuf,
}

/// Per-step execution context.
pub struct ExecContext<'a> {
    pub services: &'a EngineServices,
    pub node: &'a WorkflowNode,
    /// Context assembled from predecessor outputs (plus story history and
    /// any intervention feedback).
    pub context_str: &'a str,
    /// The run's initial input.
    pub initial_input: &'a str,
    /// Engine-supplied persona override, if any.
    pub persona_override: Option<&'a str>,
    /// Session export folder for this run, when one exists.
    pub session_dir: Option<&'a Path>,
}

/// Successful executor result.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub output: String,
    /// Structured payload for kinds that produce more than text.
    pub data: Option<Value>,
    /// Generative-UI schema to broadcast, for a2ui kinds.
    pub ui_event: Option<Value>,
}

impl ExecOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }
}

/// Uniform executor contract for all node kinds.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        inputs: &Map<String, Value>,
        ctx: ExecContext<'_>,
    ) -> Result<ExecOutcome>;
}

/// Dispatch table keyed by node-kind tag.
pub struct NodeRegistry {
    executors: RwLock<HashMap<String, Arc<dyn NodeExecutor>>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl NodeRegistry {
    pub fn empty() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with every built-in executor installed.
    pub fn with_defaults() -> Self {
        use crate::nodes;

        let registry = Self::empty();
        registry.register("input", Arc::new(nodes::io::InputExecutor));
        registry.register("output", Arc::new(nodes::io::OutputExecutor));
        registry.register("a2ui", Arc::new(nodes::io::A2uiExecutor));
        registry.register("memory", Arc::new(nodes::memory::MemoryExecutor));
        registry.register("http", Arc::new(nodes::http::HttpExecutor::default()));
        registry.register("openapi", Arc::new(nodes::http::OpenApiExecutor::default()));
        registry.register("shell", Arc::new(nodes::system::ShellExecutor));
        registry.register("script", Arc::new(nodes::system::ScriptExecutor));

        let agent = Arc::new(nodes::agent::AgentExecutor::default());
        for kind in [
            "agent",
            "auditor",
            "router",
            "character",
            "director",
            "optimizer",
            "architect",
            "critic",
            "system",
        ] {
            registry.register(kind, agent.clone());
        }
        registry
    }

    /// Register (or replace) the executor for a node-kind tag.
    pub fn register(&self, kind: &str, executor: Arc<dyn NodeExecutor>) {
        info!(kind, "registered node executor");
        self.executors
            .write()
            .expect("registry lock")
            .insert(kind.to_string(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors
            .read()
            .expect("registry lock")
            .get(kind)
            .cloned()
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .executors
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NodeKind;

    #[test]
    fn defaults_cover_builtin_kinds() {
        let registry = NodeRegistry::with_defaults();
        for kind in ["input", "output", "memory", "http", "shell", "script", "agent", "auditor"] {
            assert!(registry.get(kind).is_some(), "missing executor for {kind}");
        }
        // Integration kinds are plug-ins; absent by default.
        assert!(registry.get(NodeKind::Notion.as_str()).is_none());
        assert!(registry.get(NodeKind::Browser.as_str()).is_none());
    }

    #[test]
    fn runtime_registration_extends_the_table() {
        struct NoopExecutor;

        #[async_trait]
        impl NodeExecutor for NoopExecutor {
            async fn execute(
                &self,
                _inputs: &Map<String, Value>,
                _ctx: ExecContext<'_>,
            ) -> Result<ExecOutcome> {
                Ok(ExecOutcome::text("noop"))
            }
        }

        let registry = NodeRegistry::with_defaults();
        assert!(registry.get("discovery").is_none());
        registry.register("discovery", Arc::new(NoopExecutor));
        assert!(registry.get("discovery").is_some());
    }
}
