//! Workflow data model
//!
//! A [`Workflow`] is a directed graph of heterogeneous [`WorkflowNode`]s
//! joined by [`WorkflowEdge`]s. Edges marked `feedback` may form cycles and
//! never contribute to predecessor-readiness; the subgraph of non-feedback
//! edges must be acyclic, which [`Workflow::validate`] enforces.
//!
//! Serialization mirrors the on-disk workflow document: enum values are
//! lowercase strings, node `kind` is stored under the `type` key, and
//! unknown fields are preserved on round-trip through flattened maps.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Generate the short ids used throughout the workflow document.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

/// The closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Auditor,
    Input,
    Output,
    Router,
    Character,
    Director,
    Optimizer,
    Script,
    Memory,
    Rag,
    Http,
    Openapi,
    Github,
    Huggingface,
    Notion,
    Google,
    Mcp,
    Comfy,
    Browser,
    Shell,
    System,
    A2ui,
    Discovery,
    Architect,
    Critic,
    TelegramTrigger,
    DiscordTrigger,
}

impl NodeKind {
    /// The lowercase tag used in serialized documents and registry keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "agent",
            NodeKind::Auditor => "auditor",
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::Router => "router",
            NodeKind::Character => "character",
            NodeKind::Director => "director",
            NodeKind::Optimizer => "optimizer",
            NodeKind::Script => "script",
            NodeKind::Memory => "memory",
            NodeKind::Rag => "rag",
            NodeKind::Http => "http",
            NodeKind::Openapi => "openapi",
            NodeKind::Github => "github",
            NodeKind::Huggingface => "huggingface",
            NodeKind::Notion => "notion",
            NodeKind::Google => "google",
            NodeKind::Mcp => "mcp",
            NodeKind::Comfy => "comfy",
            NodeKind::Browser => "browser",
            NodeKind::Shell => "shell",
            NodeKind::System => "system",
            NodeKind::A2ui => "a2ui",
            NodeKind::Discovery => "discovery",
            NodeKind::Architect => "architect",
            NodeKind::Critic => "critic",
            NodeKind::TelegramTrigger => "telegram_trigger",
            NodeKind::DiscordTrigger => "discord_trigger",
        }
    }

    /// Kinds whose outputs join the shared story history.
    pub fn is_narrative(&self) -> bool {
        matches!(
            self,
            NodeKind::Director | NodeKind::Character | NodeKind::Auditor
        )
    }
}

/// Execution status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Complete,
    Failed,
    Skipped,
    WaitingForApproval,
    Paused,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Complete => "complete",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::WaitingForApproval => "waiting_for_approval",
            NodeStatus::Paused => "paused",
        }
    }
}

/// A rule that must be satisfied for a node's output to stand.
///
/// `kind` is an open string so documents carrying rule kinds this engine
/// does not know keep validating (unknown kinds pass by default).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgreementRule {
    pub name: String,
    #[serde(rename = "type", default = "default_rule_kind")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_rule_kind() -> String {
    "contains".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    1
}

fn default_position() -> f64 {
    100.0
}

fn default_provider() -> String {
    "simulation".to_string()
}

fn default_model() -> String {
    "default".to_string()
}

fn default_tier() -> String {
    "free".to_string()
}

/// A sub-workflow attachment: inline content or a document path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubWorkflowRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    #[serde(default = "short_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: NodeKind,

    // Visual positioning
    #[serde(default = "default_position")]
    pub x: f64,
    #[serde(default = "default_position")]
    pub y: f64,

    // Behavior
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub provider_config: Map<String, Value>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub internet_access: bool,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    // Execution contract
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub agreement_rules: Vec<AgreementRule>,
    #[serde(default)]
    pub sub_workflows: Vec<SubWorkflowRef>,
    #[serde(default = "default_true")]
    pub return_event_bubble: bool,
    #[serde(default)]
    pub save_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,

    // Kind-specific configuration
    #[serde(default)]
    pub script_code: String,
    #[serde(default)]
    pub memory_config: Map<String, Value>,

    // Runtime state
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_kind() -> NodeKind {
    NodeKind::Agent
}

impl WorkflowNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: short_id(),
            name: name.into(),
            kind,
            x: default_position(),
            y: default_position(),
            persona: String::new(),
            backstory: String::new(),
            provider: default_provider(),
            model: default_model(),
            provider_config: Map::new(),
            inputs: Map::new(),
            internet_access: false,
            tier: default_tier(),
            category: None,
            max_iterations: 1,
            iteration_count: 0,
            requires_approval: false,
            agreement_rules: Vec::new(),
            sub_workflows: Vec::new(),
            return_event_bubble: true,
            save_enabled: false,
            save_path: None,
            script_code: String::new(),
            memory_config: Map::new(),
            status: NodeStatus::Idle,
            display_status: None,
            output: None,
            error: None,
            extra: Map::new(),
        }
    }

    /// Reset runtime state to idle.
    pub fn reset(&mut self) {
        self.status = NodeStatus::Idle;
        self.output = None;
        self.error = None;
        self.display_status = None;
    }
}

/// A connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    #[serde(default = "short_id")]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Condition substring consulted by router nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Feedback edges may form cycles and never gate readiness.
    #[serde(default)]
    pub feedback: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            source: source.into(),
            target: target.into(),
            label: None,
            condition: None,
            feedback: false,
            extra: Map::new(),
        }
    }

    pub fn feedback(mut self) -> Self {
        self.feedback = true;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A complete workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "short_id")]
    pub id: String,
    #[serde(default = "default_workflow_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: HashMap<String, WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_workflow_name() -> String {
    "New Workflow".to_string()
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new("New Workflow")
    }
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            name: name.into(),
            description: String::new(),
            nodes: HashMap::new(),
            edges: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            extra: Map::new(),
        }
    }

    /// Add a node, returning its id.
    pub fn add_node(&mut self, node: WorkflowNode) -> String {
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        self.updated_at = Utc::now();
        id
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, node_id: &str) {
        if self.nodes.remove(node_id).is_some() {
            self.edges
                .retain(|e| e.source != node_id && e.target != node_id);
            self.updated_at = Utc::now();
        }
    }

    /// Add an edge between existing nodes.
    pub fn add_edge(&mut self, edge: WorkflowEdge) -> Result<String> {
        if !self.nodes.contains_key(&edge.source) || !self.nodes.contains_key(&edge.target) {
            return Err(EngineError::Validation(format!(
                "edge {} -> {} references a non-existent node",
                edge.source, edge.target
            )));
        }
        let id = edge.id.clone();
        self.edges.push(edge);
        self.updated_at = Utc::now();
        Ok(id)
    }

    /// Nodes with no incoming non-feedback edge.
    pub fn entry_nodes(&self) -> Vec<String> {
        let targets: HashSet<&str> = self
            .edges
            .iter()
            .filter(|e| !e.feedback)
            .map(|e| e.target.as_str())
            .collect();
        let mut entries: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| !targets.contains(id.as_str()))
            .cloned()
            .collect();
        entries.sort();
        entries
    }

    /// Every successor of a node, feedback edges included.
    pub fn successors(&self, node_id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.source == node_id)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Every predecessor of a node, feedback edges included.
    pub fn predecessors(&self, node_id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.target == node_id)
            .map(|e| e.source.clone())
            .collect()
    }

    /// Predecessors that gate readiness (non-feedback edges only).
    pub fn blocking_predecessors(&self, node_id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.target == node_id && !e.feedback)
            .map(|e| e.source.clone())
            .collect()
    }

    /// Validate edge endpoints and acyclicity of the non-feedback subgraph.
    pub fn validate(&self) -> Result<()> {
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(EngineError::Validation(format!(
                    "edge {} has dangling source '{}'",
                    edge.id, edge.source
                )));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(EngineError::Validation(format!(
                    "edge {} has dangling target '{}'",
                    edge.id, edge.target
                )));
            }
        }

        // Cycle detection on the non-feedback subgraph (iterative DFS with
        // a recursion stack).
        let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in self.edges.iter().filter(|e| !e.feedback) {
            forward
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for start in self.nodes.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            visited.insert(start.as_str());
            on_stack.insert(start.as_str());

            while let Some((node, index)) = stack.pop() {
                let successors = forward.get(node).map(Vec::as_slice).unwrap_or(&[]);
                if index < successors.len() {
                    stack.push((node, index + 1));
                    let next = successors[index];
                    if on_stack.contains(next) {
                        let name = self
                            .nodes
                            .get(next)
                            .map(|n| n.name.as_str())
                            .unwrap_or(next);
                        return Err(EngineError::Validation(format!(
                            "cycle detected involving node '{name}' in non-feedback subgraph"
                        )));
                    }
                    if !visited.contains(next) {
                        visited.insert(next);
                        on_stack.insert(next);
                        stack.push((next, 0));
                    }
                } else {
                    on_stack.remove(node);
                }
            }
        }

        Ok(())
    }

    /// Find a node by display name or id.
    pub fn find_node(&self, name_or_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(name_or_id).or_else(|| {
            self.nodes
                .values()
                .find(|n| n.name == name_or_id)
        })
    }
}
