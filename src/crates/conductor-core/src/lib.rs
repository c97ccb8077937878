//! Core workflow engine for conductor.
//!
//! Conductor executes user-authored graphs of heterogeneous nodes — LLM
//! agents, auditors, routers, script and shell sandboxes, HTTP connectors,
//! memory stores, sub-workflows — streaming fine-grained progress events to
//! observers while it runs.
//!
//! # Architecture
//!
//! - [`workflow`] — the data model: [`Workflow`], [`WorkflowNode`],
//!   [`WorkflowEdge`], validation of the non-feedback DAG
//! - [`engine`] — [`WorkflowEngine`]: frontier scheduling, conditional
//!   routing, loop recycling, approval gating, sub-workflows, time travel
//! - [`traffic`] — priority admission under a global concurrency cap
//! - [`events`] — the [`EventBus`] every component publishes through
//! - [`blackboard`] — shared state written by `<set_state>` tags
//! - [`tools`] — sandboxed execution of tool-call tags in agent output
//! - [`registry`] — the executor dispatch table and plug-in surface
//! - [`validator`] — agreement-rule evaluation
//! - [`memory`] — retrieval store and conversation memory
//! - [`snapshot`] — step-indexed state capture for replay
//!
//! Provider selection, health tracking, and failover live in the
//! `conductor-llm` crate; path/command/URL safety lives in
//! `conductor-tooling`.
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor_core::engine::{EngineConfig, WorkflowEngine};
//! use conductor_core::workflow::{NodeKind, Workflow, WorkflowEdge, WorkflowNode};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut workflow = Workflow::new("draft-and-review");
//! let writer = workflow.add_node(WorkflowNode::new("Writer", NodeKind::Agent));
//! let reviewer = workflow.add_node(WorkflowNode::new("Reviewer", NodeKind::Agent));
//! workflow.add_edge(WorkflowEdge::new(&writer, &reviewer))?;
//!
//! let engine = WorkflowEngine::new(EngineConfig::default());
//! let report = engine.execute(&mut workflow, "Write a haiku about rivers", false).await?;
//! assert!(report.success);
//! # Ok(())
//! # }
//! ```

pub mod blackboard;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory;
pub mod nodes;
pub mod registry;
pub mod snapshot;
pub mod tags;
pub mod tools;
pub mod traffic;
pub mod validator;
pub mod workflow;

pub use blackboard::Blackboard;
pub use engine::{
    EngineConfig, ExecutionReport, InterventionDecision, NodeReport, WorkflowEngine,
};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use memory::{MemoryStore, SummaryBufferMemory};
pub use registry::{EngineServices, ExecContext, ExecOutcome, NodeExecutor, NodeRegistry};
pub use snapshot::ExecutionSnapshot;
pub use tools::{ToolProcessor, ToolReport};
pub use traffic::{Priority, TrafficController};
pub use validator::{validate, ValidationReport};
pub use workflow::{
    AgreementRule, NodeKind, NodeStatus, Workflow, WorkflowEdge, WorkflowNode,
};
