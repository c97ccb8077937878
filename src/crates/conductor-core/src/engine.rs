//! Workflow engine.
//!
//! Executes a [`Workflow`] as a DAG: a ready queue is walked in passes, and
//! a node is admitted once every non-feedback predecessor is complete.
//! Feedback edges only participate in routing, which lets auditor/critic
//! loops cycle without breaking readiness. Each admitted node acquires a
//! traffic slot, runs its executor, has tool and blackboard tags extracted
//! from its output, and commits a time-travel snapshot.
//!
//! The engine never raises out of `execute`: node failures are recorded on
//! the node and independent branches keep running.

use crate::blackboard::Blackboard;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::memory::{MemoryStore, SummaryBufferMemory};
use crate::registry::{EngineServices, ExecContext, NodeRegistry};
use crate::snapshot::ExecutionSnapshot;
use crate::tags::{self, DispatchInstruction};
use crate::tools::ToolProcessor;
use crate::traffic::{Priority, TrafficController};
use crate::validator;
use crate::workflow::{short_id, NodeKind, NodeStatus, Workflow, WorkflowNode};
use conductor_llm::{FailoverManager, ProviderRegistry};
use conductor_tooling::Sandbox;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Output markers that make an auditor's feedback edges fire.
const REJECTION_MARKERS: &[&str] = &[
    "incomplete",
    "needs_rework",
    "rejected",
    "failed validation",
    "placeholder detected",
    "not valid",
];

/// Output markers that make an auditor's forward edges fire.
const APPROVAL_MARKERS: &[&str] = &["validated", "approved", "complete", "ready", "passed"];

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sandbox base directory for tool and subprocess work.
    pub base_dir: PathBuf,
    /// Root of per-session export folders.
    pub exports_dir: PathBuf,
    /// Long-term memory persistence; in-memory when unset.
    pub memory_path: Option<PathBuf>,
    /// Global concurrency cap (1 = fully serialized).
    pub max_concurrency: usize,
    /// Sleep between intervention polls for a waiting node.
    pub approval_poll: Duration,
    /// Sleep after a pass that admitted nothing.
    pub stall_sleep: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            exports_dir: PathBuf::from("exports"),
            memory_path: None,
            max_concurrency: 1,
            approval_poll: Duration::from_secs(1),
            stall_sleep: Duration::from_millis(500),
        }
    }
}

/// Per-node result in the final report.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Result of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// True iff every node completed.
    pub success: bool,
    /// Outputs by node id, plus the `__input__` key.
    pub outputs: HashMap<String, String>,
    /// Final blackboard contents.
    pub blackboard: Map<String, Value>,
    pub nodes: HashMap<String, NodeReport>,
}

/// One-shot approval decision for a waiting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionDecision {
    Approve,
    Reject,
}

struct Session {
    dir: PathBuf,
    log: tokio::fs::File,
}

/// Executes workflows, owns the shared services, and exposes the control
/// surface (pause/resume/stop, approvals, feedback, replay).
pub struct WorkflowEngine {
    services: Arc<EngineServices>,
    registry: Arc<NodeRegistry>,
    config: EngineConfig,
    history: Mutex<Vec<ExecutionSnapshot>>,
    interventions: Mutex<HashMap<String, InterventionDecision>>,
    stopped: AtomicBool,
    session: Mutex<Option<Session>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let bus = EventBus::default();
        if let Err(e) = std::fs::create_dir_all(&config.base_dir) {
            error!(error = %e, "failed to create engine base directory");
        }
        let memory = match &config.memory_path {
            Some(path) => MemoryStore::open(path),
            None => MemoryStore::in_memory(),
        };
        let services = Arc::new(EngineServices {
            bus: bus.clone(),
            blackboard: Blackboard::new(bus),
            traffic: Arc::new(TrafficController::new(config.max_concurrency)),
            failover: Arc::new(FailoverManager::default()),
            providers: Arc::new(ProviderRegistry::new()),
            memory: Mutex::new(memory),
            conversation: Mutex::new(SummaryBufferMemory::new()),
            base_dir: config.base_dir.clone(),
        });
        Self {
            services,
            registry: Arc::new(NodeRegistry::with_defaults()),
            config,
            history: Mutex::new(Vec::new()),
            interventions: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    /// Child engine for sub-workflow execution: shares the traffic cap,
    /// failover state, provider cache, and executor registry; gets a fresh
    /// bus, blackboard, and memories.
    fn child_engine(&self) -> Self {
        let bus = EventBus::default();
        let services = Arc::new(EngineServices {
            bus: bus.clone(),
            blackboard: Blackboard::new(bus),
            traffic: self.services.traffic.clone(),
            failover: self.services.failover.clone(),
            providers: self.services.providers.clone(),
            memory: Mutex::new(MemoryStore::in_memory()),
            conversation: Mutex::new(SummaryBufferMemory::new()),
            base_dir: self.config.base_dir.clone(),
        });
        Self {
            services,
            registry: self.registry.clone(),
            config: self.config.clone(),
            history: Mutex::new(Vec::new()),
            interventions: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.services.bus
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.services.blackboard
    }

    pub fn traffic(&self) -> &Arc<TrafficController> {
        &self.services.traffic
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.services.failover
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.services.providers
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    // ---- Control surface -------------------------------------------------

    pub async fn pause(&self) {
        self.services.traffic.pause().await;
    }

    pub async fn resume_traffic(&self) {
        self.services.traffic.resume().await;
    }

    /// Ask the engine to finish in-flight work and admit no new nodes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Approve a node waiting for approval. One-shot.
    pub async fn approve(&self, node_id: &str) {
        self.interventions
            .lock()
            .await
            .insert(node_id.to_string(), InterventionDecision::Approve);
    }

    /// Reject a node waiting for approval. One-shot.
    pub async fn reject(&self, node_id: &str) {
        self.interventions
            .lock()
            .await
            .insert(node_id.to_string(), InterventionDecision::Reject);
    }

    /// Inject user feedback for a node; merged into its context on the next
    /// execution.
    pub async fn feedback(&self, node_id: &str, text: &str) {
        self.services.blackboard.append_feedback(node_id, text);
        self.log("System", format!("User intervention on {node_id}: {text}"))
            .await;
    }

    pub fn clear_blackboard(&self) {
        self.services.blackboard.clear();
    }

    /// Reset a workflow's runtime state without executing it.
    pub async fn reset(&self, workflow: &mut Workflow) {
        for node in workflow.nodes.values_mut() {
            node.reset();
            node.iteration_count = 0;
        }
        self.interventions.lock().await.clear();
        self.history.lock().await.clear();
    }

    /// Snapshot history captured so far.
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    // ---- Logging ---------------------------------------------------------

    async fn log(&self, speaker: &str, message: impl Into<String>) {
        let message = message.into();
        info!(speaker, "{message}");
        self.services.bus.emit(EngineEvent::log(speaker, &message));
        if let Some(session) = self.session.lock().await.as_mut() {
            let line = format!(
                "[{}] [{speaker}] {message}\n",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
            );
            let _ = session.log.write_all(line.as_bytes()).await;
            let _ = session.log.flush().await;
        }
    }

    fn emit_status(&self, node: &WorkflowNode) {
        self.services.bus.emit(EngineEvent::node_status(
            &node.id,
            &node.name,
            node.status,
            node.display_status.clone(),
            node.output.clone(),
        ));
    }

    fn emit_trace(
        &self,
        trace_id: &str,
        node: &WorkflowNode,
        status: &str,
        inputs: Option<Value>,
        outputs: Option<Value>,
        error: Option<String>,
    ) {
        self.services.bus.emit(EngineEvent::TraceEvent {
            trace_id: trace_id.to_string(),
            parent_id: None,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            status: status.to_string(),
            inputs,
            outputs,
            error,
            timestamp: chrono::Utc::now(),
        });
    }

    // ---- Session files ---------------------------------------------------

    async fn open_session(&self, workflow: &Workflow) -> Option<PathBuf> {
        let session_id = short_id();
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let slug: String = workflow
            .name
            .to_lowercase()
            .replace(' ', "_")
            .chars()
            .take(30)
            .collect();
        let dir = self.config.exports_dir.join(slug).join(format!("{stamp}_{session_id}"));

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "failed to create session folder");
            return None;
        }
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("workflow_execution.log"))
            .await
        {
            Ok(log) => {
                *self.session.lock().await = Some(Session {
                    dir: dir.clone(),
                    log,
                });
                Some(dir)
            }
            Err(e) => {
                error!(error = %e, "failed to open session log");
                Some(dir)
            }
        }
    }

    async fn session_dir(&self) -> Option<PathBuf> {
        self.session.lock().await.as_ref().map(|s| s.dir.clone())
    }

    // ---- Execution -------------------------------------------------------

    /// Run the workflow to a terminal state. With `resume`, current node
    /// statuses are kept and execution continues from waiting/ready nodes.
    pub async fn execute(
        &self,
        workflow: &mut Workflow,
        initial_input: &str,
        resume: bool,
    ) -> Result<ExecutionReport> {
        workflow.validate()?;
        self.execute_inner(workflow, initial_input.to_string(), resume)
            .await
    }

    fn execute_inner<'a>(
        &'a self,
        workflow: &'a mut Workflow,
        initial_input: String,
        resume: bool,
    ) -> BoxFuture<'a, Result<ExecutionReport>> {
        Box::pin(async move {
            self.stopped.store(false, Ordering::SeqCst);
            self.log(
                "System",
                format!(
                    "{} workflow: {}",
                    if resume { "Resuming" } else { "Starting" },
                    workflow.name
                ),
            )
            .await;

            if !resume {
                if let Some(dir) = self.open_session(workflow).await {
                    self.log("System", format!("Session folder: {}", dir.display()))
                        .await;
                }
                for node in workflow.nodes.values_mut() {
                    node.reset();
                    node.iteration_count = 0;
                }
            }

            let mut completed: HashSet<String> = workflow
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Complete)
                .map(|n| n.id.clone())
                .collect();

            let mut outputs: HashMap<String, String> = HashMap::new();
            outputs.insert("__input__".to_string(), initial_input.clone());
            for node in workflow.nodes.values() {
                if let Some(output) = &node.output {
                    outputs.insert(node.id.clone(), output.clone());
                }
            }

            let mut sorted_ids: Vec<String> = workflow.nodes.keys().cloned().collect();
            sorted_ids.sort();

            let mut story_history: Vec<String> = Vec::new();
            if resume {
                for id in &sorted_ids {
                    let node = &workflow.nodes[id];
                    if node.kind.is_narrative() && completed.contains(id) {
                        if let Some(output) = &node.output {
                            story_history.push(format!("[{}]: {output}", node.name));
                        }
                    }
                }
            }

            let mut queue: VecDeque<String> = VecDeque::new();
            if resume {
                for id in &sorted_ids {
                    let node = &workflow.nodes[id];
                    match node.status {
                        NodeStatus::WaitingForApproval => queue.push_back(id.clone()),
                        NodeStatus::Idle => {
                            // Vacuously true for entry nodes, which must be
                            // re-seeded too.
                            let blocking = workflow.blocking_predecessors(id);
                            if blocking.iter().all(|p| completed.contains(p)) {
                                queue.push_back(id.clone());
                            }
                        }
                        _ => {}
                    }
                }
            } else {
                queue = workflow.entry_nodes().into();
            }

            let mut dispatch_inputs: HashMap<String, String> = HashMap::new();
            let mut logged_waiting: HashSet<String> = HashSet::new();

            'passes: while !queue.is_empty() {
                if self.stopped.load(Ordering::SeqCst) {
                    self.log("System", "Stop requested; admitting no further nodes")
                        .await;
                    break 'passes;
                }

                let pass_size = queue.len();
                let mut progress = false;

                for _ in 0..pass_size {
                    let Some(node_id) = queue.pop_front() else {
                        break;
                    };
                    if !workflow.nodes.contains_key(&node_id) {
                        continue;
                    }
                    if self.stopped.load(Ordering::SeqCst) {
                        break 'passes;
                    }

                    // Loop recycling: a complete node re-enters only while
                    // its iteration budget lasts.
                    {
                        let node = workflow.nodes.get_mut(&node_id).expect("node exists");
                        if node.status == NodeStatus::Complete {
                            if node.iteration_count < node.max_iterations {
                                let name = node.name.clone();
                                let next = node.iteration_count + 1;
                                let max = node.max_iterations;
                                node.reset();
                                completed.remove(&node_id);
                                self.log(&name, format!("Recycling node (iteration {next}/{max})"))
                                    .await;
                            } else {
                                let name = node.name.clone();
                                let max = node.max_iterations;
                                self.log(
                                    &name,
                                    format!("Max iterations ({max}) reached. Stopping loop."),
                                )
                                .await;
                                continue;
                            }
                        }
                    }

                    // Readiness: every non-feedback predecessor complete.
                    let blocking = workflow.blocking_predecessors(&node_id);
                    let upstream_failed = blocking
                        .iter()
                        .any(|p| workflow.nodes[p].status == NodeStatus::Failed);
                    if upstream_failed {
                        self.log(
                            "System",
                            format!("Node {node_id} dropped: an upstream dependency failed"),
                        )
                        .await;
                        continue;
                    }
                    if !blocking.iter().all(|p| completed.contains(p)) {
                        if logged_waiting.insert(node_id.clone()) {
                            let missing: Vec<&String> = blocking
                                .iter()
                                .filter(|p| !completed.contains(*p))
                                .collect();
                            self.log("System", format!("Node {node_id} waiting for {missing:?}"))
                                .await;
                        }
                        queue.push_back(node_id);
                        continue;
                    }

                    // Approval gate: poll the one-shot intervention queue.
                    if workflow.nodes[&node_id].status == NodeStatus::WaitingForApproval {
                        match self.interventions.lock().await.remove(&node_id) {
                            Some(InterventionDecision::Approve) => {
                                let name = {
                                    let node =
                                        workflow.nodes.get_mut(&node_id).expect("node exists");
                                    node.status = NodeStatus::Complete;
                                    node.name.clone()
                                };
                                self.emit_status(&workflow.nodes[&node_id]);
                                self.log(&name, "User APPROVED output").await;
                                completed.insert(node_id.clone());
                                progress = true;
                                for succ in workflow.successors(&node_id) {
                                    if !completed.contains(&succ) && !queue.contains(&succ) {
                                        queue.push_back(succ);
                                    }
                                }
                            }
                            Some(InterventionDecision::Reject) => {
                                let name = {
                                    let node =
                                        workflow.nodes.get_mut(&node_id).expect("node exists");
                                    node.status = NodeStatus::Failed;
                                    node.error = Some("Rejected by user".to_string());
                                    node.name.clone()
                                };
                                self.emit_status(&workflow.nodes[&node_id]);
                                self.log(&name, "User REJECTED output").await;
                                progress = true;
                            }
                            None => {
                                tokio::time::sleep(self.config.approval_poll).await;
                                queue.push_back(node_id);
                            }
                        }
                        continue;
                    }

                    logged_waiting.remove(&node_id);
                    progress = true;

                    // Context assembly from predecessors and story history.
                    let mut context = self.build_context(
                        workflow,
                        &node_id,
                        &outputs,
                        &story_history,
                        &initial_input,
                    );
                    if let Some(priority_input) = dispatch_inputs.remove(&node_id) {
                        context.push_str(&format!("\n\n[PRIORITY DISPATCH]: {priority_input}"));
                    }

                    {
                        let node = workflow.nodes.get_mut(&node_id).expect("node exists");
                        node.iteration_count += 1;
                        self.log(
                            "System",
                            format!("{} starting (context: {} chars)", node.name, context.len()),
                        )
                        .await;
                    }

                    let node_snapshot = workflow.nodes[&node_id].clone();
                    let context_len = context.len();
                    let step = self
                        .run_node(&node_snapshot, &initial_input, context)
                        .await;

                    match step {
                        Ok(output) => {
                            let requires_approval = node_snapshot.requires_approval;
                            outputs.insert(node_id.clone(), output.clone());
                            {
                                let node =
                                    workflow.nodes.get_mut(&node_id).expect("node exists");
                                node.output = Some(output.clone());
                                node.status = if requires_approval {
                                    NodeStatus::WaitingForApproval
                                } else {
                                    NodeStatus::Complete
                                };
                            }
                            self.emit_status(&workflow.nodes[&node_id]);

                            if requires_approval {
                                self.log(&node_snapshot.name, "Waiting for user approval")
                                    .await;
                                queue.push_back(node_id);
                                continue;
                            }

                            completed.insert(node_id.clone());
                            if node_snapshot.kind.is_narrative() {
                                story_history
                                    .push(format!("[{}]: {output}", node_snapshot.name));
                            }

                            if node_snapshot.save_enabled
                                && node_snapshot.kind != NodeKind::Output
                            {
                                self.save_node_output(&node_snapshot, &output).await;
                            }

                            let usage = usage_estimate(context_len, output.len());
                            self.services.bus.emit(EngineEvent::thought(
                                &node_snapshot.name,
                                format!("<<<USAGE: {usage}>>>"),
                            ));

                            if !node_snapshot.agreement_rules.is_empty() {
                                let report =
                                    validator::validate(&output, &node_snapshot.agreement_rules);
                                if !report.passed() {
                                    self.log(
                                        &node_snapshot.name,
                                        format!(
                                            "Agreement validation failed: {}",
                                            report.failed_required.join(", ")
                                        ),
                                    )
                                    .await;
                                }
                            }

                            // Dynamic dispatch and sleep tags.
                            for instruction in tags::parse_instructions(&output) {
                                match instruction {
                                    DispatchInstruction::Sleep { duration } => {
                                        self.log(
                                            "System",
                                            format!(
                                                "Synchronization sleep: {}s requested by {}",
                                                duration.as_secs(),
                                                node_snapshot.name
                                            ),
                                        )
                                        .await;
                                        tokio::time::sleep(duration).await;
                                    }
                                    DispatchInstruction::Dispatch { target, input } => {
                                        let target_id = workflow
                                            .find_node(&target)
                                            .map(|n| n.id.clone());
                                        match target_id {
                                            Some(target_id) => {
                                                self.log(
                                                    "System",
                                                    format!(
                                                        "Dispatching {} -> {target}",
                                                        node_snapshot.name
                                                    ),
                                                )
                                                .await;
                                                let target_node = workflow
                                                    .nodes
                                                    .get_mut(&target_id)
                                                    .expect("node exists");
                                                target_node.reset();
                                                completed.remove(&target_id);
                                                dispatch_inputs.insert(target_id.clone(), input);
                                                if !queue.contains(&target_id) {
                                                    queue.push_back(target_id);
                                                    progress = true;
                                                }
                                            }
                                            None => {
                                                self.log(
                                                    "System",
                                                    format!(
                                                        "Dispatch failed: target '{target}' not found"
                                                    ),
                                                )
                                                .await;
                                            }
                                        }
                                    }
                                }
                            }

                            self.route_successors(workflow, &node_id, &output, &mut queue)
                                .await;

                            // Time-travel snapshot after the committed step.
                            let mut history = self.history.lock().await;
                            let snapshot = ExecutionSnapshot::new(
                                history.len(),
                                node_id.clone(),
                                self.services.blackboard.snapshot(),
                                outputs.clone(),
                            );
                            history.push(snapshot);
                        }
                        Err(e) => {
                            let name = {
                                let node =
                                    workflow.nodes.get_mut(&node_id).expect("node exists");
                                node.status = NodeStatus::Failed;
                                node.error = Some(e.to_string());
                                node.name.clone()
                            };
                            self.emit_status(&workflow.nodes[&node_id]);
                            self.log(&name, format!("Node failed: {e}")).await;
                        }
                    }
                }

                if progress {
                    logged_waiting.clear();
                } else if !queue.is_empty() {
                    // Nothing could run this pass; yield before retrying.
                    tokio::time::sleep(self.config.stall_sleep).await;
                }
            }

            let all_complete = workflow
                .nodes
                .values()
                .all(|n| n.status == NodeStatus::Complete);
            let message = if all_complete {
                "Workflow complete"
            } else {
                "Workflow completed with issues"
            };
            self.log("System", message).await;
            self.services
                .bus
                .emit(EngineEvent::workflow_complete(all_complete, message));

            // Close the session log; a later resume keeps logging through
            // tracing and the bus only.
            self.session.lock().await.take();

            Ok(ExecutionReport {
                success: all_complete,
                outputs,
                blackboard: self.services.blackboard.snapshot(),
                nodes: workflow
                    .nodes
                    .iter()
                    .map(|(id, node)| {
                        (
                            id.clone(),
                            NodeReport {
                                status: node.status,
                                output: node.output.clone(),
                                error: node.error.clone(),
                            },
                        )
                    })
                    .collect(),
            })
        })
    }

    fn build_context(
        &self,
        workflow: &Workflow,
        node_id: &str,
        outputs: &HashMap<String, String>,
        story_history: &[String],
        initial_input: &str,
    ) -> String {
        let mut parts: Vec<String> = Vec::new();

        let recent: Vec<String> = story_history
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect();
        if !recent.is_empty() {
            parts.push(format!(
                "=== SHARED STORY HISTORY ===\n{}\n==============================",
                recent.join("\n\n")
            ));
        }

        let predecessors = workflow.predecessors(node_id);
        for pred in &predecessors {
            if let Some(output) = outputs.get(pred) {
                parts.push(format!("[{}]: {output}", workflow.nodes[pred].name));
            }
        }

        if predecessors.is_empty() {
            initial_input.to_string()
        } else {
            parts.join("\n\n")
        }
    }

    /// Run one node step: traffic slot, dispatch, extraction. Returns the
    /// node's output or the error that failed it.
    async fn run_node(
        &self,
        node: &WorkflowNode,
        initial_input: &str,
        mut context: String,
    ) -> Result<String> {
        // Sub-workflow nodes hold no slot themselves; their children each
        // acquire one, which keeps the global cap meaningful and deadlock
        // free at cap 1.
        if !node.sub_workflows.is_empty() {
            self.update_running(node).await;
            return self.run_sub_workflows(node, &context, initial_input).await;
        }

        let priority = match node.kind {
            NodeKind::Director | NodeKind::System => Priority::Vip,
            NodeKind::Critic | NodeKind::Auditor => Priority::Bulk,
            _ => Priority::Standard,
        };
        self.log(
            &node.name,
            format!("Waiting for execution slot (priority: {})", priority.name()),
        )
        .await;
        self.services.traffic.acquire(&node.name, priority).await;

        let result = async {
            self.update_running(node).await;

            // Merge pending intervention feedback into the context.
            if let Some(feedback) = self.services.blackboard.feedback_for(&node.id) {
                context.push_str(&format!(
                    "\n\n[USER INTERVENTION/FEEDBACK]: {feedback}\n\
                     (You must prioritize this instruction over previous ones.)"
                ));
                self.log(
                    &node.name,
                    format!(
                        "Applying user feedback: {}",
                        feedback.chars().take(50).collect::<String>()
                    ),
                )
                .await;
            }

            let trace_id = uuid::Uuid::new_v4().to_string();
            self.emit_trace(
                &trace_id,
                node,
                "STARTED",
                Some(json!({
                    "context_len": context.len(),
                    "input_preview": context.chars().take(50).collect::<String>(),
                })),
                None,
                None,
            );

            let mut inputs = node.inputs.clone();
            inputs
                .entry("text".to_string())
                .or_insert_with(|| Value::String(initial_input.to_string()));
            inputs
                .entry("query".to_string())
                .or_insert_with(|| Value::String(initial_input.to_string()));

            let executor = self
                .registry
                .get(node.kind.as_str())
                .or_else(|| self.registry.get(NodeKind::Agent.as_str()))
                .ok_or_else(|| EngineError::node(&node.name, "no executor registered"))?;

            let session_dir = self.session_dir().await;
            let ctx = ExecContext {
                services: &self.services,
                node,
                context_str: &context,
                initial_input,
                persona_override: None,
                session_dir: session_dir.as_deref(),
            };
            let outcome = executor.execute(&inputs, ctx).await;

            match outcome {
                Ok(outcome) => {
                    if let Some(schema) = &outcome.ui_event {
                        self.services.bus.emit(EngineEvent::A2uiEvent {
                            node_id: node.id.clone(),
                            node_name: node.name.clone(),
                            schema: schema.clone(),
                        });
                    }

                    // Tool tags only carry meaning in LLM-produced output.
                    if runs_as_agent(&self.registry, node.kind) {
                        let sandbox = Sandbox::new(&self.services.base_dir)?;
                        let processor = ToolProcessor::new(
                            sandbox,
                            self.services.bus.clone(),
                            node.name.clone(),
                        );
                        let report = processor.process_all(&outcome.output).await;
                        if report.total_actions() > 0 {
                            self.log(
                                &node.name,
                                format!(
                                    "Tool actions: {} operations completed",
                                    report.total_actions()
                                ),
                            )
                            .await;
                        }
                    }
                    self.services.blackboard.apply_tags(&outcome.output);

                    self.emit_trace(
                        &trace_id,
                        node,
                        "COMPLETED",
                        None,
                        Some(Value::String(
                            outcome.output.chars().take(200).collect::<String>(),
                        )),
                        None,
                    );
                    Ok(outcome.output)
                }
                Err(e) => {
                    self.emit_trace(&trace_id, node, "FAILED", None, None, Some(e.to_string()));
                    Err(e)
                }
            }
        }
        .await;

        self.services.traffic.release().await;
        result
    }

    async fn update_running(&self, node: &WorkflowNode) {
        self.services.bus.emit(EngineEvent::node_status(
            &node.id,
            &node.name,
            NodeStatus::Running,
            node.display_status.clone(),
            None,
        ));
        self.log(&node.name, "Processing...").await;
    }

    async fn run_sub_workflows(
        &self,
        node: &WorkflowNode,
        context: &str,
        initial_input: &str,
    ) -> Result<String> {
        self.log(
            &node.name,
            format!("Executing {} attached sub-workflow(s)", node.sub_workflows.len()),
        )
        .await;

        let mut aggregate: Vec<String> = Vec::new();
        for (index, attachment) in node.sub_workflows.iter().enumerate() {
            let document: Value = if let Some(content) = &attachment.content {
                match content {
                    Value::String(text) => serde_json::from_str(text).map_err(|e| {
                        EngineError::node(&node.name, format!("sub-workflow {}: {e}", index + 1))
                    })?,
                    other => other.clone(),
                }
            } else if let Some(path) = &attachment.path {
                let full = self.config.base_dir.join(path);
                let text = tokio::fs::read_to_string(&full).await.map_err(|e| {
                    EngineError::node(&node.name, format!("sub-workflow {}: {e}", index + 1))
                })?;
                serde_json::from_str(&text).map_err(|e| {
                    EngineError::node(&node.name, format!("sub-workflow {}: {e}", index + 1))
                })?
            } else {
                continue;
            };

            let mut sub_workflow: Workflow = serde_json::from_value(document)?;
            let child = self.child_engine();

            // Bubble child events into the parent stream, prefixed by this
            // node's name.
            if node.return_event_bubble {
                let mut child_rx = child.bus().subscribe();
                let parent_bus = self.services.bus.clone();
                let prefix = node.name.clone();
                tokio::spawn(async move {
                    while let Ok(event) = child_rx.recv().await {
                        match event {
                            EngineEvent::Log {
                                speaker, message, ..
                            } => parent_bus
                                .emit(EngineEvent::log(format!("{prefix}/{speaker}"), message)),
                            EngineEvent::NodeThought {
                                node_name, thought, ..
                            } => parent_bus.emit(EngineEvent::thought(
                                &prefix,
                                format!("**[{node_name}]**: {thought}"),
                            )),
                            EngineEvent::NodeStatus {
                                node_name, status, ..
                            } => {
                                if status == NodeStatus::Running {
                                    parent_bus.emit(EngineEvent::log(
                                        &prefix,
                                        format!("Running sub-workflow node: {node_name}"),
                                    ));
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }

            let input = if !context.is_empty() { context } else { initial_input };
            let report = child.execute(&mut sub_workflow, input, false).await?;
            if !report.success {
                return Err(EngineError::node(
                    &node.name,
                    format!("Sub-workflow {} failed", index + 1),
                ));
            }

            let mut out_ids: Vec<&String> = sub_workflow
                .nodes
                .iter()
                .filter(|(_, n)| n.kind == NodeKind::Output && n.output.is_some())
                .map(|(id, _)| id)
                .collect();
            out_ids.sort();
            let outputs: Vec<String> = out_ids
                .iter()
                .filter_map(|id| sub_workflow.nodes[*id].output.clone())
                .collect();
            aggregate.push(if outputs.is_empty() {
                "Complete".to_string()
            } else {
                outputs.join("\n\n")
            });
        }

        self.log(&node.name, "Sub-workflow execution complete").await;
        Ok(format!(
            "--- Sub-Workflow Outputs ---\n\n{}",
            aggregate.join("\n\n")
        ))
    }

    async fn route_successors(
        &self,
        workflow: &Workflow,
        node_id: &str,
        output: &str,
        queue: &mut VecDeque<String>,
    ) {
        let node = &workflow.nodes[node_id];
        let output_lower = output.to_lowercase();
        let rejected = REJECTION_MARKERS.iter().any(|m| output_lower.contains(m));
        let approved = !rejected && APPROVAL_MARKERS.iter().any(|m| output_lower.contains(m));

        for edge in workflow.edges.iter().filter(|e| e.source == node_id) {
            let target = &edge.target;
            if queue.contains(target) {
                continue;
            }
            let Some(target_node) = workflow.nodes.get(target) else {
                continue;
            };
            // Failed is terminal for the run.
            if target_node.status == NodeStatus::Failed {
                continue;
            }
            // A complete target re-enters only while it has iterations left.
            if target_node.status == NodeStatus::Complete
                && target_node.iteration_count >= target_node.max_iterations
            {
                continue;
            }

            let fire = match node.kind {
                NodeKind::Auditor => {
                    if edge.feedback {
                        if rejected {
                            self.log(
                                "System",
                                format!(
                                    "VALIDATOR REJECTED: {} -> feedback to {}",
                                    node.name, target_node.name
                                ),
                            )
                            .await;
                            true
                        } else {
                            false
                        }
                    } else if approved {
                        self.log(
                            "System",
                            format!(
                                "VALIDATOR APPROVED: {} -> proceeding to {}",
                                node.name, target_node.name
                            ),
                        )
                        .await;
                        true
                    } else {
                        false
                    }
                }
                NodeKind::Router => match &edge.condition {
                    Some(condition) => output_lower.contains(&condition.to_lowercase()),
                    None => true,
                },
                _ => true,
            };

            if fire {
                queue.push_back(target.clone());
            }
        }
    }

    async fn save_node_output(&self, node: &WorkflowNode, output: &str) {
        let target = match &node.save_path {
            Some(path) => self.config.base_dir.join(path),
            None => match self.session_dir().await {
                Some(dir) => dir.join(format!(
                    "{}_output.md",
                    node.name.to_lowercase().replace(' ', "_")
                )),
                None => return,
            },
        };
        let write = async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, output).await
        };
        match write.await {
            Ok(()) => {
                self.log(&node.name, format!("Saved to {}", target.display()))
                    .await
            }
            Err(e) => self.log(&node.name, format!("Save error: {e}")).await,
        }
    }

    // ---- Time travel -----------------------------------------------------

    /// Restore state from snapshot `step_index` and resume execution.
    pub async fn replay_from(
        &self,
        workflow: &mut Workflow,
        step_index: usize,
    ) -> Result<ExecutionReport> {
        let snapshot = self
            .history
            .lock()
            .await
            .get(step_index)
            .cloned()
            .ok_or_else(|| EngineError::Snapshot(format!("invalid step index: {step_index}")))?;

        self.log(
            "System",
            format!(
                "Time travel: replaying from step {step_index} (node: {})",
                snapshot.node_id
            ),
        )
        .await;

        self.services.blackboard.restore(snapshot.blackboard.clone());

        for (id, node) in workflow.nodes.iter_mut() {
            match snapshot.outputs.get(id) {
                Some(output) => {
                    node.status = NodeStatus::Complete;
                    node.output = Some(output.clone());
                    node.error = None;
                }
                None => {
                    node.reset();
                    node.iteration_count = 0;
                }
            }
        }

        let initial = snapshot
            .outputs
            .get("__input__")
            .cloned()
            .unwrap_or_default();
        self.execute(workflow, &initial, true).await
    }
}

/// Whether a kind's output is produced by the agent protocol (explicitly or
/// through the registry's agent fallback), and so may carry tool tags.
fn runs_as_agent(registry: &NodeRegistry, kind: NodeKind) -> bool {
    match kind {
        NodeKind::Agent
        | NodeKind::Auditor
        | NodeKind::Router
        | NodeKind::Character
        | NodeKind::Director
        | NodeKind::Optimizer
        | NodeKind::Architect
        | NodeKind::Critic
        | NodeKind::System => true,
        other => registry.get(other.as_str()).is_none(),
    }
}

/// Rough token usage estimate (~4 chars per token) over the context fed to
/// the node and the output it produced.
fn usage_estimate(input_len: usize, output_len: usize) -> String {
    json!({
        "input_tokens": input_len / 4,
        "output_tokens": output_len / 4,
        "total_tokens": (input_len + output_len) / 4,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_estimate_is_chars_over_four() {
        let usage: Value = serde_json::from_str(&usage_estimate(8, 4)).unwrap();
        assert_eq!(usage["input_tokens"], 2);
        assert_eq!(usage["output_tokens"], 1);
        assert_eq!(usage["total_tokens"], 3);
    }

    #[test]
    fn agent_family_detection() {
        let registry = NodeRegistry::with_defaults();
        assert!(runs_as_agent(&registry, NodeKind::Agent));
        assert!(runs_as_agent(&registry, NodeKind::Auditor));
        // Unregistered integration kinds fall back to the agent executor.
        assert!(runs_as_agent(&registry, NodeKind::Notion));
        // Registered non-agent executors do not.
        assert!(!runs_as_agent(&registry, NodeKind::Http));
        assert!(!runs_as_agent(&registry, NodeKind::Output));
    }
}
