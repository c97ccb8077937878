//! End-to-end engine scenarios against the simulation provider.

use conductor_core::engine::{EngineConfig, WorkflowEngine};
use conductor_core::events::EngineEvent;
use conductor_core::workflow::{
    AgreementRule, NodeKind, NodeStatus, Workflow, WorkflowEdge, WorkflowNode,
};
use conductor_llm::{ProviderCatalog, ProviderEntry};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine_in(dir: &Path) -> WorkflowEngine {
    WorkflowEngine::new(EngineConfig {
        base_dir: dir.join("work"),
        exports_dir: dir.join("exports"),
        memory_path: None,
        max_concurrency: 1,
        approval_poll: Duration::from_millis(20),
        stall_sleep: Duration::from_millis(10),
    })
}

/// Install scripted simulation providers: `(provider_id, responses)`.
fn script_providers(engine: &WorkflowEngine, providers: &[(&str, &[&str])]) {
    let mut catalog = ProviderCatalog::default();
    for (id, responses) in providers {
        catalog.insert(ProviderEntry {
            id: id.to_string(),
            name: id.to_string(),
            kind: "simulation".to_string(),
            config: serde_json::from_value(json!({"responses": responses})).unwrap(),
            models: vec!["default".to_string()],
            enabled: true,
            last_health_check: None,
            status: None,
            extra: Default::default(),
        });
    }
    engine.providers().set_catalog(catalog);
}

fn agent(name: &str, provider: &str) -> WorkflowNode {
    let mut node = WorkflowNode::new(name, NodeKind::Agent);
    node.provider = provider.to_string();
    node
}

#[tokio::test]
async fn linear_two_agent_pipeline() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    let mut rx = engine.bus().subscribe();

    let mut workflow = Workflow::new("linear");
    let a = workflow.add_node(agent("A", "simulation"));
    let b = workflow.add_node(agent("B", "simulation"));
    workflow.add_edge(WorkflowEdge::new(&a, &b)).unwrap();

    let report = engine.execute(&mut workflow, "hi", false).await.unwrap();

    assert!(report.success);
    assert_eq!(workflow.nodes[&a].status, NodeStatus::Complete);
    assert_eq!(workflow.nodes[&b].status, NodeStatus::Complete);
    // B's context carried A's output (the echo provider repeats its input).
    let a_output = report.outputs[&a].clone();
    assert!(report.outputs[&b].contains("[A]:"));
    assert!(report.outputs[&b].contains(&a_output[..a_output.len().min(40)]));

    // At least one status transition per node reached the bus.
    let mut saw_a = false;
    let mut saw_b = false;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::NodeStatus { node_id, .. } = event {
            saw_a |= node_id == a;
            saw_b |= node_id == b;
        }
    }
    assert!(saw_a && saw_b);

    // Quiescence: no traffic slot is still held.
    assert_eq!(engine.traffic().active_count().await, 0);
}

#[tokio::test]
async fn auditor_reject_feedback_loop() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[
            ("writer", &["first draft", "second draft"][..]),
            ("critic", &["needs_rework: expand the middle", "approved"][..]),
        ],
    );

    let mut workflow = Workflow::new("review-loop");
    let mut writer = agent("Writer", "writer");
    writer.max_iterations = 2;
    let writer = workflow.add_node(writer);

    let mut critic = agent("Critic", "critic");
    critic.kind = NodeKind::Auditor;
    critic.max_iterations = 2;
    let critic = workflow.add_node(critic);

    let out = workflow.add_node(WorkflowNode::new("Out", NodeKind::Output));

    workflow.add_edge(WorkflowEdge::new(&writer, &critic)).unwrap();
    workflow
        .add_edge(WorkflowEdge::new(&critic, &writer).feedback().with_label("revise"))
        .unwrap();
    workflow.add_edge(WorkflowEdge::new(&critic, &out)).unwrap();

    let report = engine.execute(&mut workflow, "write a scene", false).await.unwrap();

    assert!(report.success, "nodes: {:?}", report.nodes);
    assert_eq!(workflow.nodes[&writer].iteration_count, 2, "writer runs twice");
    assert_eq!(workflow.nodes[&out].status, NodeStatus::Complete);
    assert_eq!(report.outputs[&writer], "second draft");
}

#[tokio::test]
async fn auditor_without_markers_advances_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[("writer", &["a draft"][..]), ("critic", &["hmm, unclear verdict"][..])],
    );

    let mut workflow = Workflow::new("stuck-auditor");
    let writer = workflow.add_node(agent("Writer", "writer"));
    let mut critic = agent("Critic", "critic");
    critic.kind = NodeKind::Auditor;
    let critic = workflow.add_node(critic);
    let out = workflow.add_node(WorkflowNode::new("Out", NodeKind::Output));

    workflow.add_edge(WorkflowEdge::new(&writer, &critic)).unwrap();
    workflow
        .add_edge(WorkflowEdge::new(&critic, &writer).feedback())
        .unwrap();
    workflow.add_edge(WorkflowEdge::new(&critic, &out)).unwrap();

    let report = engine.execute(&mut workflow, "write", false).await.unwrap();

    assert!(!report.success);
    assert_eq!(workflow.nodes[&out].status, NodeStatus::Idle);
    assert_eq!(workflow.nodes[&writer].iteration_count, 1);
}

#[tokio::test]
async fn router_conditional_branching() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[("router", &["this looks like a billing question"][..])],
    );

    let mut workflow = Workflow::new("support-routing");
    let mut router = agent("Router", "router");
    router.kind = NodeKind::Router;
    let router = workflow.add_node(router);

    let billing = workflow.add_node(agent("Billing", "simulation"));
    let technical = workflow.add_node(agent("Technical", "simulation"));
    let general = workflow.add_node(agent("General", "simulation"));

    workflow
        .add_edge(WorkflowEdge::new(&router, &billing).with_condition("billing"))
        .unwrap();
    workflow
        .add_edge(WorkflowEdge::new(&router, &technical).with_condition("technical"))
        .unwrap();
    workflow
        .add_edge(WorkflowEdge::new(&router, &general).with_condition("general"))
        .unwrap();

    let report = engine
        .execute(&mut workflow, "my invoice is wrong", false)
        .await
        .unwrap();

    assert_eq!(workflow.nodes[&billing].status, NodeStatus::Complete);
    assert_eq!(workflow.nodes[&technical].status, NodeStatus::Idle);
    assert_eq!(workflow.nodes[&general].status, NodeStatus::Idle);
    assert!(!report.success);
}

#[tokio::test]
async fn approval_gate_pauses_until_decision() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(engine_in(dir.path()));
    script_providers(&engine, &[("director", &["the plan"][..])]);

    let mut workflow = Workflow::new("gated");
    let mut director = agent("Director", "director");
    director.kind = NodeKind::Director;
    director.requires_approval = true;
    let director = workflow.add_node(director);
    let follow = workflow.add_node(agent("Follow", "simulation"));
    workflow.add_edge(WorkflowEdge::new(&director, &follow)).unwrap();

    let mut rx = engine.bus().subscribe();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let report = engine.execute(&mut workflow, "plan it", false).await.unwrap();
            (workflow, report)
        })
    };

    // Let the engine reach the waiting state (several empty polls), then
    // approve.
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.approve(&director).await;

    let (workflow, report) = runner.await.unwrap();
    assert!(report.success);
    assert_eq!(workflow.nodes[&director].status, NodeStatus::Complete);
    assert_eq!(workflow.nodes[&follow].status, NodeStatus::Complete);

    // Status transitions arrive in causal order for the director.
    let mut sequence = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::NodeStatus {
            node_id, status, ..
        } = event
        {
            if node_id == director {
                sequence.push(status);
            }
        }
    }
    let running = sequence
        .iter()
        .position(|s| *s == NodeStatus::Running)
        .expect("running seen");
    let waiting = sequence
        .iter()
        .position(|s| *s == NodeStatus::WaitingForApproval)
        .expect("waiting seen");
    let complete = sequence
        .iter()
        .position(|s| *s == NodeStatus::Complete)
        .expect("complete seen");
    assert!(running < waiting && waiting < complete);
}

#[tokio::test]
async fn rejection_fails_the_gated_node() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(engine_in(dir.path()));
    script_providers(&engine, &[("director", &["the plan"][..])]);

    let mut workflow = Workflow::new("gated-reject");
    let mut director = agent("Director", "director");
    director.kind = NodeKind::Director;
    director.requires_approval = true;
    let director = workflow.add_node(director);

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let report = engine.execute(&mut workflow, "plan it", false).await.unwrap();
            (workflow, report)
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.reject(&director).await;

    let (workflow, report) = runner.await.unwrap();
    assert!(!report.success);
    assert_eq!(workflow.nodes[&director].status, NodeStatus::Failed);
    assert!(workflow.nodes[&director]
        .error
        .as_deref()
        .unwrap()
        .contains("Rejected"));
}

#[tokio::test]
async fn failover_on_rate_limit_switches_provider() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[
            ("primary", &["Error: rate limit exceeded"][..]),
            ("secondary", &["ok"][..]),
        ],
    );
    engine
        .failover()
        .register_provider("primary", &["default"], 10)
        .await;
    engine
        .failover()
        .register_provider("secondary", &["default"], 20)
        .await;

    let mut rx = engine.bus().subscribe();

    let mut workflow = Workflow::new("failover");
    let node = workflow.add_node(agent("Worker", "primary"));

    let report = engine.execute(&mut workflow, "do the thing", false).await.unwrap();

    assert!(report.success);
    assert_eq!(report.outputs[&node], "ok");

    let primary = engine.failover().health_of("primary", "default").await.unwrap();
    assert_eq!(primary.failure_count, 1);
    assert!(!primary.is_available(), "primary is cooling down");

    let secondary = engine
        .failover()
        .health_of("secondary", "default")
        .await
        .unwrap();
    assert_eq!(secondary.success_count, 1);

    // The failover callback surfaced the switch with its reason.
    let mut saw_failover_log = false;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::Log { message, .. } = event {
            if message.contains("rate_limit") && message.contains("secondary") {
                saw_failover_log = true;
            }
        }
    }
    assert!(saw_failover_log);
}

#[tokio::test]
async fn tool_call_path_sandbox_blocks_escape() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[(
            "sneaky",
            &["<write_file path=\"../etc/passwd\">x</write_file> all done"][..],
        )],
    );

    let mut rx = engine.bus().subscribe();

    let mut workflow = Workflow::new("sandboxed");
    let node = workflow.add_node(agent("Sneaky", "sneaky"));

    let report = engine.execute(&mut workflow, "try it", false).await.unwrap();

    // The node still completes; only the tool call was rejected.
    assert!(report.success);
    assert_eq!(workflow.nodes[&node].status, NodeStatus::Complete);
    assert!(!dir.path().join("etc/passwd").exists());

    let mut saw_security_log = false;
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::Log { message, .. } = event {
            if message.contains("Security: blocked") {
                saw_security_log = true;
            }
        }
    }
    assert!(saw_security_log);
}

#[tokio::test]
async fn validation_gates_agent_completion() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[("flaky", &["missing the marker", "now it is READY"][..])],
    );

    let mut workflow = Workflow::new("validated");
    let mut node = agent("Producer", "flaky");
    node.agreement_rules = vec![AgreementRule {
        name: "must-be-ready".to_string(),
        kind: "contains".to_string(),
        value: json!("ready"),
        required: true,
    }];
    let node = workflow.add_node(node);

    let report = engine.execute(&mut workflow, "produce", false).await.unwrap();
    assert!(report.success);
    assert!(report.outputs[&node].contains("READY"));
}

#[tokio::test]
async fn set_state_tags_update_blackboard() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[("stateful", &["done <set_state key=\"phase\" value=\"review\"/>"][..])],
    );

    let mut workflow = Workflow::new("stateful");
    workflow.add_node(agent("Setter", "stateful"));

    let report = engine.execute(&mut workflow, "set it", false).await.unwrap();
    assert!(report.success);
    assert_eq!(report.blackboard["phase"], "review");
}

#[tokio::test]
async fn dispatch_tag_requeues_target() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[
            ("helper", &["helper output one", "helper output two"][..]),
            (
                "boss",
                &["<dispatch_task node=\"Helper\" input=\"run again with emphasis\"/> dispatched"][..],
            ),
        ],
    );

    let mut workflow = Workflow::new("dispatching");
    let mut helper = agent("Helper", "helper");
    helper.max_iterations = 2;
    let helper = workflow.add_node(helper);
    let mut boss = agent("Boss", "boss");
    boss.max_iterations = 1;
    let boss = workflow.add_node(boss);
    workflow.add_edge(WorkflowEdge::new(&helper, &boss)).unwrap();

    let report = engine.execute(&mut workflow, "start", false).await.unwrap();

    assert!(report.success, "nodes: {:?}", report.nodes);
    assert_eq!(workflow.nodes[&helper].iteration_count, 2);
    assert_eq!(report.outputs[&helper], "helper output two");
    let _ = boss;
}

#[tokio::test]
async fn replay_from_reproduces_downstream_outputs() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[("a", &["alpha output"][..]), ("b", &["beta output", "beta output"][..])],
    );

    let mut workflow = Workflow::new("replayable");
    let a = workflow.add_node(agent("A", "a"));
    let b = workflow.add_node(agent("B", "b"));
    workflow.add_edge(WorkflowEdge::new(&a, &b)).unwrap();

    let first = engine.execute(&mut workflow, "go", false).await.unwrap();
    assert!(first.success);
    assert_eq!(engine.history_len().await, 2);

    // Replay from after A's step: B re-executes and lands on the same
    // output map.
    let second = engine.replay_from(&mut workflow, 0).await.unwrap();
    assert!(second.success);
    assert_eq!(second.outputs[&a], first.outputs[&a]);
    assert_eq!(second.outputs[&b], first.outputs[&b]);
}

#[tokio::test]
async fn replay_reseeds_untouched_entry_chains() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(
        &engine,
        &[
            ("a", &["alpha one", "alpha two"][..]),
            ("b", &["beta one", "beta two"][..]),
            ("c", &["gamma one", "gamma two"][..]),
            ("d", &["delta one", "delta two"][..]),
        ],
    );

    // Two independent entry chains: A -> B and C -> D.
    let mut workflow = Workflow::new("two-chains");
    let a = workflow.add_node(agent("A", "a"));
    let b = workflow.add_node(agent("B", "b"));
    let c = workflow.add_node(agent("C", "c"));
    let d = workflow.add_node(agent("D", "d"));
    workflow.add_edge(WorkflowEdge::new(&a, &b)).unwrap();
    workflow.add_edge(WorkflowEdge::new(&c, &d)).unwrap();

    let first = engine.execute(&mut workflow, "go", false).await.unwrap();
    assert!(first.success);
    assert_eq!(engine.history_len().await, 4);

    // Snapshot 0 holds only the first committed node, so after restore the
    // other chain's entry is idle again and must be re-seeded alongside the
    // completed node's successor.
    let second = engine.replay_from(&mut workflow, 0).await.unwrap();
    assert!(second.success, "nodes: {:?}", second.nodes);
    for id in [&a, &b, &c, &d] {
        assert_eq!(workflow.nodes[id].status, NodeStatus::Complete);
    }
}

#[tokio::test]
async fn failed_node_does_not_stop_independent_branches() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(&engine, &[("fine", &["all good"][..])]);

    let mut workflow = Workflow::new("partial-failure");
    // A shell node with no command configured fails immediately.
    let broken = workflow.add_node(WorkflowNode::new("Broken", NodeKind::Shell));
    let healthy = workflow.add_node(agent("Healthy", "fine"));
    let downstream = workflow.add_node(agent("Downstream", "simulation"));
    workflow.add_edge(WorkflowEdge::new(&broken, &downstream)).unwrap();

    let report = engine.execute(&mut workflow, "run", false).await.unwrap();

    assert!(!report.success);
    assert_eq!(workflow.nodes[&broken].status, NodeStatus::Failed);
    assert!(workflow.nodes[&broken].error.is_some());
    assert_eq!(workflow.nodes[&healthy].status, NodeStatus::Complete);
    // The dependent branch never ran.
    assert_eq!(workflow.nodes[&downstream].status, NodeStatus::Idle);
}

#[tokio::test]
async fn sub_workflow_output_bubbles_to_parent() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());
    script_providers(&engine, &[("inner", &["inner result complete"][..])]);

    // Child workflow: one agent into an output node.
    let mut child = Workflow::new("child");
    let inner = child.add_node(agent("Inner", "inner"));
    let child_out = child.add_node(WorkflowNode::new("ChildOut", NodeKind::Output));
    child.add_edge(WorkflowEdge::new(&inner, &child_out)).unwrap();

    let mut workflow = Workflow::new("parent");
    let mut host = WorkflowNode::new("Host", NodeKind::Agent);
    host.sub_workflows = vec![conductor_core::workflow::SubWorkflowRef {
        path: None,
        content: Some(serde_json::to_value(&child).unwrap()),
    }];
    let host = workflow.add_node(host);

    let report = engine.execute(&mut workflow, "delegate", false).await.unwrap();

    assert!(report.success, "nodes: {:?}", report.nodes);
    assert!(report.outputs[&host].contains("inner result complete"));
}

#[tokio::test]
async fn stop_prevents_new_admissions() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(dir.path());

    let mut workflow = Workflow::new("stoppable");
    let a = workflow.add_node(agent("A", "simulation"));
    let b = workflow.add_node(agent("B", "simulation"));
    workflow.add_edge(WorkflowEdge::new(&a, &b)).unwrap();

    engine.stop();
    // Stop state resets at the start of each run; stopping mid-run is
    // exercised through the approval-wait path instead.
    let report = engine.execute(&mut workflow, "hi", false).await.unwrap();
    assert!(report.success);
}
