//! Engine events and the event bus.
//!
//! Every observable state transition flows through [`EventBus`]: log lines,
//! reasoning fragments, node status changes, trace packets, blackboard
//! snapshots, generative-UI payloads, and run completion. Emission is
//! non-blocking; observers that fall behind lose the oldest events rather
//! than stalling the engine.

use crate::workflow::NodeStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Envelope sent to observers. Serializes as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Human-readable progress line.
    Log {
        speaker: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// A node changed status.
    NodeStatus {
        node_id: String,
        node_name: String,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    /// A reasoning fragment extracted from model output.
    NodeThought {
        node_name: String,
        thought: String,
        timestamp: DateTime<Utc>,
    },
    /// Full blackboard snapshot after a change.
    BlackboardUpdate(Map<String, Value>),
    /// Generative-UI schema emitted by an a2ui node.
    A2uiEvent {
        node_id: String,
        node_name: String,
        schema: Value,
    },
    /// The run finished.
    WorkflowComplete { success: bool, message: String },
    /// Fine-grained execution trace packet.
    TraceEvent {
        trace_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        node_id: String,
        node_name: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inputs: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn log(speaker: impl Into<String>, message: impl Into<String>) -> Self {
        EngineEvent::Log {
            speaker: speaker.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn thought(node_name: impl Into<String>, thought: impl Into<String>) -> Self {
        EngineEvent::NodeThought {
            node_name: node_name.into(),
            thought: thought.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn node_status(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        status: NodeStatus,
        display_status: Option<String>,
        output: Option<String>,
    ) -> Self {
        EngineEvent::NodeStatus {
            node_id: node_id.into(),
            node_name: node_name.into(),
            status,
            display_status,
            output,
        }
    }

    pub fn workflow_complete(success: bool, message: impl Into<String>) -> Self {
        EngineEvent::WorkflowComplete {
            success,
            message: message.into(),
        }
    }
}

/// Multi-producer, multi-consumer event dispatch.
///
/// Backed by a `tokio::sync::broadcast` channel. `emit` never blocks and
/// never fails from the engine's perspective; with no subscribers events
/// are simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach an observer.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all observers. Non-blocking.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
