//! Execution snapshots (time travel).
//!
//! After every successful node step the engine records the blackboard and
//! the per-node output map. `replay_from` restores a snapshot and resumes
//! execution from that point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// State capture taken after a node committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Monotonically increasing step number.
    pub step_index: usize,
    /// The node whose completion produced this snapshot.
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    /// Deep copy of the blackboard at capture time.
    pub blackboard: Map<String, Value>,
    /// Node outputs at capture time, including the `__input__` key.
    pub outputs: HashMap<String, String>,
}

impl ExecutionSnapshot {
    pub fn new(
        step_index: usize,
        node_id: impl Into<String>,
        blackboard: Map<String, Value>,
        outputs: HashMap<String, String>,
    ) -> Self {
        Self {
            step_index,
            node_id: node_id.into(),
            timestamp: Utc::now(),
            blackboard,
            outputs,
        }
    }
}
