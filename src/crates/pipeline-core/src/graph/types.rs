//! Core data model for the execution graph (§3 of the orchestration spec).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::value::Value;

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Task,
    Parallel,
    Condition,
    Merge,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    #[serde(default)]
    pub exponential: bool,
}

impl RetryPolicy {
    /// `backoffMs * (exponential ? 2^attempt : 1)`, per §4.D. `attempt` is
    /// 1-indexed (the delay computed *before* retry attempt `attempt`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = if self.exponential {
            2u64.saturating_pow(attempt)
        } else {
            1
        };
        Duration::from_millis(self.backoff_ms.saturating_mul(multiplier))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeDefinition>,
    pub entry_nodes: Vec<NodeId>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub start_time: Option<std::time::Instant>,
    pub end_time: Option<std::time::Instant>,
    pub duration_ms: Option<u64>,
    pub attempts: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl NodeExecution {
    pub fn pending(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            attempts: 0,
            output: None,
            error: None,
        }
    }
}

/// Per-run mutable state shared by every node of one execution. Owned
/// exclusively by the executing graph; handlers read it and write only
/// their own `outputs[nodeId]` entry (single-writer per key, see §5).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub graph_id: String,
    pub execution_id: String,
    pub variables: BTreeMap<String, Value>,
    /// `DashMap` rather than a locked `BTreeMap`: each node writes only its
    /// own key (single-writer per key, §5), so per-key striped access is
    /// sufficient and avoids a single coarse lock across every concurrently
    /// running node.
    pub outputs: dashmap::DashMap<NodeId, Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(graph_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            execution_id: execution_id.into(),
            variables: BTreeMap::new(),
            outputs: dashmap::DashMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn snapshot_outputs(&self) -> BTreeMap<NodeId, Value> {
        self.outputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub graph_id: String,
    pub execution_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub node_executions: Vec<NodeExecution>,
    pub outputs: BTreeMap<NodeId, Value>,
}
