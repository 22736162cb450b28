//! Execution Graph Scheduler (component D) and its data model (component §3).

pub mod build;
pub mod scheduler;
pub mod types;

pub use scheduler::GraphExecutor;
pub use types::{
    ExecutionContext, ExecutionResult, GraphDefinition, NodeDefinition, NodeExecution, NodeId,
    NodeStatus, NodeType, RetryPolicy,
};

use crate::error::Result;

impl GraphDefinition {
    /// Constructs and validates a graph in one step (§4.D: dangling
    /// dependencies, empty `entryNodes`, entry nodes with dependencies, and
    /// cycles are all rejected before a single node ever runs).
    pub fn validated(self) -> Result<Self> {
        build::validate(&self)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn validated_rejects_cycle() {
        let g = GraphDefinition {
            id: "g".into(),
            name: "g".into(),
            description: None,
            nodes: vec![
                NodeDefinition {
                    id: "a".into(),
                    node_type: NodeType::Task,
                    name: "a".into(),
                    description: None,
                    dependencies: vec!["b".into()],
                    config: crate::value::Value::Null,
                    timeout_ms: None,
                    retry_policy: None,
                    continue_on_error: false,
                },
                NodeDefinition {
                    id: "b".into(),
                    node_type: NodeType::Task,
                    name: "b".into(),
                    description: None,
                    dependencies: vec!["a".into()],
                    config: crate::value::Value::Null,
                    timeout_ms: None,
                    retry_policy: None,
                    continue_on_error: false,
                },
            ],
            entry_nodes: vec!["a".into()],
            variables: BTreeMap::new(),
        };
        assert!(g.validated().is_err());
    }
}
