use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::types::{ExecutionContext, NodeDefinition};
use crate::value::Value;

use super::{dispatch_operation, NodeHandler, ToolContext, ToolRegistry};

/// If `config.operation` is set, runs as a generic tool; otherwise emits a
/// branch-fan-out marker. The actual parallelism comes from the scheduler
/// running sibling nodes concurrently, not from this handler.
pub struct ParallelHandler {
    tools: Arc<dyn ToolRegistry>,
}

impl ParallelHandler {
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl NodeHandler for ParallelHandler {
    async fn execute(&self, node: &NodeDefinition, ctx: &ExecutionContext) -> Result<Value> {
        if node.config.get_field("operation").is_some() {
            let tool_ctx = ToolContext {
                request_id: ctx.execution_id.clone(),
                ..Default::default()
            };
            return dispatch_operation(self.tools.as_ref(), &node.config, &tool_ctx).await;
        }

        Ok(Value::Map(BTreeMap::from([
            ("status".to_string(), Value::String("completed".to_string())),
            ("nodeId".to_string(), Value::String(node.id.clone())),
            (
                "parallelBranches".to_string(),
                Value::List(node.dependencies.iter().cloned().map(Value::String).collect()),
            ),
        ])))
    }
}
