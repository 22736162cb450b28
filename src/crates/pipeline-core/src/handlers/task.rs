use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::types::{ExecutionContext, NodeDefinition};
use crate::value::Value;

use super::{dispatch_operation, NodeHandler, ToolContext, ToolRegistry};

/// Dispatches on `config.operation` to the registered tool, or the
/// synthesized "simulated execution" response when unregistered.
pub struct TaskHandler {
    tools: Arc<dyn ToolRegistry>,
}

impl TaskHandler {
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl NodeHandler for TaskHandler {
    async fn execute(&self, node: &NodeDefinition, ctx: &ExecutionContext) -> Result<Value> {
        let tool_ctx = ToolContext {
            request_id: ctx.execution_id.clone(),
            ..Default::default()
        };
        dispatch_operation(self.tools.as_ref(), &node.config, &tool_ctx).await
    }
}
