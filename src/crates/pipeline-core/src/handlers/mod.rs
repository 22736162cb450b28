//! Node Handlers (component F): pluggable executors for each [`NodeType`](crate::graph::types::NodeType).

mod condition;
mod loop_handler;
mod merge;
mod parallel;
mod task;

pub use condition::ConditionHandler;
pub use loop_handler::LoopHandler;
pub use merge::MergeHandler;
pub use parallel::ParallelHandler;
pub use task::TaskHandler;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::types::{ExecutionContext, NodeDefinition};
use crate::value::Value;

/// Seam between a TASK/PARALLEL/LOOP node's `config.operation` and an
/// actual tool implementation. Production tools (browser, database, git,
/// test-runner, ...) are out of scope for this core and register against
/// this trait from the embedding application.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn execute(&self, operation: &str, config: &Value, ctx: &ToolContext) -> Result<Value>;

    /// Whether `operation` has a real registered implementation. The
    /// default registry returns `false` for everything and lets TASK/
    /// PARALLEL/LOOP handlers fall back to the synthesized "simulated
    /// execution" response (§4.F) so pipelines can be authored before
    /// every tool exists.
    fn has_operation(&self, operation: &str) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub request_id: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub workdir: Option<String>,
}

/// A registry with no registered tools: every operation falls back to the
/// synthesized response. Used by default when the embedding application
/// doesn't supply its own.
pub struct NullToolRegistry;

#[async_trait]
impl ToolRegistry for NullToolRegistry {
    async fn execute(&self, operation: &str, _config: &Value, _ctx: &ToolContext) -> Result<Value> {
        Ok(simulated_response(operation))
    }

    fn has_operation(&self, _operation: &str) -> bool {
        false
    }
}

pub(crate) fn simulated_response(operation: &str) -> Value {
    Value::Map(BTreeMap::from([
        ("status".to_string(), Value::String("completed".to_string())),
        (
            "output".to_string(),
            Value::String(format!("Simulated execution of {operation}")),
        ),
    ]))
}

/// Invokes a tool by `config.operation`, falling back to the simulated
/// response when no such operation is registered. Shared by TASK,
/// PARALLEL (when `config.operation` is set), and LOOP's per-iteration
/// dispatch.
pub(crate) async fn dispatch_operation(
    registry: &dyn ToolRegistry,
    config: &Value,
    ctx: &ToolContext,
) -> Result<Value> {
    let operation = config
        .get_field("operation")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    if registry.has_operation(operation) {
        registry.execute(operation, config, ctx).await
    } else {
        Ok(simulated_response(operation))
    }
}

/// Implemented by each node-type handler. `execute` receives the node with
/// `config` already resolved by [`crate::expression::resolve_node_config`].
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, node: &NodeDefinition, ctx: &ExecutionContext) -> Result<Value>;
}

/// Maps each [`NodeType`](crate::graph::types::NodeType) to its handler.
/// Built once per [`crate::runtime::Runtime`] from a shared [`ToolRegistry`].
pub struct HandlerRegistry {
    pub task: Arc<dyn NodeHandler>,
    pub parallel: Arc<dyn NodeHandler>,
    pub condition: Arc<dyn NodeHandler>,
    pub merge: Arc<dyn NodeHandler>,
    pub loop_: Arc<dyn NodeHandler>,
}

impl HandlerRegistry {
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self {
            task: Arc::new(TaskHandler::new(tools.clone())),
            parallel: Arc::new(ParallelHandler::new(tools.clone())),
            condition: Arc::new(ConditionHandler),
            merge: Arc::new(MergeHandler),
            loop_: Arc::new(LoopHandler::new(tools)),
        }
    }

    pub fn for_type(&self, node_type: crate::graph::types::NodeType) -> Arc<dyn NodeHandler> {
        use crate::graph::types::NodeType::*;
        match node_type {
            Task => self.task.clone(),
            Parallel => self.parallel.clone(),
            Condition => self.condition.clone(),
            Merge => self.merge.clone(),
            Loop => self.loop_.clone(),
        }
    }
}
