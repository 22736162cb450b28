use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::expression::evaluate_condition;
use crate::graph::types::{ExecutionContext, NodeDefinition};
use crate::value::Value;

use super::{dispatch_operation, NodeHandler, ToolContext, ToolRegistry};

const DEFAULT_MAX_ITERATIONS: u64 = 1000;

fn loop_key(node_id: &str, index: u64) -> String {
    format!("__loop:{node_id}:iteration:{index}")
}

/// Two modes: **items** (`config.items` resolves to an array -- iterate
/// elements) and **condition** (`config.condition` -- re-evaluate before
/// each iteration). Per-iteration outputs live under
/// `__loop:<nodeId>:iteration:<i>` for the duration of the loop only: the
/// handler deletes every key it wrote before returning (§4.F, testable
/// property 11), so a pre-existing user key that happens to collide
/// textually is never touched.
pub struct LoopHandler {
    tools: Arc<dyn ToolRegistry>,
}

impl LoopHandler {
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self { tools }
    }

    fn max_iterations(node: &NodeDefinition) -> u64 {
        node.config
            .get_field("maxIterations")
            .and_then(Value::as_number)
            .map(|n| n as u64)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    async fn run_iteration(
        &self,
        node: &NodeDefinition,
        ctx: &ExecutionContext,
        index: u64,
        item: Option<Value>,
    ) -> Result<Value> {
        let mut iteration_config = node
            .config
            .as_map()
            .cloned()
            .unwrap_or_default();
        if let Some(item) = item {
            iteration_config.insert("_item".to_string(), item);
        }
        iteration_config.insert("_index".to_string(), Value::Number(index as f64));

        let key = loop_key(&node.id, index);
        ctx.outputs.insert(key.clone(), Value::Map(iteration_config.clone()));

        let tool_ctx = ToolContext {
            request_id: ctx.execution_id.clone(),
            ..Default::default()
        };
        let result = dispatch_operation(self.tools.as_ref(), &Value::Map(iteration_config), &tool_ctx).await;
        ctx.outputs.remove(&key);
        result
    }
}

#[async_trait]
impl NodeHandler for LoopHandler {
    async fn execute(&self, node: &NodeDefinition, ctx: &ExecutionContext) -> Result<Value> {
        let max_iterations = Self::max_iterations(node);
        let mut results = Vec::new();

        if let Some(items) = node.config.get_field("items") {
            let items = items
                .as_list()
                .ok_or_else(|| PipelineError::validation("LOOP config.items did not resolve to an array"))?
                .to_vec();
            if items.len() as u64 > max_iterations {
                warn!(node = node.id, limit = max_iterations, "LOOP items truncated to maxIterations");
            }
            for (index, item) in items.into_iter().take(max_iterations as usize).enumerate() {
                let out = self.run_iteration(node, ctx, index as u64, Some(item)).await?;
                results.push(out);
            }
        } else if let Some(condition) = node.config.get_field("condition") {
            let mut index = 0u64;
            loop {
                if index >= max_iterations {
                    break;
                }
                let should_continue = match condition {
                    Value::Bool(b) => *b,
                    Value::String(s) => evaluate_condition(s),
                    other => other.is_truthy(),
                };
                if !should_continue {
                    break;
                }
                let out = self.run_iteration(node, ctx, index, None).await?;
                results.push(out);
                index += 1;
            }
        } else {
            return Err(PipelineError::validation(
                "LOOP node requires config.items or config.condition",
            ));
        }

        Ok(Value::Map(BTreeMap::from([
            ("status".to_string(), Value::String("completed".to_string())),
            ("iterations".to_string(), Value::Number(results.len() as f64)),
            ("results".to_string(), Value::List(results)),
        ])))
    }
}
