use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::expression::evaluate_condition;
use crate::graph::types::{ExecutionContext, NodeDefinition};
use crate::value::Value;

use super::NodeHandler;

/// Evaluates `config.condition` (already variable-substituted by the
/// scheduler before this handler runs). On truthy result, emits a `passed`
/// payload; on falsy, returns `ConditionFailed` so the scheduler's normal
/// failure/`continueOnError` handling applies (§9 open question 2).
pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, node: &NodeDefinition, _ctx: &ExecutionContext) -> Result<Value> {
        let condition_value = node
            .config
            .get_field("condition")
            .cloned()
            .ok_or_else(|| PipelineError::validation("CONDITION node requires config.condition"))?;

        // The scheduler substitutes `config.condition` before calling this
        // handler. If the whole field was a single `${...}` token and that
        // token resolved to a native bool/number, use it directly;
        // otherwise the substituted string (which may itself be the
        // original literal string condition) runs through the sandbox.
        let (passed, evaluated) = match &condition_value {
            Value::Bool(b) => (*b, b.to_string()),
            Value::Number(n) => (*n != 0.0, n.to_string()),
            Value::String(s) => (evaluate_condition(s), s.clone()),
            other => (other.is_truthy(), other.canonical_string()),
        };

        if passed {
            Ok(Value::Map(BTreeMap::from([
                ("status".to_string(), Value::String("passed".to_string())),
                ("condition".to_string(), condition_value.clone()),
                ("evaluatedCondition".to_string(), Value::String(evaluated)),
                ("result".to_string(), Value::Bool(true)),
                ("passed".to_string(), Value::Bool(true)),
            ])))
        } else {
            Err(PipelineError::ConditionFailed {
                condition: condition_value.canonical_string(),
                evaluated,
            })
        }
    }
}
