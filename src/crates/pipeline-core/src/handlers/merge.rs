use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::types::{ExecutionContext, NodeDefinition};
use crate::value::Value;

use super::NodeHandler;

/// Collects outputs from every dependency into `mergedResults[depId]`,
/// concatenating any `findings` arrays found along the way.
pub struct MergeHandler;

#[async_trait]
impl NodeHandler for MergeHandler {
    async fn execute(&self, node: &NodeDefinition, ctx: &ExecutionContext) -> Result<Value> {
        let mut merged_results = BTreeMap::new();
        let mut findings = Vec::new();

        for dep in &node.dependencies {
            let output = ctx
                .outputs
                .get(dep)
                .map(|r| r.value().clone())
                .unwrap_or(Value::Null);
            if let Some(dep_findings) = output.get_field("findings").and_then(Value::as_list) {
                findings.extend(dep_findings.iter().cloned());
            }
            merged_results.insert(dep.clone(), output);
        }

        let merged_count = merged_results.len() as f64;

        Ok(Value::Map(BTreeMap::from([
            ("status".to_string(), Value::String("completed".to_string())),
            ("mergedResults".to_string(), Value::Map(merged_results)),
            ("findings".to_string(), Value::List(findings)),
            ("mergedCount".to_string(), Value::Number(merged_count)),
        ])))
    }
}
