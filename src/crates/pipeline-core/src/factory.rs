//! Pipeline Factory (component E): turns a declarative [`PipelineConfig`]
//! into a validated [`GraphDefinition`] via a fixed, type-keyed template.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::graph::{GraphDefinition, NodeDefinition, NodeType, RetryPolicy};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Development,
    QuickFix,
    Refactoring,
    CodeReview,
    Testing,
    Deployment,
}

impl PipelineType {
    fn template_name(&self) -> &'static str {
        match self {
            PipelineType::Development => "development",
            PipelineType::QuickFix => "quick_fix",
            PipelineType::Refactoring => "refactoring",
            PipelineType::CodeReview => "code_review",
            PipelineType::Testing => "testing",
            PipelineType::Deployment => "deployment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// One entry per [`PipelineType`]: a template's nodes, in the order the
/// factory should emit them, plus which node ids are entry points.
struct Template {
    entry_nodes: Vec<&'static str>,
    nodes: Vec<TemplateNode>,
}

struct TemplateNode {
    id: &'static str,
    node_type: NodeType,
    dependencies: &'static [&'static str],
    operation: &'static str,
}

/// Maps each [`PipelineType`] to its fixed template. Construction is pure
/// and holds no mutable state, so one registry is shared across every
/// factory call regardless of concurrency (§4.E).
pub struct TemplateRegistry {
    templates: BTreeMap<&'static str, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let mut templates = BTreeMap::new();

        templates.insert(
            "development",
            Template {
                entry_nodes: vec!["plan"],
                nodes: vec![
                    TemplateNode { id: "plan", node_type: NodeType::Task, dependencies: &[], operation: "plan" },
                    TemplateNode { id: "implement", node_type: NodeType::Task, dependencies: &["plan"], operation: "implement" },
                    TemplateNode { id: "test", node_type: NodeType::Task, dependencies: &["implement"], operation: "run_tests" },
                    TemplateNode { id: "review", node_type: NodeType::Task, dependencies: &["test"], operation: "review" },
                ],
            },
        );

        templates.insert(
            "quick_fix",
            Template {
                entry_nodes: vec!["fix"],
                nodes: vec![
                    TemplateNode { id: "fix", node_type: NodeType::Task, dependencies: &[], operation: "apply_fix" },
                    TemplateNode { id: "verify", node_type: NodeType::Task, dependencies: &["fix"], operation: "run_tests" },
                ],
            },
        );

        templates.insert(
            "refactoring",
            Template {
                entry_nodes: vec!["analyze"],
                nodes: vec![
                    TemplateNode { id: "analyze", node_type: NodeType::Task, dependencies: &[], operation: "analyze" },
                    TemplateNode { id: "transform", node_type: NodeType::Task, dependencies: &["analyze"], operation: "transform" },
                    TemplateNode { id: "verify", node_type: NodeType::Task, dependencies: &["transform"], operation: "run_tests" },
                    TemplateNode {
                        id: "guard",
                        node_type: NodeType::Condition,
                        dependencies: &["verify"],
                        operation: "tests_passed",
                    },
                ],
            },
        );

        templates.insert(
            "code_review",
            Template {
                entry_nodes: vec!["analyze"],
                nodes: vec![
                    TemplateNode { id: "analyze", node_type: NodeType::Task, dependencies: &[], operation: "analyze" },
                    TemplateNode { id: "lint", node_type: NodeType::Task, dependencies: &["analyze"], operation: "lint" },
                    TemplateNode { id: "test", node_type: NodeType::Task, dependencies: &["analyze"], operation: "run_tests" },
                    TemplateNode { id: "review", node_type: NodeType::Merge, dependencies: &["lint", "test"], operation: "" },
                    TemplateNode { id: "report", node_type: NodeType::Task, dependencies: &["review"], operation: "report" },
                ],
            },
        );

        templates.insert(
            "testing",
            Template {
                entry_nodes: vec!["unit", "integration"],
                nodes: vec![
                    TemplateNode { id: "unit", node_type: NodeType::Task, dependencies: &[], operation: "run_unit_tests" },
                    TemplateNode { id: "integration", node_type: NodeType::Task, dependencies: &[], operation: "run_integration_tests" },
                    TemplateNode { id: "report", node_type: NodeType::Merge, dependencies: &["unit", "integration"], operation: "" },
                ],
            },
        );

        templates.insert(
            "deployment",
            Template {
                entry_nodes: vec!["build"],
                nodes: vec![
                    TemplateNode { id: "build", node_type: NodeType::Task, dependencies: &[], operation: "build" },
                    TemplateNode { id: "test", node_type: NodeType::Task, dependencies: &["build"], operation: "run_tests" },
                    TemplateNode { id: "deploy", node_type: NodeType::Task, dependencies: &["test"], operation: "deploy" },
                    TemplateNode { id: "smoke_test", node_type: NodeType::Task, dependencies: &["deploy"], operation: "smoke_test" },
                ],
            },
        );

        Self { templates }
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a [`GraphDefinition`] from `config` against `registry`. Pure
/// function of its two arguments; safe to call concurrently (§4.E).
/// `parameters` are injected into every template node's `config` map under
/// the `parameters` key so handlers can reach them via
/// `${node.parameters.foo}` substitution without the factory needing to
/// know what any given operation does with them.
pub fn build_graph(config: &PipelineConfig, registry: &TemplateRegistry) -> Result<GraphDefinition> {
    let template_name = config.pipeline_type.template_name();
    let template = registry
        .templates
        .get(template_name)
        .ok_or_else(|| PipelineError::validation(format!("unknown pipeline type '{template_name}'")))?;

    let parameters = Value::Map(config.parameters.clone());

    let nodes = template
        .nodes
        .iter()
        .map(|tn| {
            let mut node_config = BTreeMap::new();
            if !tn.operation.is_empty() {
                node_config.insert("operation".to_string(), Value::String(tn.operation.to_string()));
            }
            node_config.insert("parameters".to_string(), parameters.clone());

            NodeDefinition {
                id: tn.id.to_string(),
                node_type: tn.node_type,
                name: tn.id.to_string(),
                description: None,
                dependencies: tn.dependencies.iter().map(|s| s.to_string()).collect(),
                config: Value::Map(node_config),
                timeout_ms: config.timeout_ms,
                retry_policy: config.retry_policy.clone(),
                continue_on_error: false,
            }
        })
        .collect();

    let graph = GraphDefinition {
        id: format!("{template_name}-{}", config.name),
        name: config.name.clone(),
        description: config.description.clone(),
        nodes,
        entry_nodes: template.entry_nodes.iter().map(|s| s.to_string()).collect(),
        variables: BTreeMap::new(),
    };

    graph.validated()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pipeline_type: PipelineType) -> PipelineConfig {
        PipelineConfig {
            pipeline_type,
            name: "p".to_string(),
            description: None,
            parameters: BTreeMap::new(),
            timeout_ms: None,
            retry_policy: None,
            concurrency: None,
        }
    }

    #[test]
    fn every_built_in_template_produces_a_valid_graph() {
        let registry = TemplateRegistry::new();
        for pt in [
            PipelineType::Development,
            PipelineType::QuickFix,
            PipelineType::Refactoring,
            PipelineType::CodeReview,
            PipelineType::Testing,
            PipelineType::Deployment,
        ] {
            let graph = build_graph(&config(pt), &registry);
            assert!(graph.is_ok(), "{pt:?} template failed validation: {graph:?}");
        }
    }

    #[test]
    fn parameters_are_injected_into_every_node_config() {
        let registry = TemplateRegistry::new();
        let mut cfg = config(PipelineType::QuickFix);
        cfg.parameters.insert("target".to_string(), Value::String("main.rs".to_string()));
        let graph = build_graph(&cfg, &registry).unwrap();
        for node in &graph.nodes {
            let params = node.config.get_field("parameters").unwrap();
            assert_eq!(params.get_field("target"), Some(&Value::String("main.rs".to_string())));
        }
    }
}
