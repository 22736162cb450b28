//! Construction-time validation for [`GraphDefinition`]: dangling
//! references, empty/dependent entry nodes, and cycles (DFS with grey/black
//! marks, per §4.D).

use std::collections::{HashMap, HashSet};

use crate::error::{PipelineError, Result};
use crate::graph::types::GraphDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Grey,
    Black,
}

/// Validates `graph` in place. Called once at construction; a graph that
/// passes this check is immutable for the rest of its life (new
/// `GraphDefinition` values are built instead of mutating an existing one).
pub fn validate(graph: &GraphDefinition) -> Result<()> {
    let ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    if graph.entry_nodes.is_empty() {
        return Err(PipelineError::validation("graph must have at least one entry node"));
    }

    for entry in &graph.entry_nodes {
        if !ids.contains(entry.as_str()) {
            return Err(PipelineError::not_found("node", entry.clone()));
        }
    }

    let by_id: HashMap<&str, &crate::graph::types::NodeDefinition> =
        graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    for entry in &graph.entry_nodes {
        let node = by_id[entry.as_str()];
        if !node.dependencies.is_empty() {
            return Err(PipelineError::validation(format!(
                "entry node '{entry}' must not declare dependencies"
            )));
        }
    }

    for node in &graph.nodes {
        for dep in &node.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PipelineError::not_found("node", dep.clone()));
            }
        }
    }

    detect_cycle(graph)?;

    Ok(())
}

fn detect_cycle(graph: &GraphDefinition) -> Result<()> {
    let by_id: HashMap<&str, &crate::graph::types::NodeDefinition> =
        graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for node in &graph.nodes {
        if !marks.contains_key(node.id.as_str()) {
            visit(node.id.as_str(), &by_id, &mut marks)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a crate::graph::types::NodeDefinition>,
    marks: &mut HashMap<&'a str, Mark>,
) -> Result<()> {
    marks.insert(id, Mark::Grey);
    let node = by_id[id];
    for dep in &node.dependencies {
        match marks.get(dep.as_str()) {
            Some(Mark::Grey) => return Err(PipelineError::CycleDetected(dep.clone())),
            Some(Mark::Black) => continue,
            None => visit(dep.as_str(), by_id, marks)?,
        }
    }
    marks.insert(id, Mark::Black);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{NodeDefinition, NodeType};
    use crate::value::Value;

    fn node(id: &str, deps: &[&str]) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            node_type: NodeType::Task,
            name: id.to_string(),
            description: None,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            config: Value::Null,
            timeout_ms: None,
            retry_policy: None,
            continue_on_error: false,
        }
    }

    fn graph(nodes: Vec<NodeDefinition>, entry: &[&str]) -> GraphDefinition {
        GraphDefinition {
            id: "g".to_string(),
            name: "g".to_string(),
            description: None,
            nodes,
            entry_nodes: entry.iter().map(|s| s.to_string()).collect(),
            variables: Default::default(),
        }
    }

    #[test]
    fn accepts_diamond() {
        let g = graph(
            vec![node("A", &[]), node("B", &["A"]), node("C", &["A"]), node("D", &["B", "C"])],
            &["A"],
        );
        assert!(validate(&g).is_ok());
    }

    #[test]
    fn rejects_dangling_dependency() {
        let g = graph(vec![node("A", &["ghost"])], &["A"]);
        assert!(matches!(validate(&g), Err(PipelineError::NotFound { .. })));
    }

    #[test]
    fn rejects_cycle() {
        let g = graph(vec![node("A", &["B"]), node("B", &["A"])], &["A"]);
        assert!(matches!(validate(&g), Err(PipelineError::CycleDetected(_))));
    }

    #[test]
    fn rejects_entry_node_with_dependencies() {
        let g = graph(vec![node("A", &["B"]), node("B", &[])], &["A"]);
        assert!(validate(&g).is_err());
    }

    #[test]
    fn rejects_empty_entry_nodes() {
        let g = graph(vec![node("A", &[])], &[]);
        assert!(validate(&g).is_err());
    }
}
