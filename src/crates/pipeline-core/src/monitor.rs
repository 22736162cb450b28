//! Pipeline Monitor (component H): subscribes to the execution graph's
//! event channel and aggregates per-execution metrics -- per-node
//! durations, retry counts, wait times, critical path, and bottlenecks --
//! surfacing a pipeline-level event vocabulary distinct from the graph's
//! node-level one (§4.H).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::events::{EventBus, GraphEvent, MonitorEvent};
use crate::graph::types::NodeId;
use crate::slo::{mean, stddev};

const DEFAULT_BOTTLENECK_RETRY_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    pub duration_ms: Option<u64>,
    pub wait_ms: Option<u64>,
    pub retries: u32,
    pub on_critical_path: bool,
}

/// Per-`executionId` aggregate built up from the graph's node-level events
/// as they arrive. `ready_at`/`started_at` are recorded in wall-clock
/// milliseconds since the execution started, purely to compute wait time
/// (`started_at - ready_at`); the monitor has no other use for absolute
/// time.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    pub execution_id: String,
    pub nodes: BTreeMap<NodeId, NodeMetrics>,
    pub dependencies: BTreeMap<NodeId, Vec<NodeId>>,
    pub critical_path_ms: u64,
    pub bottlenecks: Vec<NodeId>,
}

struct Inner {
    bottleneck_retry_threshold: u32,
    executions: Mutex<BTreeMap<String, ExecutionMetrics>>,
    events: Arc<EventBus>,
}

/// Cheaply cloneable handle over the in-memory per-execution metrics map.
/// One instance is owned by [`crate::runtime::Runtime`] and fed by a task
/// subscribed to the graph event channel.
#[derive(Clone)]
pub struct PipelineMonitor(Arc<Inner>);

impl PipelineMonitor {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self(Arc::new(Inner {
            bottleneck_retry_threshold: DEFAULT_BOTTLENECK_RETRY_THRESHOLD,
            executions: Mutex::new(BTreeMap::new()),
            events,
        }))
    }

    pub fn with_bottleneck_retry_threshold(mut self, threshold: u32) -> Self {
        Arc::get_mut(&mut self.0).expect("configure before cloning").bottleneck_retry_threshold = threshold;
        self
    }

    /// Records dependency edges up front so the critical-path DP has a
    /// topology to walk even before any node event arrives. Call once per
    /// execution, right after [`crate::graph::GraphExecutor`] is built.
    pub fn register_graph(&self, execution_id: impl Into<String>, dependencies: BTreeMap<NodeId, Vec<NodeId>>) {
        let execution_id = execution_id.into();
        let mut executions = self.0.executions.lock();
        executions.entry(execution_id.clone()).or_insert_with(|| ExecutionMetrics {
            execution_id: execution_id.clone(),
            ..Default::default()
        }).dependencies = dependencies;
        self.0.events.emit_monitor(MonitorEvent::PipelineStarted { execution_id });
    }

    /// Feeds one graph event into the running aggregate. Intended to be
    /// called from a task that owns a `broadcast::Receiver<GraphEvent>`.
    pub fn on_graph_event(&self, event: &GraphEvent) {
        match event {
            GraphEvent::NodeCompleted { execution_id, node } | GraphEvent::NodeFailed { execution_id, node } => {
                let mut executions = self.0.executions.lock();
                let exec = executions.entry(execution_id.clone()).or_insert_with(|| ExecutionMetrics {
                    execution_id: execution_id.clone(),
                    ..Default::default()
                });
                let metrics = exec.nodes.entry(node.node_id.clone()).or_default();
                metrics.duration_ms = node.duration_ms;
                metrics.retries = node.attempts.saturating_sub(1);
            }
            GraphEvent::ExecutionCompleted { execution_id, .. } => {
                self.finalize(execution_id);
                self.0.events.emit_monitor(MonitorEvent::PipelineCompleted { execution_id: execution_id.clone() });
            }
            GraphEvent::ExecutionFailed { execution_id, error } => {
                self.finalize(execution_id);
                self.0.events.emit_monitor(MonitorEvent::PipelineFailed {
                    execution_id: execution_id.clone(),
                    error: error.clone(),
                });
            }
            _ => {}
        }
    }

    /// Computes critical path and bottlenecks for `execution_id` and emits
    /// `bottleneck:detected` for each flagged node. Called once the
    /// execution has reached a terminal state.
    fn finalize(&self, execution_id: &str) {
        let mut executions = self.0.executions.lock();
        let Some(exec) = executions.get_mut(execution_id) else {
            return;
        };

        let critical_path_ms = longest_path(&exec.dependencies, &exec.nodes);
        exec.critical_path_ms = critical_path_ms;

        let durations: Vec<f64> = exec.nodes.values().filter_map(|n| n.duration_ms).map(|d| d as f64).collect();
        let mean_duration = mean(&durations);
        let stddev_duration = stddev(&durations);
        let on_path = critical_path_nodes(&exec.dependencies, &exec.nodes);

        let mut bottlenecks = Vec::new();
        for (node_id, metrics) in exec.nodes.iter_mut() {
            let duration = metrics.duration_ms.unwrap_or(0) as f64;
            let is_slow = duration > mean_duration + 2.0 * stddev_duration && stddev_duration > 0.0;
            let is_retried = metrics.retries >= self.0.bottleneck_retry_threshold;
            let on_critical_path = on_path.contains(node_id);
            metrics.on_critical_path = on_critical_path;

            if is_slow || is_retried || on_critical_path {
                bottlenecks.push(node_id.clone());
                let reason = if is_slow {
                    "duration exceeds mean + 2*stddev".to_string()
                } else if is_retried {
                    format!("retried {} times", metrics.retries)
                } else {
                    "on critical path".to_string()
                };
                debug!(execution_id, node = node_id, reason, "bottleneck detected");
                self.0.events.emit_monitor(MonitorEvent::BottleneckDetected {
                    execution_id: execution_id.to_string(),
                    node_id: node_id.clone(),
                    reason,
                });
            }
        }
        exec.bottlenecks = bottlenecks;
    }

    pub fn metrics_for(&self, execution_id: &str) -> Option<ExecutionMetrics> {
        self.0.executions.lock().get(execution_id).cloned()
    }
}

/// Longest dependency chain measured in accumulated COMPLETED node
/// duration: a longest-path DP over the DAG, falling back to 0 for
/// unrecorded (never-ran) nodes.
fn longest_path(dependencies: &BTreeMap<NodeId, Vec<NodeId>>, nodes: &BTreeMap<NodeId, NodeMetrics>) -> u64 {
    let mut memo: BTreeMap<NodeId, u64> = BTreeMap::new();
    let mut best = 0u64;
    for node_id in dependencies.keys() {
        let value = longest_path_to(node_id, dependencies, nodes, &mut memo);
        best = best.max(value);
    }
    best
}

fn longest_path_to(
    node_id: &str,
    dependencies: &BTreeMap<NodeId, Vec<NodeId>>,
    nodes: &BTreeMap<NodeId, NodeMetrics>,
    memo: &mut BTreeMap<NodeId, u64>,
) -> u64 {
    if let Some(cached) = memo.get(node_id) {
        return *cached;
    }
    let own_duration = nodes.get(node_id).and_then(|n| n.duration_ms).unwrap_or(0);
    let deps = dependencies.get(node_id).cloned().unwrap_or_default();
    let best_dep = deps
        .iter()
        .map(|dep| longest_path_to(dep, dependencies, nodes, memo))
        .max()
        .unwrap_or(0);
    let total = own_duration + best_dep;
    memo.insert(node_id.to_string(), total);
    total
}

/// The set of node ids on *a* longest path (ties broken by iteration
/// order), used to flag bottlenecks that sit on the critical path even if
/// they are not individually slow or retried.
fn critical_path_nodes(
    dependencies: &BTreeMap<NodeId, Vec<NodeId>>,
    nodes: &BTreeMap<NodeId, NodeMetrics>,
) -> std::collections::HashSet<NodeId> {
    let mut memo: BTreeMap<NodeId, u64> = BTreeMap::new();
    for node_id in dependencies.keys() {
        longest_path_to(node_id, dependencies, nodes, &mut memo);
    }

    let Some(mut current) = memo.iter().max_by_key(|(_, v)| **v).map(|(k, _)| k.clone()) else {
        return std::collections::HashSet::new();
    };
    let mut path = std::collections::HashSet::new();
    path.insert(current.clone());
    loop {
        let deps = dependencies.get(current.as_str()).cloned().unwrap_or_default();
        if deps.is_empty() {
            break;
        }
        let next = deps.iter().max_by_key(|d| memo.get(d.as_str()).copied().unwrap_or(0)).cloned();
        match next {
            Some(dep) => {
                path.insert(dep.clone());
                current = dep;
            }
            None => break,
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{NodeExecution, NodeStatus};

    fn node_completed(execution_id: &str, node_id: &str, duration_ms: u64, attempts: u32) -> GraphEvent {
        GraphEvent::NodeCompleted {
            execution_id: execution_id.to_string(),
            node: NodeExecution {
                node_id: node_id.to_string(),
                status: NodeStatus::Completed,
                start_time: None,
                end_time: None,
                duration_ms: Some(duration_ms),
                attempts,
                output: None,
                error: None,
            },
        }
    }

    #[test]
    fn bottleneck_flags_the_outlier_not_its_siblings() {
        let monitor = PipelineMonitor::new(Arc::new(EventBus::new()));
        let deps = BTreeMap::from([
            ("A".to_string(), vec![]),
            ("B".to_string(), vec!["A".to_string()]),
            ("C".to_string(), vec!["A".to_string()]),
            ("D".to_string(), vec!["A".to_string()]),
        ]);
        monitor.register_graph("e1", deps);

        monitor.on_graph_event(&node_completed("e1", "A", 10, 1));
        monitor.on_graph_event(&node_completed("e1", "B", 10, 1));
        monitor.on_graph_event(&node_completed("e1", "C", 10, 1));
        monitor.on_graph_event(&node_completed("e1", "D", 100, 1));
        monitor.on_graph_event(&GraphEvent::ExecutionCompleted { execution_id: "e1".to_string(), duration_ms: 120 });

        let metrics = monitor.metrics_for("e1").unwrap();
        assert!(metrics.bottlenecks.contains(&"D".to_string()));
        assert!(!metrics.bottlenecks.contains(&"B".to_string()));
        assert!(!metrics.bottlenecks.contains(&"C".to_string()));
    }

    #[test]
    fn critical_path_sums_longest_completed_chain() {
        let monitor = PipelineMonitor::new(Arc::new(EventBus::new()));
        let deps = BTreeMap::from([
            ("A".to_string(), vec![]),
            ("B".to_string(), vec!["A".to_string()]),
            ("C".to_string(), vec!["B".to_string()]),
        ]);
        monitor.register_graph("e1", deps);
        monitor.on_graph_event(&node_completed("e1", "A", 10, 1));
        monitor.on_graph_event(&node_completed("e1", "B", 20, 1));
        monitor.on_graph_event(&node_completed("e1", "C", 30, 1));
        monitor.on_graph_event(&GraphEvent::ExecutionCompleted { execution_id: "e1".to_string(), duration_ms: 60 });

        let metrics = monitor.metrics_for("e1").unwrap();
        assert_eq!(metrics.critical_path_ms, 60);
    }

    #[test]
    fn high_retry_count_is_flagged_even_without_slow_duration() {
        let monitor = PipelineMonitor::new(Arc::new(EventBus::new()));
        let deps = BTreeMap::from([("A".to_string(), vec![])]);
        monitor.register_graph("e1", deps);
        monitor.on_graph_event(&node_completed("e1", "A", 5, 4));
        monitor.on_graph_event(&GraphEvent::ExecutionCompleted { execution_id: "e1".to_string(), duration_ms: 5 });

        let metrics = monitor.metrics_for("e1").unwrap();
        assert!(metrics.bottlenecks.contains(&"A".to_string()));
    }
}
