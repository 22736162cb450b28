//! Bounded-concurrency DAG scheduler (component D).
//!
//! A node becomes ready once every dependency has reached a status the
//! scheduler admits (`Completed`, `Skipped`, or `Failed` with
//! `continueOnError`); a node becomes `Blocked` the moment any dependency
//! is `Blocked` or `Failed` without `continueOnError` (§4.D, §9 open
//! question 2). Concurrency is enforced by a semaphore sized to
//! `concurrency`, which gives testable property 3 for free from the
//! semaphore's own invariant rather than a manually counted gauge.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::events::{EventBus, GraphEvent};
use crate::expression::resolve_node_config;
use crate::graph::types::{
    ExecutionContext, ExecutionResult, GraphDefinition, NodeDefinition, NodeExecution, NodeId,
    NodeStatus,
};
use crate::handlers::HandlerRegistry;

pub struct GraphExecutor {
    graph: GraphDefinition,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    concurrency: usize,
}

enum DepResolution {
    Admitted,
    Blocking,
    Pending,
}

impl GraphExecutor {
    pub fn new(
        graph: GraphDefinition,
        handlers: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        concurrency: usize,
    ) -> Self {
        Self {
            graph,
            handlers,
            events,
            concurrency: concurrency.max(1),
        }
    }

    fn by_id(&self) -> HashMap<&str, &NodeDefinition> {
        self.graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }

    fn dep_resolution(
        dep_id: &str,
        by_id: &HashMap<&str, &NodeDefinition>,
        statuses: &dashmap::DashMap<NodeId, NodeStatus>,
    ) -> DepResolution {
        match statuses.get(dep_id).map(|s| *s) {
            Some(NodeStatus::Completed) | Some(NodeStatus::Skipped) => DepResolution::Admitted,
            Some(NodeStatus::Failed) => {
                if by_id.get(dep_id).map(|n| n.continue_on_error).unwrap_or(false) {
                    DepResolution::Admitted
                } else {
                    DepResolution::Blocking
                }
            }
            Some(NodeStatus::Blocked) => DepResolution::Blocking,
            _ => DepResolution::Pending,
        }
    }

    /// Runs the graph to completion (or until `outer_timeout` elapses).
    /// `outer_timeout` corresponds to `PipelineConfig.timeout` (§5): on
    /// expiry, in-flight node tasks are aborted (dropping the `JoinSet`)
    /// and every node that never got to run is marked `Skipped`.
    pub async fn run(&self, execution_id: impl Into<String>, outer_timeout: Option<Duration>) -> ExecutionResult {
        let execution_id = execution_id.into();
        let start = Instant::now();

        self.events.emit_graph(GraphEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            graph_id: self.graph.id.clone(),
        });

        let statuses: dashmap::DashMap<NodeId, NodeStatus> = self
            .graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect();
        let executions: dashmap::DashMap<NodeId, NodeExecution> = self
            .graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeExecution::pending(n.id.clone())))
            .collect();
        let ctx = Arc::new(ExecutionContext::new(self.graph.id.clone(), execution_id.clone()));

        let timed_out = match outer_timeout {
            Some(dur) => tokio::time::timeout(dur, self.run_inner(&execution_id, &statuses, &executions, ctx.clone()))
                .await
                .is_err(),
            None => {
                self.run_inner(&execution_id, &statuses, &executions, ctx.clone()).await;
                false
            }
        };

        if timed_out {
            warn!(execution_id, "execution timed out, marking unresolved nodes skipped");
            for node in &self.graph.nodes {
                let still_pending = matches!(
                    statuses.get(&node.id).map(|s| *s),
                    Some(NodeStatus::Pending) | Some(NodeStatus::Ready) | Some(NodeStatus::Running)
                );
                if still_pending {
                    statuses.insert(node.id.clone(), NodeStatus::Skipped);
                    if let Some(mut exec) = executions.get_mut(&node.id) {
                        exec.status = NodeStatus::Skipped;
                    }
                }
            }
        }

        let hard_failed = self.graph.nodes.iter().any(|n| {
            matches!(statuses.get(&n.id).map(|s| *s), Some(NodeStatus::Failed)) && !n.continue_on_error
        });
        let success = !timed_out && !hard_failed;
        let duration_ms = start.elapsed().as_millis() as u64;

        if success {
            self.events.emit_graph(GraphEvent::ExecutionCompleted {
                execution_id: execution_id.clone(),
                duration_ms,
            });
        } else {
            let error = if timed_out {
                format!("execution '{execution_id}' timed out")
            } else {
                "one or more nodes failed without continueOnError".to_string()
            };
            self.events.emit_graph(GraphEvent::ExecutionFailed {
                execution_id: execution_id.clone(),
                error: error.clone(),
            });
        }

        ExecutionResult {
            graph_id: self.graph.id.clone(),
            execution_id,
            success,
            duration_ms,
            error: (!success).then(|| {
                if timed_out {
                    "timeout".to_string()
                } else {
                    "node failure".to_string()
                }
            }),
            node_executions: executions.iter().map(|e| e.value().clone()).collect(),
            outputs: ctx.snapshot_outputs(),
        }
    }

    async fn run_inner(
        &self,
        execution_id: &str,
        statuses: &dashmap::DashMap<NodeId, NodeStatus>,
        executions: &dashmap::DashMap<NodeId, NodeExecution>,
        ctx: Arc<ExecutionContext>,
    ) {
        let by_id = self.by_id();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(NodeId, std::result::Result<crate::value::Value, PipelineError>, u32)> =
            JoinSet::new();
        let mut in_flight: HashSet<NodeId> = HashSet::new();

        loop {
            // Resolve readiness/blocking for every still-PENDING node.
            for node in &self.graph.nodes {
                if !matches!(statuses.get(&node.id).map(|s| *s), Some(NodeStatus::Pending)) {
                    continue;
                }
                let mut blocking = false;
                let mut all_admitted = true;
                for dep in &node.dependencies {
                    match Self::dep_resolution(dep, &by_id, statuses) {
                        DepResolution::Blocking => {
                            blocking = true;
                            break;
                        }
                        DepResolution::Pending => all_admitted = false,
                        DepResolution::Admitted => {}
                    }
                }
                if blocking {
                    statuses.insert(node.id.clone(), NodeStatus::Blocked);
                    if let Some(mut exec) = executions.get_mut(&node.id) {
                        exec.status = NodeStatus::Blocked;
                    }
                    self.events.emit_graph(GraphEvent::NodeBlocked {
                        execution_id: execution_id.to_string(),
                        node_id: node.id.clone(),
                    });
                } else if all_admitted {
                    statuses.insert(node.id.clone(), NodeStatus::Ready);
                }
            }

            // Spawn as many READY nodes as the semaphore allows.
            let ready: Vec<NodeId> = self
                .graph
                .nodes
                .iter()
                .filter(|n| matches!(statuses.get(&n.id).map(|s| *s), Some(NodeStatus::Ready)))
                .map(|n| n.id.clone())
                .collect();

            for node_id in ready {
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                statuses.insert(node_id.clone(), NodeStatus::Running);
                in_flight.insert(node_id.clone());
                if let Some(mut exec) = executions.get_mut(&node_id) {
                    exec.status = NodeStatus::Running;
                    exec.start_time = Some(Instant::now());
                }
                self.events.emit_graph(GraphEvent::NodeStarted {
                    execution_id: execution_id.to_string(),
                    node_id: node_id.clone(),
                });

                let node = (*by_id[node_id.as_str()]).clone();
                let handlers = self.handlers.clone();
                let events = self.events.clone();
                let ctx = ctx.clone();
                let exec_id = execution_id.to_string();

                join_set.spawn(async move {
                    let (result, attempts) = execute_with_retry(&node, &ctx, handlers.as_ref(), &events, &exec_id).await;
                    drop(permit);
                    (node.id.clone(), result, attempts)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (node_id, result, attempts) = joined.expect("node task panicked");
            in_flight.remove(&node_id);

            let mut exec = executions.get_mut(&node_id).expect("execution record exists");
            exec.attempts = attempts;
            exec.end_time = Some(Instant::now());
            exec.duration_ms = exec
                .start_time
                .map(|s| exec.end_time.unwrap().duration_since(s).as_millis() as u64);

            match result {
                Ok(output) => {
                    exec.status = NodeStatus::Completed;
                    exec.output = Some(output.clone());
                    statuses.insert(node_id.clone(), NodeStatus::Completed);
                    ctx.outputs.insert(node_id.clone(), output);
                    self.events.emit_graph(GraphEvent::NodeCompleted {
                        execution_id: execution_id.to_string(),
                        node: exec.clone(),
                    });
                }
                Err(err) => {
                    exec.status = NodeStatus::Failed;
                    exec.error = Some(err.to_wire_message());
                    statuses.insert(node_id.clone(), NodeStatus::Failed);
                    self.events.emit_graph(GraphEvent::NodeFailed {
                        execution_id: execution_id.to_string(),
                        node: exec.clone(),
                    });
                }
            }
        }
    }
}

/// Runs `node`'s handler under its `timeout`/`retryPolicy`. The per-attempt
/// timeout resets on every retry (§9 open question 3): each attempt gets a
/// fresh `tokio::time::timeout`, not a cumulative deadline.
async fn execute_with_retry(
    node: &NodeDefinition,
    ctx: &ExecutionContext,
    handlers: &HandlerRegistry,
    events: &EventBus,
    execution_id: &str,
) -> (std::result::Result<crate::value::Value, PipelineError>, u32) {
    let max_retries = node.retry_policy.as_ref().map(|p| p.max_retries).unwrap_or(0);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let resolved_config = resolve_node_config(&node.config, &ctx.outputs);
        let resolved_node = NodeDefinition {
            config: resolved_config,
            ..node.clone()
        };

        let handler = handlers.for_type(node.node_type);
        let attempt_fut = handler.execute(&resolved_node, ctx);

        let outcome = match node.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), attempt_fut).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::timeout(node.id.clone(), ms)),
            },
            None => attempt_fut.await,
        };

        match outcome {
            Ok(value) => {
                if attempts > 1 {
                    info!(node = node.id, attempts, "node succeeded after retry");
                }
                return (Ok(value), attempts);
            }
            Err(err) => {
                if attempts <= max_retries {
                    let policy = node.retry_policy.as_ref().unwrap();
                    let delay = policy.delay_for_attempt(attempts);
                    debug!(node = node.id, attempts, delay_ms = delay.as_millis() as u64, error = %err, "node failed, retrying");
                    events.emit_graph(GraphEvent::NodeRetry {
                        execution_id: execution_id.to_string(),
                        node_id: node.id.clone(),
                        attempt: attempts,
                    });
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return (Err(err), attempts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{NodeType, RetryPolicy};
    use crate::handlers::NullToolRegistry;
    use crate::value::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn task_node(id: &str, deps: &[&str]) -> NodeDefinition {
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
            variables: BTreeMap::new(),
        }
    }

    fn executor(graph: GraphDefinition, concurrency: usize) -> GraphExecutor {
        let handlers = Arc::new(HandlerRegistry::new(Arc::new(NullToolRegistry)));
        GraphExecutor::new(graph, handlers, Arc::new(EventBus::new()), concurrency)
    }

    #[tokio::test]
    async fn s1_diamond_runs_to_completion() {
        let g = graph(
            vec![
                task_node("A", &[]),
                task_node("B", &["A"]),
                task_node("C", &["A"]),
                NodeDefinition {
                    node_type: NodeType::Merge,
                    ..task_node("D", &["B", "C"])
                },
            ],
            &["A"],
        );
        let exec = executor(g, 2);
        let result = exec.run("e1", None).await;
        assert!(result.success);
        assert!(result.outputs.contains_key("D"));
    }

    #[tokio::test]
    async fn failed_node_without_continue_on_error_blocks_downstream() {
        let g = graph(
            vec![
                NodeDefinition {
                    node_type: NodeType::Condition,
                    config: Value::Map(BTreeMap::from([(
                        "condition".to_string(),
                        Value::Bool(false),
                    )])),
                    ..task_node("gate", &[])
                },
                task_node("after", &["gate"]),
            ],
            &["gate"],
        );
        let exec = executor(g, 2);
        let result = exec.run("e1", None).await;
        assert!(!result.success);
        let after = result.node_executions.iter().find(|n| n.node_id == "after").unwrap();
        assert_eq!(after.status, NodeStatus::Blocked);
    }

    #[tokio::test]
    async fn continue_on_error_lets_downstream_proceed() {
        let g = graph(
            vec![
                NodeDefinition {
                    node_type: NodeType::Condition,
                    config: Value::Map(BTreeMap::from([(
                        "condition".to_string(),
                        Value::Bool(false),
                    )])),
                    continue_on_error: true,
                    ..task_node("gate", &[])
                },
                task_node("after", &["gate"]),
            ],
            &["gate"],
        );
        let exec = executor(g, 2);
        let result = exec.run("e1", None).await;
        let after = result.node_executions.iter().find(|n| n.node_id == "after").unwrap();
        assert_eq!(after.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn retry_policy_is_honored_before_failing() {
        static ATTEMPTS: AtomicU32 = AtomicU32::new(0);

        struct FlakyRegistry;
        #[async_trait::async_trait]
        impl crate::handlers::ToolRegistry for FlakyRegistry {
            async fn execute(
                &self,
                _operation: &str,
                _config: &Value,
                _ctx: &crate::handlers::ToolContext,
            ) -> crate::error::Result<Value> {
                ATTEMPTS.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::handler_failure("flaky", "always fails"))
            }
            fn has_operation(&self, _operation: &str) -> bool {
                true
            }
        }

        let mut node = task_node("A", &[]);
        node.config = Value::Map(BTreeMap::from([(
            "operation".to_string(),
            Value::String("flaky_op".to_string()),
        )]));
        node.retry_policy = Some(RetryPolicy {
            max_retries: 2,
            backoff_ms: 1,
            exponential: false,
        });

        let handlers = Arc::new(HandlerRegistry::new(Arc::new(FlakyRegistry)));
        let exec = GraphExecutor::new(graph(vec![node], &["A"]), handlers, Arc::new(EventBus::new()), 1);
        let result = exec.run("e1", None).await;
        assert!(!result.success);
        assert_eq!(ATTEMPTS.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_concurrency_never_exceeds_limit() {
        static MAX_CONCURRENT: AtomicU32 = AtomicU32::new(0);
        static CURRENT: AtomicU32 = AtomicU32::new(0);

        struct TrackingRegistry;
        #[async_trait::async_trait]
        impl crate::handlers::ToolRegistry for TrackingRegistry {
            async fn execute(
                &self,
                _operation: &str,
                _config: &Value,
                _ctx: &crate::handlers::ToolContext,
            ) -> crate::error::Result<Value> {
                let now = CURRENT.fetch_add(1, Ordering::SeqCst) + 1;
                MAX_CONCURRENT.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                CURRENT.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
            fn has_operation(&self, _operation: &str) -> bool {
                true
            }
        }

        let mut nodes = Vec::new();
        for i in 0..6 {
            let mut n = task_node(&format!("n{i}"), &[]);
            n.config = Value::Map(BTreeMap::from([(
                "operation".to_string(),
                Value::String("op".to_string()),
            )]));
            nodes.push(n);
        }
        let entries: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let entries: Vec<&str> = entries.iter().map(|s| s.as_str()).collect();
        let handlers = Arc::new(HandlerRegistry::new(Arc::new(TrackingRegistry)));
        let exec = GraphExecutor::new(graph(nodes, &entries), handlers, Arc::new(EventBus::new()), 2);
        let result = exec.run("e1", None).await;
        assert!(result.success);
        assert!(MAX_CONCURRENT.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn outer_timeout_marks_unresolved_nodes_skipped() {
        struct SlowRegistry;
        #[async_trait::async_trait]
        impl crate::handlers::ToolRegistry for SlowRegistry {
            async fn execute(
                &self,
                _operation: &str,
                _config: &Value,
                _ctx: &crate::handlers::ToolContext,
            ) -> crate::error::Result<Value> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Value::Null)
            }
            fn has_operation(&self, _operation: &str) -> bool {
                true
            }
        }

        let mut node = task_node("A", &[]);
        node.config = Value::Map(BTreeMap::from([(
            "operation".to_string(),
            Value::String("slow".to_string()),
        )]));
        let handlers = Arc::new(HandlerRegistry::new(Arc::new(SlowRegistry)));
        let exec = GraphExecutor::new(graph(vec![node], &["A"]), handlers, Arc::new(EventBus::new()), 1);
        let result = exec.run("e1", Some(Duration::from_millis(20))).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }
}
