//! Typed event channels for each subsystem.
//!
//! Each subsystem owns a `tokio::sync::broadcast` sender of its own event
//! enum. Consumers subscribe by variant match rather than registering
//! dynamic listener callbacks, so a subscriber that only cares about
//! `NodeEvent::Failed` still has to match the whole enum -- that's the
//! point: no untyped payload dictionaries.

use tokio::sync::broadcast;

use crate::graph::types::{NodeExecution, NodeId};
use crate::value::Value;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum GraphEvent {
    ExecutionStarted { execution_id: String, graph_id: String },
    ExecutionCompleted { execution_id: String, duration_ms: u64 },
    ExecutionFailed { execution_id: String, error: String },
    NodeStarted { execution_id: String, node_id: NodeId },
    NodeCompleted { execution_id: String, node: NodeExecution },
    NodeFailed { execution_id: String, node: NodeExecution },
    NodeRetry { execution_id: String, node_id: NodeId, attempt: u32 },
    NodeBlocked { execution_id: String, node_id: NodeId },
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    AgentRegistered { agent_id: String },
    MessageSent { message_id: String, to: String },
    MessageDelivered { message_id: String, to: String, latency_ms: u64 },
    MessageFailed { message_id: String, to: String, error: String },
    MessageRetry { message_id: String, to: String, attempt: u32 },
    MessageExpired { message_id: String, to: String },
    MessageBroadcast { message_id: String, recipients: usize },
}

#[derive(Debug, Clone)]
pub enum ContextEvent {
    Set { key: String, owner_id: String },
    Get { key: String, requester_id: String },
    Deleted { key: String },
    Shared { key: String, agent_ids: Vec<String> },
    Expired { key: String },
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    PipelineStarted { execution_id: String },
    PipelineCompleted { execution_id: String },
    PipelineFailed { execution_id: String, error: String },
    BottleneckDetected { execution_id: String, node_id: NodeId, reason: String },
}

#[derive(Debug, Clone)]
pub enum SloEvent {
    Violation {
        slo_name: String,
        actual: f64,
        target: f64,
        severity: crate::slo::Severity,
    },
    Regression {
        metric: String,
        change: f64,
        severity: crate::slo::Severity,
    },
}

/// `Value` never appears directly on an event above; payload-carrying
/// events stay deliberately thin so a subscriber can log/route on the enum
/// alone. A full payload, when needed, is fetched back through the owning
/// subsystem (e.g. `ExecutionResult::outputs`) keyed by the ids the event
/// carries. This type alias documents that choice for readers skimming the
/// module.
pub type EventPayload = Value;

/// One broadcast sender per subsystem, created fresh per [`crate::runtime::Runtime`].
pub struct EventBus {
    pub graph: broadcast::Sender<GraphEvent>,
    pub bus: broadcast::Sender<BusEvent>,
    pub context: broadcast::Sender<ContextEvent>,
    pub monitor: broadcast::Sender<MonitorEvent>,
    pub slo: broadcast::Sender<SloEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            graph: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            bus: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            context: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            monitor: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            slo: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
        }
    }

    /// Broadcast sends are best-effort: a subsystem with no subscribers is
    /// the common case in tests, and `broadcast::Sender::send` returning
    /// `Err` just means nobody is listening right now.
    pub fn emit_graph(&self, event: GraphEvent) {
        let _ = self.graph.send(event);
    }

    pub fn emit_bus(&self, event: BusEvent) {
        let _ = self.bus.send(event);
    }

    pub fn emit_context(&self, event: ContextEvent) {
        let _ = self.context.send(event);
    }

    pub fn emit_monitor(&self, event: MonitorEvent) {
        let _ = self.monitor.send(event);
    }

    pub fn emit_slo(&self, event: SloEvent) {
        let _ = self.slo.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
