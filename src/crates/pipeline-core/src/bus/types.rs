//! Wire types for the Message Bus (component B, §3 "Messaging").

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::Value;

pub type AgentId = String;
pub type CorrelationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Broadcast,
    Error,
}

/// `None` recipient on a draft means "broadcast to every other registered
/// agent"; the bus expands that into one `Recipient::One` message per
/// target before it ever reaches a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Recipient {
    One(AgentId),
    Many(Vec<AgentId>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub from: AgentId,
    pub to: Recipient,
    pub payload: Value,
    pub priority: Priority,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
    pub ttl_ms: Option<u64>,
    pub metadata: BTreeMap<String, Value>,
}

/// What a caller supplies to [`crate::bus::MessageBus::send`]; the bus
/// stamps `id` and `timestamp` itself so callers never forge either.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub message_type: MessageType,
    pub from: AgentId,
    pub to: Recipient,
    pub payload: Value,
    pub priority: Priority,
    pub correlation_id: Option<CorrelationId>,
    pub ttl_ms: Option<u64>,
    pub metadata: BTreeMap<String, Value>,
}

impl MessageDraft {
    pub fn new(from: impl Into<AgentId>, to: AgentId, payload: Value) -> Self {
        Self {
            message_type: MessageType::Notification,
            from: from.into(),
            to: Recipient::One(to),
            payload,
            priority: Priority::Normal,
            correlation_id: None,
            ttl_ms: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// A queued message plus its delivery bookkeeping. `enqueued_at` and
/// `expires_at` use `Instant` (not `Message.timestamp`) because latency and
/// expiry math must be monotonic, immune to wall-clock adjustment.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    pub enqueued_at: Instant,
    pub expires_at: Instant,
    pub retries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BusMetrics {
    pub registered_agents: usize,
    pub total_queued: usize,
    pub pending_requests: usize,
}
