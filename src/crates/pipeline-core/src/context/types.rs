//! Wire types for the Shared Context Store (component C, §3 "Shared Context").

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::value::Value;

pub type AgentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Global,
    Pipeline,
    Private,
    Shared,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Private
    }
}

/// A stored value plus its visibility and lifecycle bookkeeping.
/// `updated_at`/`ttl` use `Instant`/`Duration` rather than wall-clock so
/// expiry math is immune to clock adjustment, matching the bus's envelope
/// convention.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
    pub scope: Scope,
    pub owner_id: AgentId,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub version: u64,
    pub ttl: Option<Duration>,
    pub metadata: BTreeMap<String, Value>,
}

impl ContextEntry {
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => Instant::now() >= self.updated_at + ttl,
            None => false,
        }
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        match self.metadata.get("pipelineId") {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub scope: Option<Scope>,
    pub owner_id: Option<AgentId>,
    pub prefix: Option<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_entries: usize,
    pub max_scan_iterations: usize,
    pub versioning: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_scan_iterations: 10_000,
            versioning: true,
        }
    }
}
