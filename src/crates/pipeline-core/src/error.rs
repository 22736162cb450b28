//! Error taxonomy shared by every subsystem.
//!
//! One enum rather than one error type per module: handlers, the bus, and
//! the context store all need to cross the same boundary (back to the
//! scheduler, or out to a remote peer), so they share a currency.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("access denied: agent '{requester}' may not {action} '{key}'")]
    AccessDenied {
        requester: String,
        action: &'static str,
        key: String,
    },

    #[error("{what} is full (capacity {capacity})")]
    Overflow { what: &'static str, capacity: usize },

    #[error("{what} is locked, try again")]
    Busy { what: &'static str },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("handler for node '{node}' failed: {message}")]
    HandlerFailure { node: String, message: String },

    #[error("condition failed: {condition} evaluated to false")]
    ConditionFailed {
        condition: String,
        evaluated: String,
    },

    #[error("cycle detected in graph involving node '{0}'")]
    CycleDetected(String),

    #[error("{what} has shut down")]
    Shutdown { what: &'static str },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn access_denied(
        requester: impl Into<String>,
        action: &'static str,
        key: impl Into<String>,
    ) -> Self {
        PipelineError::AccessDenied {
            requester: requester.into(),
            action,
            key: key.into(),
        }
    }

    pub fn overflow(what: &'static str, capacity: usize) -> Self {
        PipelineError::Overflow { what, capacity }
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        PipelineError::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn handler_failure(node: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::HandlerFailure {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Classification used by retry/propagation logic so callers don't have
    /// to match on every variant to decide whether a failure is worth
    /// retrying.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::AccessDenied { .. } => ErrorKind::AccessDenied,
            PipelineError::Overflow { .. } | PipelineError::Busy { .. } => ErrorKind::BusyOverflow,
            PipelineError::RateLimited(_) => ErrorKind::RateLimited,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::HandlerFailure { .. } => ErrorKind::HandlerFailure,
            PipelineError::ConditionFailed { .. } => ErrorKind::ConditionFailed,
            PipelineError::CycleDetected(_) => ErrorKind::CycleDetected,
            PipelineError::Shutdown { .. } => ErrorKind::Shutdown,
            PipelineError::Serialization(_) => ErrorKind::Validation,
        }
    }

    /// True for kinds a caller may reasonably retry locally (Busy, Timeout,
    /// RateLimited) per the propagation policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BusyOverflow | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }

    /// Strip internal detail before handing an error to a remote peer (bus
    /// ERROR responses MUST NOT carry stack-style detail).
    pub fn to_wire_message(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AccessDenied,
    BusyOverflow,
    RateLimited,
    Timeout,
    HandlerFailure,
    ConditionFailed,
    CycleDetected,
    Shutdown,
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PipelineError::Timeout {
            operation: "operation".to_string(),
            duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds_are_busy_timeout_and_rate_limited() {
        assert!(PipelineError::overflow("queue", 10).is_recoverable());
        assert!(PipelineError::timeout("op", 5).is_recoverable());
        assert!(PipelineError::RateLimited("x".into()).is_recoverable());
        assert!(!PipelineError::validation("bad").is_recoverable());
        assert!(!PipelineError::CycleDetected("a".into()).is_recoverable());
    }

    #[test]
    fn wire_message_strips_nothing_more_than_display() {
        let err = PipelineError::handler_failure("n1", "boom at /secret/path");
        assert_eq!(err.to_wire_message(), err.to_string());
    }
}
