//! Core error types.

use thiserror::Error;

/// Errors produced by the core data structures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The event log sink could not be written.
    #[error("event log sink failure: {0}")]
    Sink(#[from] std::io::Error),

    /// An append was refused because retention is exhausted and a consumer
    /// group still holds an offset inside the would-be-evicted range.
    #[error("event log retention exhausted (capacity {capacity}, slowest group at offset {slowest})")]
    RetentionExhausted { capacity: usize, slowest: u64 },

    /// A consumer group name was not registered before use.
    #[error("unknown consumer group: {0}")]
    UnknownGroup(String),

    /// A commit tried to move a group offset backwards.
    #[error("commit for group '{group}' would move offset backwards ({committed} -> {requested})")]
    CommitRegression {
        group: String,
        committed: u64,
        requested: u64,
    },

    /// An illegal lifecycle transition was requested.
    #[error("illegal lifecycle transition: {from} -> {to}")]
    IllegalTransition {
        from: crate::state::LifecycleState,
        to: crate::state::LifecycleState,
    },

    /// The audit writer task is gone; records can no longer be appended.
    #[error("audit trail closed")]
    AuditClosed,

    /// A permission grant entry could not be compiled into a matcher.
    #[error("invalid permission entry '{entry}': {reason}")]
    InvalidPermission { entry: String, reason: String },
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
