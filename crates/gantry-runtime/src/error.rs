//! Runtime error types.

use gantry_core::InstanceId;
use serde::Serialize;
use thiserror::Error;

/// Why a plugin could not be loaded into a worker.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum LoadError {
    /// No worker slot became free within the load timeout.
    #[error("timed out waiting for a worker slot")]
    Timeout,

    /// The package failed validation (surfaced when a caller skips the
    /// registry and loads directly).
    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    /// The pool is at capacity and not accepting queued loads.
    #[error("no worker available")]
    WorkerUnavailable,

    /// The entry point errored while the VM was being primed.
    #[error("entry point crashed during load: {reason}")]
    EntryPointCrash { reason: String },
}

/// Definite outcome of a stop request. Callers never hang: one of these
/// always comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The worker exited within its grace period.
    StoppedGracefully,
    /// The grace period lapsed and the worker was force-killed.
    ForceKilled,
}

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("instance {instance} is {state}, which does not admit this operation")]
    WrongState {
        instance: InstanceId,
        state: gantry_core::LifecycleState,
    },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("lifecycle manager is shut down")]
    ManagerGone,

    #[error(transparent)]
    Core(#[from] gantry_core::CoreError),

    #[error("worker io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
