//! # Gantry Plugin Runtime
//!
//! Executes validated, untrusted plugin code under enforcement:
//!
//! - [`pool`] spawns one Lua VM per instance on a dedicated thread, heap
//!   ceiling and interrupt hook armed, behind bounded load semantics
//! - [`boundary`] is the only channel between a worker and the host: every
//!   message is size-checked, shape-checked, permission-checked, and audited
//! - [`enforcer`] compares measured usage against each instance's policy and
//!   escalates soft breaches to throttling, hard breaches to containment
//! - [`monitor`] watches rolling behavioral counters and escalates anomalies
//!   independently of the resource path
//! - [`lifecycle`] is the single writer for all instance state; every other
//!   component talks to it through commands, never shared mutation
//!
//! The blast radius of a misbehaving plugin is its own instance: throttling,
//! blocking, and recycling are all per-instance operations.

pub mod boundary;
pub mod devices;
pub mod enforcer;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod monitor;
pub mod pool;
pub mod worker;

pub use boundary::{BoundaryVerdict, SecurityBoundary};
pub use devices::DeviceTable;
pub use enforcer::{EnforcerBook, ResourceEnforcer};
pub use error::{LoadError, Result, RuntimeError, StopOutcome};
pub use lifecycle::{Command, InstanceStatus, LifecycleHandle, LifecycleManager, RuntimeSettings};
pub use messages::{HostCall, HostCallResult, WorkerMessage, WorkerRequest, WorkerUsage};
pub use monitor::{BehaviorThresholds, SecurityMonitor};
pub use pool::{LoadedWorker, WorkerPool};
pub use worker::{WorkerConfig, WorkerHandle};
