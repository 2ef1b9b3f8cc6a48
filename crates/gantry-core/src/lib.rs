//! # Gantry Core
//!
//! Canonical data model shared by every Gantry component, plus the two
//! append-only structures the rest of the system hangs off:
//!
//! - the [`EventLog`], an ordered multi-consumer stream of conditioned
//!   device events with consumer-group offsets
//! - the [`AuditTrail`], the append-only record of every cross-boundary
//!   message and security violation
//!
//! Types here are deliberately free of any execution machinery: sources,
//! conditioning, validation, and the plugin runtime all live in their own
//! crates and communicate through these shapes.

pub mod audit;
pub mod error;
pub mod event;
pub mod log;
pub mod permissions;
pub mod policy;
pub mod state;
pub mod violation;

pub use audit::{AuditRecord, AuditTrail, AuditWriter, MessageDirection};
pub use error::{CoreError, Result};
pub use event::{ConditionedEvent, DeviceEvent, DeviceEventKind, EventSignature, SourceId};
pub use log::{Consumer, EventLog, EventLogConfig, LogStats};
pub use permissions::{CompiledGrants, PermissionCategory, PermissionGrants};
pub use policy::{ResourcePolicy, ResourceUsage, SecurityLevel};
pub use state::LifecycleState;
pub use violation::{SecurityViolation, Severity, ViolationKind};

/// Identifier for a validated plugin (manifest-level identity).
pub type PluginId = String;

/// Identifier for one running instance of a plugin.
///
/// A blocked instance is never resumed; reloading the same plugin yields a
/// fresh `InstanceId`.
pub type InstanceId = uuid::Uuid;
