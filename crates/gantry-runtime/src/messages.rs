//! The host/worker message vocabulary.
//!
//! Everything that crosses the security boundary is one of these shapes.
//! The host never calls into plugin code; plugins never see host memory.
//! Requests flow host-to-worker, messages flow worker-to-host, and host-call
//! results answer a worker's blocking request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host-to-worker request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Deliver one conditioned device event.
    DeliverEvent {
        sequence: u64,
        payload: serde_json::Value,
    },
    /// Cooperative shutdown: run `on_stop` if defined, then exit.
    Shutdown,
}

/// Worker-to-host message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// VM primed, entry point loaded.
    Ready,

    /// The entry point failed while the VM was being primed.
    InitFailed { reason: String },

    /// An event handler returned successfully.
    EventHandled { sequence: u64, usage: WorkerUsage },

    /// An event handler raised an error.
    EventFailed {
        sequence: u64,
        error: String,
        usage: WorkerUsage,
    },

    /// The plugin wants the host to do something on its behalf. The worker
    /// thread blocks on the reply channel until a [`HostCallResult`] lands.
    HostCall { call: HostCall },

    /// A log line from plugin code.
    Log { message: String },

    /// Cooperative shutdown acknowledged; the worker is about to exit.
    ShuttingDown,
}

/// Resource self-report attached to every handled operation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerUsage {
    /// Lua heap bytes currently allocated.
    pub heap_bytes: u64,
    /// Cumulative busy time executing plugin code, nanoseconds.
    pub busy_ns: u64,
    /// Operations handled since the worker was spawned.
    pub ops_handled: u64,
}

/// A host facility request; each variant maps to one permission category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum HostCall {
    /// Read a file under a declared filesystem root.
    FsRead { path: PathBuf },

    /// Write a file under a declared filesystem root.
    FsWrite { path: PathBuf, contents: String },

    /// TCP reachability probe against a declared network host.
    NetProbe { host: String, port: u16 },

    /// Attached devices matching the plugin's declared usb filters.
    ListDevices,

    /// One of the recognized system facilities.
    SystemInfo { facility: String },
}

impl HostCall {
    /// Label used in audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FsRead { .. } => "fs_read",
            Self::FsWrite { .. } => "fs_write",
            Self::NetProbe { .. } => "net_probe",
            Self::ListDevices => "list_devices",
            Self::SystemInfo { .. } => "system_info",
        }
    }
}

/// Answer to a [`HostCall`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HostCallResult {
    Ok { value: serde_json::Value },
    /// Refused by the boundary; carries the reason shown to the plugin.
    Denied { reason: String },
    /// Permitted but failed while executing.
    Failed { reason: String },
}

impl WorkerMessage {
    /// Label used in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::InitFailed { .. } => "init_failed",
            Self::EventHandled { .. } => "event_handled",
            Self::EventFailed { .. } => "event_failed",
            Self::HostCall { call } => call.kind(),
            Self::Log { .. } => "log",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl WorkerRequest {
    /// Label used in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeliverEvent { .. } => "deliver_event",
            Self::Shutdown => "shutdown",
        }
    }
}
