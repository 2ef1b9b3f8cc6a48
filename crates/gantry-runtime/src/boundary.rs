//! The security boundary: validate, filter, audit.
//!
//! Every message between a worker and the host passes through here exactly
//! once. The boundary never repairs a message: too large, malformed, or
//! outside declared permissions means rejected whole, with the refusal
//! itself audited. In strict mode a malformed message additionally raises a
//! [`SecurityViolation`]; outside strict mode it is dropped with a counter.

use crate::devices::DeviceTable;
use crate::messages::{HostCall, HostCallResult, WorkerMessage, WorkerRequest};
use gantry_core::{
    AuditRecord, AuditTrail, CompiledGrants, MessageDirection, PermissionGrants, ResourcePolicy,
    SecurityViolation, Severity, ViolationKind,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of screening one message.
#[derive(Debug)]
pub enum BoundaryVerdict {
    Accepted,
    Rejected {
        reason: String,
        /// Present when the refusal is itself a security signal.
        violation: Option<SecurityViolation>,
    },
}

impl BoundaryVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Per-instance boundary, compiled from the instance's declared permissions
/// and resource policy at load time.
pub struct SecurityBoundary {
    plugin_id: String,
    grants: CompiledGrants,
    max_message_bytes: usize,
    strict: bool,
    audit: AuditTrail,
}

impl SecurityBoundary {
    pub fn new(
        plugin_id: impl Into<String>,
        grants: &PermissionGrants,
        policy: &ResourcePolicy,
        strict: bool,
        audit: AuditTrail,
    ) -> gantry_core::Result<Self> {
        Ok(Self {
            plugin_id: plugin_id.into(),
            grants: grants.compile()?,
            max_message_bytes: policy.max_message_bytes,
            strict,
            audit,
        })
    }

    /// Should this device event be delivered to this plugin at all?
    ///
    /// Event delivery is a permission like any other: only devices covered
    /// by the declared usb filters are visible. No filter, no events.
    pub fn allows_event(&self, vendor_id: u16, product_id: u16) -> bool {
        self.grants.allows_device(vendor_id, product_id)
    }

    /// Screen a host-to-worker request.
    pub fn screen_outbound(&self, request: &WorkerRequest) -> BoundaryVerdict {
        let bytes = serialized_size(request);
        if bytes > self.max_message_bytes {
            return self.reject_oversized(MessageDirection::Outbound, request.kind(), bytes);
        }
        self.audit_message(MessageDirection::Outbound, request.kind(), bytes, true, None);
        BoundaryVerdict::Accepted
    }

    /// Screen a worker-to-host message.
    pub fn screen_inbound(&self, message: &WorkerMessage) -> BoundaryVerdict {
        let bytes = serialized_size(message);
        if bytes > self.max_message_bytes {
            return self.reject_oversized(MessageDirection::Inbound, message.kind(), bytes);
        }

        if let Some(malformed) = self.shape_problem(message) {
            metrics::counter!("gantry_boundary_malformed_total").increment(1);
            let violation = self.strict.then(|| {
                SecurityViolation::new(
                    self.plugin_id.clone(),
                    ViolationKind::MalformedMessage,
                    Severity::Medium,
                    malformed.clone(),
                )
            });
            self.audit_message(
                MessageDirection::Inbound,
                message.kind(),
                bytes,
                false,
                Some(malformed.clone()),
            );
            return BoundaryVerdict::Rejected {
                reason: malformed,
                violation,
            };
        }

        if let WorkerMessage::HostCall { call } = message {
            if let Some(denial) = self.permission_problem(call) {
                metrics::counter!("gantry_boundary_denied_total").increment(1);
                self.audit_message(
                    MessageDirection::Inbound,
                    message.kind(),
                    bytes,
                    false,
                    Some(denial.clone()),
                );
                return BoundaryVerdict::Rejected {
                    reason: denial.clone(),
                    violation: Some(SecurityViolation::new(
                        self.plugin_id.clone(),
                        ViolationKind::PermissionDenied,
                        Severity::Medium,
                        denial,
                    )),
                };
            }
        }

        self.audit_message(MessageDirection::Inbound, message.kind(), bytes, true, None);
        BoundaryVerdict::Accepted
    }

    /// Execute a host call that already passed [`Self::screen_inbound`].
    pub async fn execute_host_call(&self, call: HostCall, devices: &DeviceTable) -> HostCallResult {
        match call {
            HostCall::FsRead { path } => match tokio::fs::read_to_string(&path).await {
                Ok(contents) if contents.len() > self.max_message_bytes => {
                    HostCallResult::Failed {
                        reason: format!(
                            "file is {} bytes, reply ceiling is {}",
                            contents.len(),
                            self.max_message_bytes
                        ),
                    }
                }
                Ok(contents) => HostCallResult::Ok {
                    value: serde_json::Value::String(contents),
                },
                Err(e) => HostCallResult::Failed {
                    reason: e.to_string(),
                },
            },
            HostCall::FsWrite { path, contents } => {
                match tokio::fs::write(&path, contents.as_bytes()).await {
                    Ok(()) => HostCallResult::Ok {
                        value: serde_json::json!({ "written": contents.len() }),
                    },
                    Err(e) => HostCallResult::Failed {
                        reason: e.to_string(),
                    },
                }
            }
            HostCall::NetProbe { host, port } => {
                let started = Instant::now();
                match tokio::time::timeout(
                    Duration::from_secs(2),
                    tokio::net::TcpStream::connect((host.as_str(), port)),
                )
                .await
                {
                    Ok(Ok(_stream)) => HostCallResult::Ok {
                        value: serde_json::json!({
                            "reachable": true,
                            "latency_ms": started.elapsed().as_millis() as u64,
                        }),
                    },
                    Ok(Err(e)) => HostCallResult::Ok {
                        value: serde_json::json!({ "reachable": false, "error": e.to_string() }),
                    },
                    Err(_) => HostCallResult::Ok {
                        value: serde_json::json!({ "reachable": false, "error": "timeout" }),
                    },
                }
            }
            HostCall::ListDevices => {
                let matching = devices.matching(|v, p| self.grants.allows_device(v, p));
                match serde_json::to_value(matching) {
                    Ok(value) => HostCallResult::Ok { value },
                    Err(e) => HostCallResult::Failed {
                        reason: e.to_string(),
                    },
                }
            }
            HostCall::SystemInfo { facility } => self.system_info(&facility),
        }
    }

    fn system_info(&self, facility: &str) -> HostCallResult {
        let value = match facility {
            "clock" => serde_json::json!(chrono::Utc::now().to_rfc3339()),
            "hostname" => match hostname::get() {
                Ok(name) => serde_json::json!(name.to_string_lossy()),
                Err(e) => {
                    return HostCallResult::Failed {
                        reason: e.to_string(),
                    }
                }
            },
            "os_release" => serde_json::json!(std::env::consts::OS),
            "uptime" => match std::fs::read_to_string("/proc/uptime") {
                Ok(contents) => {
                    let seconds = contents
                        .split_whitespace()
                        .next()
                        .and_then(|s| s.parse::<f64>().ok())
                        .unwrap_or(0.0);
                    serde_json::json!(seconds)
                }
                Err(e) => {
                    return HostCallResult::Failed {
                        reason: e.to_string(),
                    }
                }
            },
            other => {
                // Screening admits only declared facilities; reaching here
                // with something else is a host bug, answer it anyway.
                return HostCallResult::Failed {
                    reason: format!("unknown facility '{other}'"),
                };
            }
        };
        HostCallResult::Ok { value }
    }

    /// Structural problems that make a message malformed regardless of
    /// permissions.
    fn shape_problem(&self, message: &WorkerMessage) -> Option<String> {
        match message {
            WorkerMessage::HostCall { call } => match call {
                HostCall::FsRead { path } | HostCall::FsWrite { path, .. } => {
                    if !path.is_absolute() {
                        return Some(format!("path '{}' is not absolute", path.display()));
                    }
                    if path_escapes(path) {
                        return Some(format!("path '{}' contains parent traversal", path.display()));
                    }
                    None
                }
                HostCall::NetProbe { host, port } => {
                    if host.trim().is_empty() || host.contains('/') || host.contains(' ') {
                        return Some(format!("'{host}' is not a host name"));
                    }
                    if *port == 0 {
                        return Some("port 0 is not connectable".to_string());
                    }
                    None
                }
                HostCall::SystemInfo { facility } => {
                    if facility.trim().is_empty() {
                        return Some("empty system facility".to_string());
                    }
                    None
                }
                HostCall::ListDevices => None,
            },
            WorkerMessage::Log { message } => {
                if message.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
                    return Some("log message contains control characters".to_string());
                }
                None
            }
            _ => None,
        }
    }

    /// Permission problems for a structurally valid host call.
    fn permission_problem(&self, call: &HostCall) -> Option<String> {
        match call {
            HostCall::FsRead { path } | HostCall::FsWrite { path, .. } => {
                if !self.grants.allows_path(path) {
                    return Some(format!(
                        "filesystem access to '{}' is outside declared roots",
                        path.display()
                    ));
                }
                None
            }
            HostCall::NetProbe { host, .. } => {
                if !self.grants.allows_host(host) {
                    return Some(format!("network access to '{host}' is not declared"));
                }
                None
            }
            HostCall::ListDevices => None,
            HostCall::SystemInfo { facility } => {
                if !self.grants.allows_system(facility) {
                    return Some(format!("system facility '{facility}' is not declared"));
                }
                None
            }
        }
    }

    fn reject_oversized(
        &self,
        direction: MessageDirection,
        kind: &str,
        bytes: usize,
    ) -> BoundaryVerdict {
        let reason = format!(
            "message is {bytes} bytes, ceiling is {}",
            self.max_message_bytes
        );
        warn!(plugin = %self.plugin_id, kind, "oversized message rejected");
        metrics::counter!("gantry_boundary_oversized_total").increment(1);
        self.audit_message(direction, kind, bytes, false, Some(reason.clone()));
        BoundaryVerdict::Rejected {
            reason: reason.clone(),
            violation: Some(SecurityViolation::new(
                self.plugin_id.clone(),
                ViolationKind::OversizedMessage,
                Severity::Medium,
                reason,
            )),
        }
    }

    fn audit_message(
        &self,
        direction: MessageDirection,
        kind: &str,
        bytes: usize,
        accepted: bool,
        reason: Option<String>,
    ) {
        if let Err(e) = self.audit.record(AuditRecord::message(
            self.plugin_id.clone(),
            direction,
            kind,
            bytes,
            accepted,
            reason,
        )) {
            debug!("audit append failed during shutdown: {e}");
        }
    }
}

fn serialized_size<T: serde::Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn path_escapes(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}
