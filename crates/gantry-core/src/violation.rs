//! Security violation records.

use crate::PluginId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of breach occurred.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Measured usage exceeded the instance's resource policy.
    ResourceBreach,
    /// A boundary message requested something outside declared permissions.
    PermissionDenied,
    /// A boundary message failed schema validation.
    MalformedMessage,
    /// A boundary message exceeded the policy's size ceiling.
    OversizedMessage,
    /// Rolling behavioral counters crossed a configured threshold.
    BehavioralAnomaly,
    /// The worker broke the host protocol (unexpected reply, early exit).
    ProtocolError,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceBreach => "resource_breach",
            Self::PermissionDenied => "permission_denied",
            Self::MalformedMessage => "malformed_message",
            Self::OversizedMessage => "oversized_message",
            Self::BehavioralAnomaly => "behavioral_anomaly",
            Self::ProtocolError => "protocol_error",
        }
    }
}

/// How bad it is. Ordering matters: escalation thresholds compare severities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// An immutable audit record of a policy or behavioral breach.
///
/// Violations are only ever appended and aggregated; nothing edits one after
/// the fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityViolation {
    pub plugin_id: PluginId,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl SecurityViolation {
    pub fn new(
        plugin_id: impl Into<PluginId>,
        kind: ViolationKind,
        severity: Severity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            kind,
            severity,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }

    /// Severe enough to demand containment on its own.
    pub fn demands_blocking(&self) -> bool {
        self.severity >= Severity::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn blocking_threshold() {
        let soft = SecurityViolation::new("p", ViolationKind::ResourceBreach, Severity::Low, "soft");
        assert!(!soft.demands_blocking());

        let hard =
            SecurityViolation::new("p", ViolationKind::ResourceBreach, Severity::High, "hard");
        assert!(hard.demands_blocking());
    }

    #[test]
    fn violation_serializes_with_snake_case_kind() {
        let v = SecurityViolation::new(
            "usb-logger",
            ViolationKind::PermissionDenied,
            Severity::Medium,
            "fs write outside declared roots",
        );
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"permission_denied\""));
        assert!(json.contains("\"medium\""));
    }
}
