//! Resource policies and security levels.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How much slack an instance gets, chosen at load time.
///
/// The level is immutable for the instance's lifetime; a policy reload only
/// affects instances loaded afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown security level '{other}'")),
        }
    }
}

/// Enforced ceilings bound to a security level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePolicy {
    /// Lua heap ceiling for the worker VM.
    pub max_heap_bytes: u64,

    /// CPU busy-time ceiling over a monitoring cycle, 0.0..=100.0.
    pub max_cpu_percent: f64,

    /// Largest serialized message the boundary will carry.
    pub max_message_bytes: usize,

    /// How long a hard violator gets to exit voluntarily before force-kill.
    #[serde(with = "duration_millis")]
    pub grace_period: Duration,
}

impl ResourcePolicy {
    /// Default ceilings for a security level. `High` security means the
    /// tightest limits, not the most generous ones.
    pub fn for_level(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Low => Self {
                max_heap_bytes: 256 * 1024 * 1024,
                max_cpu_percent: 75.0,
                max_message_bytes: 1024 * 1024,
                grace_period: Duration::from_secs(10),
            },
            SecurityLevel::Medium => Self {
                max_heap_bytes: 64 * 1024 * 1024,
                max_cpu_percent: 50.0,
                max_message_bytes: 256 * 1024,
                grace_period: Duration::from_secs(5),
            },
            SecurityLevel::High => Self {
                max_heap_bytes: 16 * 1024 * 1024,
                max_cpu_percent: 25.0,
                max_message_bytes: 64 * 1024,
                grace_period: Duration::from_secs(2),
            },
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A point-in-time measurement of what an instance is consuming.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    /// Lua heap bytes currently allocated.
    pub heap_bytes: u64,

    /// CPU busy percentage over the last monitoring cycle.
    pub cpu_percent: f64,

    /// Operations handled since the worker was (re)spawned.
    pub ops_handled: u64,
}

impl ResourceUsage {
    /// True when usage exceeds the policy on any enforced axis.
    pub fn breaches(&self, policy: &ResourcePolicy) -> bool {
        self.heap_bytes > policy.max_heap_bytes || self.cpu_percent > policy.max_cpu_percent
    }
}
