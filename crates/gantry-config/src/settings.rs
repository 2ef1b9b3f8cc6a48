//! Configuration schema with serde defaults and validation.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GantryConfig {
    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl GantryConfig {
    /// Check cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.events.debounce_window_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "events.debounce_window_ms",
                reason: "debounce window must be positive".into(),
            });
        }
        if self.events.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "events.queue_capacity",
                reason: "queue capacity must be positive".into(),
            });
        }
        if self.events.rate_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "events.rate_capacity",
                reason: "rate capacity must be positive".into(),
            });
        }
        if self.events.batch_max_size == 0 {
            return Err(ConfigError::Invalid {
                field: "events.batch_max_size",
                reason: "batch size must be positive".into(),
            });
        }
        if self.runtime.pool_min > self.runtime.pool_max {
            return Err(ConfigError::Invalid {
                field: "runtime.pool_min",
                reason: format!(
                    "pool_min ({}) exceeds pool_max ({})",
                    self.runtime.pool_min, self.runtime.pool_max
                ),
            });
        }
        if self.runtime.pool_max == 0 {
            return Err(ConfigError::Invalid {
                field: "runtime.pool_max",
                reason: "worker pool must allow at least one worker".into(),
            });
        }
        if self.plugins.parse_level().is_none() {
            return Err(ConfigError::Invalid {
                field: "plugins.security_level",
                reason: format!(
                    "unknown security level '{}' (expected low, medium, or high)",
                    self.plugins.security_level
                ),
            });
        }
        if self.plugins.require_signature && self.plugins.trusted_keys.is_empty() {
            return Err(ConfigError::Invalid {
                field: "plugins.trusted_keys",
                reason: "require_signature is set but no trusted keys are configured".into(),
            });
        }
        if self.log.retention == 0 {
            return Err(ConfigError::Invalid {
                field: "log.retention",
                reason: "event log retention must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Event pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    /// Debounce window for signature dedup and flap suppression.
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,

    /// Token-bucket capacity for the inbound rate ceiling.
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,

    /// Refill interval for one token.
    #[serde(default = "default_rate_interval_ms")]
    pub rate_interval_ms: u64,

    /// Bounded queue between conditioner and log publisher.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Flush a batch at this many events even mid-window.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Poll interval for the snapshot-diff source.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory the devfs source watches for device nodes.
    #[serde(default = "default_device_dir")]
    pub device_dir: PathBuf,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: default_debounce_window_ms(),
            rate_capacity: default_rate_capacity(),
            rate_interval_ms: default_rate_interval_ms(),
            queue_capacity: default_queue_capacity(),
            batch_max_size: default_batch_max_size(),
            poll_interval_ms: default_poll_interval_ms(),
            device_dir: default_device_dir(),
        }
    }
}

fn default_debounce_window_ms() -> u64 {
    50
}
fn default_rate_capacity() -> u32 {
    256
}
fn default_rate_interval_ms() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_batch_max_size() -> usize {
    64
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_device_dir() -> PathBuf {
    PathBuf::from("/dev/bus/usb")
}

/// Plugin discovery and validation policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Directories scanned for plugin packages.
    #[serde(default = "default_plugin_dirs")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Refuse unsigned packages.
    #[serde(default)]
    pub require_signature: bool,

    /// Base64 ed25519 public keys accepted as package signers.
    #[serde(default)]
    pub trusted_keys: Vec<String>,

    /// Security level applied to newly loaded instances.
    #[serde(default = "default_security_level")]
    pub security_level: String,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            plugin_dirs: default_plugin_dirs(),
            require_signature: false,
            trusted_keys: Vec::new(),
            security_level: default_security_level(),
        }
    }
}

impl PluginsConfig {
    /// The level string checked against the recognized set. Kept as a string
    /// here so this crate stays independent of gantry-core.
    pub(crate) fn parse_level(&self) -> Option<&'static str> {
        match self.security_level.as_str() {
            "low" => Some("low"),
            "medium" => Some("medium"),
            "high" => Some("high"),
            _ => None,
        }
    }

    pub fn level_is_known(&self) -> bool {
        self.parse_level().is_some()
    }
}

fn default_plugin_dirs() -> Vec<PathBuf> {
    let mut dirs_list = vec![PathBuf::from("/usr/lib/gantry/plugins")];
    if let Some(data) = dirs::data_dir() {
        dirs_list.push(data.join("gantry").join("plugins"));
    }
    dirs_list
}

fn default_security_level() -> String {
    "medium".to_string()
}

/// Worker pool and enforcement tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Capacity floor; validation enforces `pool_min <= pool_max`.
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,

    /// Hard ceiling on concurrent workers.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// How long a load waits for a worker slot before failing.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Recycle a worker after this many handled operations.
    #[serde(default = "default_recycle_after_ops")]
    pub recycle_after_ops: u64,

    /// Enforcer and monitor cycle interval.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Multiplier over policy ceilings separating soft from hard breaches.
    #[serde(default = "default_hard_breach_multiplier")]
    pub hard_breach_multiplier: f64,

    /// Behavioral escalation: errors per minute.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: u32,

    /// Behavioral escalation: violations per instance lifetime.
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Behavioral escalation: events handled per minute.
    #[serde(default = "default_events_per_minute_threshold")]
    pub events_per_minute_threshold: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            load_timeout_ms: default_load_timeout_ms(),
            recycle_after_ops: default_recycle_after_ops(),
            monitor_interval_ms: default_monitor_interval_ms(),
            hard_breach_multiplier: default_hard_breach_multiplier(),
            error_rate_threshold: default_error_rate_threshold(),
            violation_threshold: default_violation_threshold(),
            events_per_minute_threshold: default_events_per_minute_threshold(),
        }
    }
}

fn default_pool_min() -> usize {
    1
}
fn default_pool_max() -> usize {
    num_cpus::get().max(2)
}
fn default_load_timeout_ms() -> u64 {
    5000
}
fn default_recycle_after_ops() -> u64 {
    10_000
}
fn default_monitor_interval_ms() -> u64 {
    500
}
fn default_hard_breach_multiplier() -> f64 {
    1.5
}
fn default_error_rate_threshold() -> u32 {
    30
}
fn default_violation_threshold() -> u32 {
    5
}
fn default_events_per_minute_threshold() -> u32 {
    6000
}

/// Event log and audit persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// In-memory event log retention.
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Where JSONL sinks live; `None` keeps everything in memory.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,

    /// Audit tail kept in memory for export queries.
    #[serde(default = "default_audit_tail")]
    pub audit_tail: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            persist_dir: None,
            audit_tail: default_audit_tail(),
        }
    }
}

fn default_retention() -> usize {
    4096
}
fn default_audit_tail() -> usize {
    512
}

/// Daemon socket and pid paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Unix socket the control surface listens on; `None` uses the XDG
    /// runtime directory.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Pid file path; `None` uses the XDG config directory.
    #[serde(default)]
    pub pid_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            pid_path: None,
        }
    }
}
