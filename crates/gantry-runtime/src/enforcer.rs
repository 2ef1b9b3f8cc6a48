//! Resource enforcement: measure, throttle, contain.

use crate::messages::WorkerUsage;
use dashmap::DashMap;
use gantry_core::{InstanceId, ResourcePolicy, ResourceUsage, SecurityViolation, Severity, ViolationKind};
use std::time::Duration;
use tracing::{debug, warn};

/// Delay applied to an instance's event deliveries while soft-breaching.
const SOFT_THROTTLE: Duration = Duration::from_millis(250);

/// Shared usage ledger: the boundary pump writes raw worker reports, the
/// enforcer derives rates and verdicts, status queries read snapshots.
///
/// Entries are plain data keyed by instance id. Nothing in here owns a
/// worker; containment is requested through lifecycle commands, so the
/// enforcer can never race the lifecycle manager on instance state.
#[derive(Default)]
pub struct EnforcerBook {
    entries: DashMap<InstanceId, BookEntry>,
}

struct BookEntry {
    plugin_id: String,
    policy: ResourcePolicy,
    usage: WorkerUsage,
    cpu_percent: f64,
    last_busy_ns: u64,
    soft_flagged: bool,
    monitored_once: bool,
}

/// What one enforcement cycle decided for one instance.
#[derive(Debug)]
pub enum EnforcementAction {
    /// First cycle that observed the instance.
    StartMonitoring { instance: InstanceId },
    /// Soft breach: slow the instance down and record a low-severity
    /// violation.
    Throttle {
        instance: InstanceId,
        delay: Duration,
        violation: SecurityViolation,
    },
    /// Back under policy: lift the throttle.
    Unthrottle { instance: InstanceId },
    /// Hard breach: containment, grace period handled by the lifecycle.
    Contain {
        instance: InstanceId,
        violation: SecurityViolation,
    },
}

impl EnforcerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an instance from load time.
    pub fn register(&self, instance: InstanceId, plugin_id: impl Into<String>, policy: ResourcePolicy) {
        self.entries.insert(
            instance,
            BookEntry {
                plugin_id: plugin_id.into(),
                policy,
                usage: WorkerUsage::default(),
                cpu_percent: 0.0,
                last_busy_ns: 0,
                soft_flagged: false,
                monitored_once: false,
            },
        );
    }

    /// Stop tracking (terminal states release everything).
    pub fn unregister(&self, instance: &InstanceId) {
        self.entries.remove(instance);
    }

    /// Latest raw worker report, written by the boundary pump.
    pub fn update_usage(&self, instance: &InstanceId, usage: WorkerUsage) {
        if let Some(mut entry) = self.entries.get_mut(instance) {
            entry.usage = usage;
        }
    }

    /// Usage snapshot for status queries.
    pub fn snapshot(&self, instance: &InstanceId) -> Option<ResourceUsage> {
        self.entries.get(instance).map(|entry| ResourceUsage {
            heap_bytes: entry.usage.heap_bytes,
            cpu_percent: entry.cpu_percent,
            ops_handled: entry.usage.ops_handled,
        })
    }

    /// Run one enforcement cycle over every tracked instance.
    ///
    /// `elapsed` is the time since the previous cycle; CPU percent is busy
    /// nanoseconds accumulated in that window over the window itself.
    /// Enforcement is strictly per instance: each verdict derives from that
    /// instance's own ledger entry alone.
    pub fn cycle(&self, elapsed: Duration, hard_multiplier: f64) -> Vec<EnforcementAction> {
        let mut actions = Vec::new();
        let window_ns = elapsed.as_nanos().max(1) as f64;

        for mut entry in self.entries.iter_mut() {
            let instance = *entry.key();

            if !entry.monitored_once {
                entry.monitored_once = true;
                actions.push(EnforcementAction::StartMonitoring { instance });
            }

            let busy_delta = entry.usage.busy_ns.saturating_sub(entry.last_busy_ns);
            entry.last_busy_ns = entry.usage.busy_ns;
            entry.cpu_percent = (busy_delta as f64 / window_ns) * 100.0;

            let heap = entry.usage.heap_bytes;
            let cpu = entry.cpu_percent;
            let policy = entry.policy.clone();

            let hard_heap = (policy.max_heap_bytes as f64 * hard_multiplier) as u64;
            let hard_cpu = policy.max_cpu_percent * hard_multiplier;

            if heap > hard_heap || cpu > hard_cpu {
                warn!(
                    %instance,
                    plugin = %entry.plugin_id,
                    heap,
                    cpu,
                    "hard resource breach"
                );
                metrics::counter!("gantry_enforcer_hard_breaches_total").increment(1);
                actions.push(EnforcementAction::Contain {
                    instance,
                    violation: SecurityViolation::new(
                        entry.plugin_id.clone(),
                        ViolationKind::ResourceBreach,
                        Severity::High,
                        format!(
                            "heap {heap}B (hard ceiling {hard_heap}B), cpu {cpu:.1}% (hard ceiling {hard_cpu:.1}%)"
                        ),
                    ),
                });
                continue;
            }

            let soft = heap > policy.max_heap_bytes || cpu > policy.max_cpu_percent;
            if soft && !entry.soft_flagged {
                entry.soft_flagged = true;
                debug!(%instance, plugin = %entry.plugin_id, "soft resource breach, throttling");
                metrics::counter!("gantry_enforcer_soft_breaches_total").increment(1);
                actions.push(EnforcementAction::Throttle {
                    instance,
                    delay: SOFT_THROTTLE,
                    violation: SecurityViolation::new(
                        entry.plugin_id.clone(),
                        ViolationKind::ResourceBreach,
                        Severity::Low,
                        format!(
                            "heap {heap}B (policy {}B), cpu {cpu:.1}% (policy {:.1}%)",
                            policy.max_heap_bytes, policy.max_cpu_percent
                        ),
                    ),
                });
            } else if !soft && entry.soft_flagged {
                entry.soft_flagged = false;
                actions.push(EnforcementAction::Unthrottle { instance });
            }
        }

        actions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The periodic enforcement task. Thin: all policy lives in
/// [`EnforcerBook::cycle`], all authority in the lifecycle manager.
pub struct ResourceEnforcer;

impl ResourceEnforcer {
    pub fn spawn(
        book: std::sync::Arc<EnforcerBook>,
        cmd_tx: tokio::sync::mpsc::UnboundedSender<crate::lifecycle::Command>,
        interval: Duration,
        hard_multiplier: f64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = tokio::time::Instant::now();

            loop {
                ticker.tick().await;
                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(last);
                last = now;

                for action in book.cycle(elapsed, hard_multiplier) {
                    let command = match action {
                        EnforcementAction::StartMonitoring { instance } => {
                            crate::lifecycle::Command::SetMonitoring { instance }
                        }
                        EnforcementAction::Throttle {
                            instance,
                            delay,
                            violation,
                        } => {
                            if cmd_tx
                                .send(crate::lifecycle::Command::Violation {
                                    instance,
                                    violation,
                                })
                                .is_err()
                            {
                                return;
                            }
                            crate::lifecycle::Command::Throttle { instance, delay }
                        }
                        EnforcementAction::Unthrottle { instance } => {
                            crate::lifecycle::Command::Throttle {
                                instance,
                                delay: Duration::ZERO,
                            }
                        }
                        EnforcementAction::Contain {
                            instance,
                            violation,
                        } => crate::lifecycle::Command::Block {
                            instance,
                            violation,
                        },
                    };
                    if cmd_tx.send(command).is_err() {
                        return;
                    }
                }
            }
        })
    }
}
