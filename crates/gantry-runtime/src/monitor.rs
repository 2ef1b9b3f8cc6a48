//! Behavioral monitoring: rolling counters and anomaly escalation.
//!
//! Runs independently of the resource enforcement path, so a plugin that
//! stays under every resource ceiling but misbehaves (error storms,
//! permission probing, event floods) still gets contained.

use dashmap::DashMap;
use gantry_core::{InstanceId, SecurityViolation, Severity, ViolationKind};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// One-minute rolling window.
const WINDOW: Duration = Duration::from_secs(60);

/// Escalation thresholds, from config.
#[derive(Debug, Clone)]
pub struct BehaviorThresholds {
    /// Handler errors per minute.
    pub errors_per_minute: u32,
    /// Recorded violations over the instance lifetime.
    pub violation_count: u32,
    /// Events handled per minute (flood detection).
    pub events_per_minute: u32,
}

impl Default for BehaviorThresholds {
    fn default() -> Self {
        Self {
            errors_per_minute: 30,
            violation_count: 5,
            events_per_minute: 6000,
        }
    }
}

struct BehaviorEntry {
    plugin_id: String,
    events: VecDeque<Instant>,
    errors: VecDeque<Instant>,
    violations: u32,
    escalated: bool,
}

/// Per-instance rolling behavior counters.
pub struct SecurityMonitor {
    entries: DashMap<InstanceId, BehaviorEntry>,
    thresholds: BehaviorThresholds,
}

impl SecurityMonitor {
    pub fn new(thresholds: BehaviorThresholds) -> Self {
        Self {
            entries: DashMap::new(),
            thresholds,
        }
    }

    pub fn register(&self, instance: InstanceId, plugin_id: impl Into<String>) {
        self.entries.insert(
            instance,
            BehaviorEntry {
                plugin_id: plugin_id.into(),
                events: VecDeque::new(),
                errors: VecDeque::new(),
                violations: 0,
                escalated: false,
            },
        );
    }

    pub fn unregister(&self, instance: &InstanceId) {
        self.entries.remove(instance);
    }

    pub fn record_event(&self, instance: &InstanceId) {
        if let Some(mut entry) = self.entries.get_mut(instance) {
            entry.events.push_back(Instant::now());
        }
    }

    pub fn record_error(&self, instance: &InstanceId) {
        if let Some(mut entry) = self.entries.get_mut(instance) {
            entry.errors.push_back(Instant::now());
        }
        metrics::counter!("gantry_plugin_errors_total").increment(1);
    }

    pub fn record_violation(&self, instance: &InstanceId) {
        if let Some(mut entry) = self.entries.get_mut(instance) {
            entry.violations += 1;
        }
    }

    /// Rolling rates for one instance: (events/min, errors/min, violations).
    pub fn rates(&self, instance: &InstanceId) -> Option<(u32, u32, u32)> {
        let now = Instant::now();
        self.entries.get_mut(instance).map(|mut entry| {
            prune(&mut entry.events, now);
            prune(&mut entry.errors, now);
            (
                entry.events.len() as u32,
                entry.errors.len() as u32,
                entry.violations,
            )
        })
    }

    /// Check every instance against the thresholds; returns at most one
    /// escalation per instance lifetime (the lifecycle manager makes
    /// Blocking idempotent anyway, this just avoids spam).
    pub fn check(&self) -> Vec<(InstanceId, SecurityViolation)> {
        let now = Instant::now();
        let mut escalations = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.escalated {
                continue;
            }
            let instance = *entry.key();
            prune(&mut entry.events, now);
            prune(&mut entry.errors, now);

            let events = entry.events.len() as u32;
            let errors = entry.errors.len() as u32;
            let violations = entry.violations;

            let anomaly = if errors >= self.thresholds.errors_per_minute {
                Some(format!(
                    "{errors} handler errors in the last minute (threshold {})",
                    self.thresholds.errors_per_minute
                ))
            } else if violations >= self.thresholds.violation_count {
                Some(format!(
                    "{violations} recorded violations (threshold {})",
                    self.thresholds.violation_count
                ))
            } else if events >= self.thresholds.events_per_minute {
                Some(format!(
                    "{events} events handled in the last minute (threshold {})",
                    self.thresholds.events_per_minute
                ))
            } else {
                None
            };

            if let Some(detail) = anomaly {
                warn!(%instance, plugin = %entry.plugin_id, "behavioral anomaly: {detail}");
                metrics::counter!("gantry_monitor_escalations_total").increment(1);
                entry.escalated = true;
                escalations.push((
                    instance,
                    SecurityViolation::new(
                        entry.plugin_id.clone(),
                        ViolationKind::BehavioralAnomaly,
                        Severity::High,
                        detail,
                    ),
                ));
            }
        }

        escalations
    }

    /// Spawn the periodic check task.
    pub fn spawn(
        self: std::sync::Arc<Self>,
        cmd_tx: tokio::sync::mpsc::UnboundedSender<crate::lifecycle::Command>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (instance, violation) in self.check() {
                    if cmd_tx
                        .send(crate::lifecycle::Command::Block {
                            instance,
                            violation,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        })
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}
