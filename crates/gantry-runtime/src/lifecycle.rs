//! The plugin lifecycle manager.
//!
//! One task owns every [`PluginInstance`]'s state; everything else (the
//! enforcer, the monitor, the boundary pumps, the control surface) talks to
//! it through [`Command`]s over a channel. There is no other writer, which
//! is what makes transition races impossible by construction.
//!
//! Stopping is a two-phase protocol with a definite outcome: a shutdown
//! request, a grace period, then unconditional forced termination; the
//! caller always learns whether the worker went quietly. Blocking follows
//! the same retirement path but lands in `Blocked`, which, like every
//! terminal state, releases the worker slot and admits no way back.

use crate::boundary::{BoundaryVerdict, SecurityBoundary};
use crate::devices::DeviceTable;
use crate::enforcer::{EnforcerBook, ResourceEnforcer};
use crate::error::{LoadError, RuntimeError, StopOutcome};
use crate::messages::{HostCallResult, WorkerMessage, WorkerRequest};
use crate::monitor::{BehaviorThresholds, SecurityMonitor};
use crate::pool::{LoadedWorker, WorkerPool};
use crate::worker::WorkerHandle;
use gantry_core::{
    AuditRecord, AuditTrail, Consumer, EventLog, InstanceId, LifecycleState, ResourceUsage,
    SecurityViolation, Severity, ViolationKind,
};
use gantry_plugins::ValidatedPlugin;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runtime tuning, snapshotted from config at startup.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub pool_max: usize,
    pub load_timeout: Duration,
    pub recycle_after_ops: u64,
    pub monitor_interval: Duration,
    pub hard_breach_multiplier: f64,
    /// Strict boundary mode: malformed messages raise violations.
    pub strict_boundary: bool,
    pub thresholds: BehaviorThresholds,
}

impl RuntimeSettings {
    pub fn from_config(config: &gantry_config::RuntimeConfig, strict_boundary: bool) -> Self {
        Self {
            pool_max: config.pool_max,
            load_timeout: Duration::from_millis(config.load_timeout_ms),
            recycle_after_ops: config.recycle_after_ops,
            monitor_interval: Duration::from_millis(config.monitor_interval_ms),
            hard_breach_multiplier: config.hard_breach_multiplier,
            strict_boundary,
            thresholds: BehaviorThresholds {
                errors_per_minute: config.error_rate_threshold,
                violation_count: config.violation_threshold,
                events_per_minute: config.events_per_minute_threshold,
            },
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            pool_max: 4,
            load_timeout: Duration::from_secs(5),
            recycle_after_ops: 10_000,
            monitor_interval: Duration::from_millis(500),
            hard_breach_multiplier: 1.5,
            strict_boundary: false,
            thresholds: BehaviorThresholds::default(),
        }
    }
}

/// Externally visible instance snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub instance: InstanceId,
    pub plugin_id: String,
    pub version: String,
    /// External state; the running/monitoring flip is internal bookkeeping
    /// and reported as `running` with the `monitoring` flag.
    pub state: LifecycleState,
    pub monitoring: bool,
    pub usage: ResourceUsage,
    pub violation_count: u32,
}

/// Commands accepted by the manager task.
pub enum Command {
    Load {
        plugin: ValidatedPlugin,
        reply: oneshot::Sender<Result<InstanceId, RuntimeError>>,
    },
    Stop {
        instance: InstanceId,
        reply: oneshot::Sender<Result<StopOutcome, RuntimeError>>,
    },
    Block {
        instance: InstanceId,
        violation: SecurityViolation,
    },
    Violation {
        instance: InstanceId,
        violation: SecurityViolation,
    },
    Throttle {
        instance: InstanceId,
        delay: Duration,
    },
    SetMonitoring {
        instance: InstanceId,
    },
    Recycle {
        instance: InstanceId,
    },
    Status {
        instance: InstanceId,
        reply: oneshot::Sender<Option<InstanceStatus>>,
    },
    Find {
        plugin_id: String,
        reply: oneshot::Sender<Option<InstanceId>>,
    },
    List {
        reply: oneshot::Sender<Vec<InstanceStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    // Internal settlement messages from spawned tasks.
    LoadSettled {
        instance: InstanceId,
        result: Result<LoadedWorker, LoadError>,
    },
    StopSettled {
        instance: InstanceId,
        outcome: StopOutcome,
        reply: oneshot::Sender<Result<StopOutcome, RuntimeError>>,
    },
    BlockSettled {
        instance: InstanceId,
        outcome: StopOutcome,
    },
    RecycleSettled {
        instance: InstanceId,
        result: Result<LoadedWorker, LoadError>,
    },
    WorkerExited {
        instance: InstanceId,
    },
}

struct WorkerRig {
    handle: Arc<WorkerHandle>,
    _permit: OwnedSemaphorePermit,
    pump: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

impl WorkerRig {
    fn teardown(&self) {
        self.pump.abort();
        self.dispatch.abort();
        self.handle.force_kill();
    }
}

struct Instance {
    plugin: ValidatedPlugin,
    state: LifecycleState,
    violation_count: u32,
    rig: Option<WorkerRig>,
    recycling: bool,
    pending_load: Option<oneshot::Sender<Result<InstanceId, RuntimeError>>>,
}

impl Instance {
    fn external_state(&self) -> LifecycleState {
        match self.state {
            LifecycleState::Monitoring => LifecycleState::Running,
            other => other,
        }
    }
}

/// Public handle; cheap to clone.
#[derive(Clone)]
pub struct LifecycleHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl LifecycleHandle {
    pub async fn load(&self, plugin: ValidatedPlugin) -> Result<InstanceId, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Load { plugin, reply })
            .map_err(|_| RuntimeError::ManagerGone)?;
        rx.await.map_err(|_| RuntimeError::ManagerGone)?
    }

    pub async fn stop(&self, instance: InstanceId) -> Result<StopOutcome, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop { instance, reply })
            .map_err(|_| RuntimeError::ManagerGone)?;
        rx.await.map_err(|_| RuntimeError::ManagerGone)?
    }

    /// Request containment. Fire-and-forget: either trigger path (resource
    /// or behavioral) is sufficient and the first to land wins.
    pub fn block(&self, instance: InstanceId, violation: SecurityViolation) {
        let _ = self.cmd_tx.send(Command::Block {
            instance,
            violation,
        });
    }

    pub async fn status(&self, instance: InstanceId) -> Result<Option<InstanceStatus>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status { instance, reply })
            .map_err(|_| RuntimeError::ManagerGone)?;
        rx.await.map_err(|_| RuntimeError::ManagerGone)
    }

    /// Newest instance for a plugin id.
    pub async fn find(&self, plugin_id: impl Into<String>) -> Result<Option<InstanceId>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Find {
                plugin_id: plugin_id.into(),
                reply,
            })
            .map_err(|_| RuntimeError::ManagerGone)?;
        rx.await.map_err(|_| RuntimeError::ManagerGone)
    }

    pub async fn list(&self) -> Result<Vec<InstanceStatus>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::List { reply })
            .map_err(|_| RuntimeError::ManagerGone)?;
        rx.await.map_err(|_| RuntimeError::ManagerGone)
    }

    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply })
            .map_err(|_| RuntimeError::ManagerGone)?;
        rx.await.map_err(|_| RuntimeError::ManagerGone)
    }
}

/// Builds and runs the manager task plus its enforcement satellites.
pub struct LifecycleManager;

impl LifecycleManager {
    pub fn start(
        settings: RuntimeSettings,
        log: EventLog,
        audit: AuditTrail,
        devices: Arc<DeviceTable>,
    ) -> LifecycleHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = LifecycleHandle {
            cmd_tx: cmd_tx.clone(),
        };

        let book = Arc::new(EnforcerBook::new());
        let monitor = Arc::new(SecurityMonitor::new(settings.thresholds.clone()));

        let enforcer_task = ResourceEnforcer::spawn(
            Arc::clone(&book),
            cmd_tx.clone(),
            settings.monitor_interval,
            settings.hard_breach_multiplier,
        );
        let monitor_task = Arc::clone(&monitor).spawn(cmd_tx.clone(), settings.monitor_interval);

        let manager = Manager {
            settings: settings.clone(),
            pool: Arc::new(WorkerPool::new(
                settings.pool_max,
                settings.load_timeout,
                settings.recycle_after_ops,
            )),
            log,
            audit,
            devices,
            book,
            monitor,
            instances: HashMap::new(),
            order: Vec::new(),
            cmd_tx,
            enforcer_task,
            monitor_task,
        };
        tokio::spawn(manager.run(cmd_rx));

        handle
    }
}

struct Manager {
    settings: RuntimeSettings,
    pool: Arc<WorkerPool>,
    log: EventLog,
    audit: AuditTrail,
    devices: Arc<DeviceTable>,
    book: Arc<EnforcerBook>,
    monitor: Arc<SecurityMonitor>,
    instances: HashMap<InstanceId, Instance>,
    /// Creation order, for resolving a plugin id to its newest instance.
    order: Vec<InstanceId>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    enforcer_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl Manager {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        info!("lifecycle manager started");
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::Load { plugin, reply } => self.handle_load(plugin, reply),
                Command::LoadSettled { instance, result } => {
                    self.handle_load_settled(instance, result)
                }
                Command::Stop { instance, reply } => self.handle_stop(instance, reply),
                Command::StopSettled {
                    instance,
                    outcome,
                    reply,
                } => self.handle_stop_settled(instance, outcome, reply),
                Command::Block {
                    instance,
                    violation,
                } => self.handle_block(instance, violation),
                Command::BlockSettled { instance, outcome } => {
                    self.handle_block_settled(instance, outcome)
                }
                Command::Violation {
                    instance,
                    violation,
                } => self.handle_violation(instance, violation),
                Command::Throttle { instance, delay } => {
                    if let Some(rig) = self.instances.get(&instance).and_then(|i| i.rig.as_ref()) {
                        rig.handle.set_throttle(delay);
                    }
                }
                Command::SetMonitoring { instance } => {
                    if let Some(inst) = self.instances.get_mut(&instance) {
                        if inst.state == LifecycleState::Running {
                            inst.state = LifecycleState::Monitoring;
                        }
                    }
                }
                Command::Recycle { instance } => self.handle_recycle(instance),
                Command::RecycleSettled { instance, result } => {
                    self.handle_recycle_settled(instance, result)
                }
                Command::WorkerExited { instance } => self.handle_worker_exited(instance),
                Command::Status { instance, reply } => {
                    let _ = reply.send(self.status_of(&instance));
                }
                Command::Find { plugin_id, reply } => {
                    let found = self
                        .order
                        .iter()
                        .rev()
                        .find(|id| {
                            self.instances
                                .get(id)
                                .is_some_and(|i| i.plugin.manifest.id == plugin_id)
                        })
                        .copied();
                    let _ = reply.send(found);
                }
                Command::List { reply } => {
                    let mut statuses: Vec<InstanceStatus> = self
                        .order
                        .iter()
                        .filter_map(|id| self.status_of(id))
                        .collect();
                    statuses.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
                    let _ = reply.send(statuses);
                }
                Command::Shutdown { reply } => {
                    self.handle_shutdown();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("lifecycle manager stopped");
    }

    fn transition(&mut self, instance: InstanceId, to: LifecycleState) -> bool {
        let Some(inst) = self.instances.get_mut(&instance) else {
            return false;
        };
        if !inst.state.can_transition_to(to) {
            error!(
                %instance,
                from = %inst.state,
                %to,
                "illegal lifecycle transition refused"
            );
            return false;
        }
        debug!(%instance, plugin = %inst.plugin.manifest.id, from = %inst.state, %to, "transition");
        inst.state = to;
        true
    }

    fn status_of(&self, instance: &InstanceId) -> Option<InstanceStatus> {
        let inst = self.instances.get(instance)?;
        Some(InstanceStatus {
            instance: *instance,
            plugin_id: inst.plugin.manifest.id.clone(),
            version: inst.plugin.manifest.version.clone(),
            state: inst.external_state(),
            monitoring: inst.state == LifecycleState::Monitoring,
            usage: self.book.snapshot(instance).unwrap_or_default(),
            violation_count: inst.violation_count,
        })
    }

    fn handle_load(
        &mut self,
        plugin: ValidatedPlugin,
        reply: oneshot::Sender<Result<InstanceId, RuntimeError>>,
    ) {
        let instance = Uuid::new_v4();
        info!(
            %instance,
            plugin = %plugin.manifest.id,
            version = %plugin.manifest.version,
            "loading plugin instance"
        );

        self.instances.insert(
            instance,
            Instance {
                plugin: plugin.clone(),
                state: LifecycleState::Discovered,
                violation_count: 0,
                rig: None,
                recycling: false,
                pending_load: Some(reply),
            },
        );
        self.order.push(instance);

        // The registry validated the package; the instance's own machine
        // still walks Discovered -> Validating -> Loading so the audit of
        // states stays honest.
        self.transition(instance, LifecycleState::Validating);
        self.transition(instance, LifecycleState::Loading);

        let pool = Arc::clone(&self.pool);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = pool.load(&plugin).await;
            let _ = cmd_tx.send(Command::LoadSettled { instance, result });
        });
    }

    fn handle_load_settled(
        &mut self,
        instance: InstanceId,
        result: Result<LoadedWorker, LoadError>,
    ) {
        let Some(inst) = self.instances.get_mut(&instance) else {
            if let Ok(loaded) = result {
                loaded.handle.force_kill();
            }
            return;
        };
        let reply = inst.pending_load.take();

        match result {
            Ok(loaded) => {
                self.transition(instance, LifecycleState::Starting);
                match self.wire_worker(instance, loaded, true) {
                    Ok(()) => {
                        self.transition(instance, LifecycleState::Running);
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(instance));
                        }
                    }
                    Err(e) => {
                        self.transition(instance, LifecycleState::Failed);
                        self.release(instance);
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(%instance, "load failed: {e}");
                self.transition(instance, LifecycleState::Failed);
                self.release(instance);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(RuntimeError::Load(e)));
                }
            }
        }
    }

    /// Attach boundary pump and event dispatch to a loaded worker.
    fn wire_worker(
        &mut self,
        instance: InstanceId,
        loaded: LoadedWorker,
        fresh: bool,
    ) -> Result<(), RuntimeError> {
        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(RuntimeError::UnknownInstance(instance))?;
        let plugin = &inst.plugin;

        let boundary = Arc::new(SecurityBoundary::new(
            plugin.manifest.id.clone(),
            &plugin.manifest.permissions,
            &plugin.policy,
            self.settings.strict_boundary,
            self.audit.clone(),
        )?);

        let LoadedWorker {
            handle,
            outbox_rx,
            host_reply_tx,
            permit,
        } = loaded;

        if fresh {
            self.monitor.register(instance, plugin.manifest.id.clone());
        }
        self.book
            .register(instance, plugin.manifest.id.clone(), plugin.policy.clone());

        let pump = tokio::spawn(pump_loop(
            instance,
            plugin.manifest.id.clone(),
            outbox_rx,
            host_reply_tx,
            Arc::clone(&boundary),
            Arc::clone(&self.devices),
            Arc::clone(&self.book),
            Arc::clone(&self.monitor),
            self.settings.recycle_after_ops,
            self.cmd_tx.clone(),
        ));

        // Instance-scoped group: a recycled worker resumes from the same
        // committed offset, a fresh instance starts at the end of the
        // stream.
        let consumer = self.log.subscribe_at_end(format!("plugin:{instance}"));
        let dispatch = tokio::spawn(dispatch_loop(
            consumer,
            Arc::clone(&handle),
            Arc::clone(&boundary),
        ));

        let inst = self
            .instances
            .get_mut(&instance)
            .ok_or(RuntimeError::UnknownInstance(instance))?;
        inst.rig = Some(WorkerRig {
            handle,
            _permit: permit,
            pump,
            dispatch,
        });
        Ok(())
    }

    fn handle_stop(
        &mut self,
        instance: InstanceId,
        reply: oneshot::Sender<Result<StopOutcome, RuntimeError>>,
    ) {
        let Some(inst) = self.instances.get_mut(&instance) else {
            let _ = reply.send(Err(RuntimeError::UnknownInstance(instance)));
            return;
        };
        if !inst.state.can_transition_to(LifecycleState::Stopping) {
            let _ = reply.send(Err(RuntimeError::WrongState {
                instance,
                state: inst.state,
            }));
            return;
        }
        self.transition(instance, LifecycleState::Stopping);

        let Some(rig) = self.instances.get_mut(&instance).and_then(|i| i.rig.as_mut()) else {
            // No worker to retire; settle immediately.
            let _ = self.cmd_tx.send(Command::StopSettled {
                instance,
                outcome: StopOutcome::StoppedGracefully,
                reply,
            });
            return;
        };

        // Freeze deliveries, keep the pump draining until the worker exits.
        rig.dispatch.abort();
        let handle = Arc::clone(&rig.handle);
        let grace = self
            .instances
            .get(&instance)
            .map(|i| i.plugin.policy.grace_period)
            .unwrap_or(Duration::from_secs(5));
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = retire_worker(handle, grace).await;
            let _ = cmd_tx.send(Command::StopSettled {
                instance,
                outcome,
                reply,
            });
        });
    }

    fn handle_stop_settled(
        &mut self,
        instance: InstanceId,
        outcome: StopOutcome,
        reply: oneshot::Sender<Result<StopOutcome, RuntimeError>>,
    ) {
        self.transition(instance, LifecycleState::Stopped);
        self.release(instance);
        info!(%instance, ?outcome, "instance stopped");
        let _ = reply.send(Ok(outcome));
    }

    fn handle_block(&mut self, instance: InstanceId, violation: SecurityViolation) {
        let Some(inst) = self.instances.get(&instance) else {
            return;
        };
        // First trigger wins; anything already leaving stays on its path.
        if !inst.state.can_transition_to(LifecycleState::Blocking) {
            debug!(%instance, state = %inst.state, "block request ignored");
            return;
        }

        self.record_violation(instance, &violation);
        self.transition(instance, LifecycleState::Blocking);
        warn!(
            %instance,
            plugin = %violation.plugin_id,
            kind = violation.kind.as_str(),
            "containing instance: {}",
            violation.detail
        );
        metrics::counter!("gantry_instances_blocked_total").increment(1);

        let Some(rig) = self.instances.get_mut(&instance).and_then(|i| i.rig.as_mut()) else {
            let _ = self.cmd_tx.send(Command::BlockSettled {
                instance,
                outcome: StopOutcome::StoppedGracefully,
            });
            return;
        };
        rig.dispatch.abort();
        let handle = Arc::clone(&rig.handle);
        let grace = self
            .instances
            .get(&instance)
            .map(|i| i.plugin.policy.grace_period)
            .unwrap_or(Duration::from_secs(5));
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = retire_worker(handle, grace).await;
            let _ = cmd_tx.send(Command::BlockSettled { instance, outcome });
        });
    }

    fn handle_block_settled(&mut self, instance: InstanceId, outcome: StopOutcome) {
        self.transition(instance, LifecycleState::Blocked);
        self.release(instance);
        info!(%instance, ?outcome, "instance blocked");
    }

    fn handle_violation(&mut self, instance: InstanceId, violation: SecurityViolation) {
        let demands_blocking = violation.demands_blocking();
        self.record_violation(instance, &violation);
        if demands_blocking {
            self.handle_block(instance, violation);
        }
    }

    fn record_violation(&mut self, instance: InstanceId, violation: &SecurityViolation) {
        if let Some(inst) = self.instances.get_mut(&instance) {
            inst.violation_count += 1;
        }
        self.monitor.record_violation(&instance);
        metrics::counter!("gantry_violations_total").increment(1);
        if let Err(e) = self
            .audit
            .record(AuditRecord::Violation(violation.clone()))
        {
            debug!("audit append failed during shutdown: {e}");
        }
    }

    fn handle_recycle(&mut self, instance: InstanceId) {
        let Some(inst) = self.instances.get_mut(&instance) else {
            return;
        };
        if inst.recycling
            || !matches!(
                inst.state,
                LifecycleState::Running | LifecycleState::Monitoring
            )
        {
            return;
        }
        inst.recycling = true;
        info!(%instance, plugin = %inst.plugin.manifest.id, "recycling worker");
        metrics::counter!("gantry_workers_recycled_total").increment(1);

        let plugin = inst.plugin.clone();
        let pool = Arc::clone(&self.pool);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = pool.load(&plugin).await;
            let _ = cmd_tx.send(Command::RecycleSettled { instance, result });
        });
    }

    fn handle_recycle_settled(
        &mut self,
        instance: InstanceId,
        result: Result<LoadedWorker, LoadError>,
    ) {
        let Some(inst) = self.instances.get_mut(&instance) else {
            if let Ok(loaded) = result {
                loaded.handle.force_kill();
            }
            return;
        };
        inst.recycling = false;

        let still_running = matches!(
            inst.state,
            LifecycleState::Running | LifecycleState::Monitoring
        );
        match result {
            Ok(loaded) if still_running => {
                // Retire the old worker off to the side; the replacement
                // resumes from the same consumer group.
                if let Some(old) = inst.rig.take() {
                    old.pump.abort();
                    old.dispatch.abort();
                    let handle = old.handle;
                    let grace = inst.plugin.policy.grace_period;
                    tokio::spawn(async move {
                        retire_worker(handle, grace).await;
                    });
                }
                if let Err(e) = self.wire_worker(instance, loaded, false) {
                    error!(%instance, "recycle wiring failed: {e}");
                }
            }
            Ok(loaded) => {
                // Instance left the running states while we were loading.
                loaded.handle.force_kill();
            }
            Err(e) => {
                // The old worker keeps running; recycling is a policy knob,
                // not a correctness requirement.
                warn!(%instance, "recycle load failed, keeping old worker: {e}");
            }
        }
    }

    fn handle_worker_exited(&mut self, instance: InstanceId) {
        let Some(inst) = self.instances.get(&instance) else {
            return;
        };
        match inst.state {
            // Expected exits: a retire supervisor owns the settlement.
            LifecycleState::Stopping | LifecycleState::Blocking => {}
            LifecycleState::Running | LifecycleState::Monitoring => {
                if self.instances.get(&instance).is_some_and(|i| i.recycling) {
                    return;
                }
                warn!(%instance, "worker exited unexpectedly");
                let violation = SecurityViolation::new(
                    inst.plugin.manifest.id.clone(),
                    ViolationKind::ProtocolError,
                    Severity::Medium,
                    "worker exited without a stop request",
                );
                self.record_violation(instance, &violation);
                if self.transition(instance, LifecycleState::Stopping) {
                    self.transition(instance, LifecycleState::Stopped);
                    self.release(instance);
                }
            }
            _ => {}
        }
    }

    /// Terminal-state cleanup: tasks, worker slot, ledgers, log group.
    fn release(&mut self, instance: InstanceId) {
        if let Some(inst) = self.instances.get_mut(&instance) {
            if let Some(rig) = inst.rig.take() {
                rig.teardown();
            }
        }
        self.book.unregister(&instance);
        self.monitor.unregister(&instance);
        // A dead instance's consumer group must not pin log retention.
        self.log.unsubscribe(&format!("plugin:{instance}"));
    }

    fn handle_shutdown(&mut self) {
        info!("lifecycle manager shutting down");
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        for instance in ids {
            self.release(instance);
        }
        self.enforcer_task.abort();
        self.monitor_task.abort();
    }
}

/// Graceful-then-forced worker retirement with a definite outcome.
async fn retire_worker(handle: Arc<WorkerHandle>, grace: Duration) -> StopOutcome {
    let _ = handle.try_send(WorkerRequest::Shutdown);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if handle.has_exited() {
            reap(handle).await;
            return StopOutcome::StoppedGracefully;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.force_kill();
    reap(handle).await;
    StopOutcome::ForceKilled
}

async fn reap(handle: Arc<WorkerHandle>) {
    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
}

/// Drains one worker's outbox through the boundary.
#[allow(clippy::too_many_arguments)]
async fn pump_loop(
    instance: InstanceId,
    plugin_id: String,
    outbox: flume::Receiver<WorkerMessage>,
    host_reply: flume::Sender<HostCallResult>,
    boundary: Arc<SecurityBoundary>,
    devices: Arc<DeviceTable>,
    book: Arc<EnforcerBook>,
    monitor: Arc<SecurityMonitor>,
    recycle_after_ops: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    while let Ok(message) = outbox.recv_async().await {
        match boundary.screen_inbound(&message) {
            BoundaryVerdict::Rejected { reason, violation } => {
                if let Some(violation) = violation {
                    let _ = cmd_tx.send(Command::Violation {
                        instance,
                        violation,
                    });
                }
                if matches!(message, WorkerMessage::HostCall { .. }) {
                    let _ = host_reply
                        .send_async(HostCallResult::Denied { reason })
                        .await;
                }
                continue;
            }
            BoundaryVerdict::Accepted => {}
        }

        match message {
            WorkerMessage::EventHandled { usage, .. } => {
                book.update_usage(&instance, usage);
                monitor.record_event(&instance);
                metrics::counter!("gantry_events_handled_total").increment(1);
                if recycle_after_ops > 0 && usage.ops_handled >= recycle_after_ops {
                    let _ = cmd_tx.send(Command::Recycle { instance });
                }
            }
            WorkerMessage::EventFailed { error, usage, .. } => {
                book.update_usage(&instance, usage);
                monitor.record_error(&instance);
                debug!(%instance, plugin = %plugin_id, "handler error: {error}");
            }
            WorkerMessage::HostCall { call } => {
                let result = boundary.execute_host_call(call, &devices).await;
                if host_reply.send_async(result).await.is_err() {
                    break;
                }
            }
            WorkerMessage::Log { message } => {
                info!(plugin = %plugin_id, "{message}");
            }
            WorkerMessage::Ready
            | WorkerMessage::InitFailed { .. }
            | WorkerMessage::ShuttingDown => {}
        }
    }

    let _ = cmd_tx.send(Command::WorkerExited { instance });
}

/// Delivers conditioned events from the log to one worker.
async fn dispatch_loop(
    consumer: Consumer,
    handle: Arc<WorkerHandle>,
    boundary: Arc<SecurityBoundary>,
) {
    loop {
        let batch = match consumer.poll(16) {
            Ok(batch) => batch,
            Err(e) => {
                error!(group = consumer.group(), "consumer poll failed: {e}");
                return;
            }
        };
        if batch.is_empty() {
            // Timeout bounds the wakeup race between an empty poll and an
            // append that already notified.
            let _ = tokio::time::timeout(Duration::from_millis(100), consumer.wait()).await;
            continue;
        }

        for (offset, event) in batch {
            let throttle = handle.throttle();
            if !throttle.is_zero() {
                tokio::time::sleep(throttle).await;
            }

            let device = &event.event;
            if boundary.allows_event(device.vendor_id, device.product_id) {
                let payload = match serde_json::to_value(device) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("event serialization failed: {e}");
                        continue;
                    }
                };
                let request = WorkerRequest::DeliverEvent {
                    sequence: event.sequence,
                    payload,
                };
                if boundary.screen_outbound(&request).is_accepted()
                    && handle.send(request).await.is_err()
                {
                    // Worker gone; the pump reports the exit.
                    return;
                }
            } else {
                metrics::counter!("gantry_dispatch_filtered_total").increment(1);
            }

            if consumer.commit(offset).is_err() {
                return;
            }
        }
    }
}
