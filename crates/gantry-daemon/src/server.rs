//! Unix socket server: component wiring and JSON-RPC dispatch.

use crate::protocol::{
    Request, RequestId, Response, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
    REJECTED, UNKNOWN_PLUGIN, WRONG_STATE,
};
use anyhow::{Context, Result};
use gantry_config::ConfigHandle;
use gantry_core::{AuditTrail, DeviceEventKind, EventLog, EventLogConfig, SecurityLevel};
use gantry_events::{
    AdapterSet, ChannelSource, DeviceInjector, DevfsSource, DeviceSource, EventPipeline,
    PipelineHandle, PollSource,
};
use gantry_plugins::{PluginRegistry, SubmissionReport, ValidationPolicy, Validator};
use gantry_runtime::{
    DeviceTable, LifecycleHandle, LifecycleManager, RuntimeError, RuntimeSettings,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Everything a request handler can reach.
pub struct DaemonState {
    config: Arc<ConfigHandle>,
    log: EventLog,
    audit: AuditTrail,
    pipeline: PipelineHandle,
    injector: DeviceInjector,
    registry: Arc<PluginRegistry>,
    lifecycle: LifecycleHandle,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

/// The daemon server bound to its control socket.
pub struct Server {
    listener: UnixListener,
    state: Arc<DaemonState>,
}

fn validator_from_config(config: &gantry_config::GantryConfig) -> Validator {
    let level: SecurityLevel = config
        .plugins
        .security_level
        .parse()
        .unwrap_or(SecurityLevel::Medium);
    Validator::new(ValidationPolicy::with_encoded_keys(
        config.plugins.require_signature,
        &config.plugins.trusted_keys,
        level,
        env!("CARGO_PKG_VERSION"),
    ))
}

impl Server {
    /// Wire every component and bind the control socket.
    pub async fn bind(config_handle: Arc<ConfigHandle>, socket: &Path) -> Result<Self> {
        let config = config_handle.snapshot();

        let log = EventLog::open(EventLogConfig {
            retention: config.log.retention,
            persist_dir: config.log.persist_dir.clone(),
        })
        .context("opening event log")?;

        let (audit, audit_writer) =
            AuditTrail::new(config.log.persist_dir.clone(), config.log.audit_tail)
                .context("opening audit trail")?;
        tokio::spawn(audit_writer.run());

        // The device table follows the conditioned stream through its own
        // consumer group.
        let devices = Arc::new(DeviceTable::new());
        spawn_device_table_consumer(&log, Arc::clone(&devices));

        // Sources: OS notifications where available, polling as the
        // fallback, plus the in-process injector for device.simulate.
        let (channel_source, injector) = ChannelSource::new();
        let adapters = AdapterSet::new()
            .with_source(Arc::new(DevfsSource::new(&config.events.device_dir)) as Arc<dyn DeviceSource>)
            .with_source(Arc::new(PollSource::new(
                &config.events.device_dir,
                Duration::from_millis(config.events.poll_interval_ms),
            )) as Arc<dyn DeviceSource>)
            .with_source(Arc::new(channel_source) as Arc<dyn DeviceSource>);
        let pipeline = EventPipeline::start(&config.events, log.clone(), adapters);

        let registry = Arc::new(PluginRegistry::new(validator_from_config(&config)));

        let level: SecurityLevel = config
            .plugins
            .security_level
            .parse()
            .unwrap_or(SecurityLevel::Medium);
        let settings =
            RuntimeSettings::from_config(&config.runtime, level == SecurityLevel::High);
        let lifecycle =
            LifecycleManager::start(settings, log.clone(), audit.clone(), Arc::clone(&devices));

        // Discover and start everything already installed.
        let reports = registry.discover(&config.plugins.plugin_dirs)?;
        for report in &reports {
            if let SubmissionReport::Accepted { plugin_id, .. } = report {
                match registry.get(plugin_id) {
                    Ok(plugin) => {
                        if let Err(e) = lifecycle.load(plugin).await {
                            warn!(plugin = %plugin_id, "startup load failed: {e}");
                        }
                    }
                    Err(e) => warn!(plugin = %plugin_id, "registry lookup failed: {e}"),
                }
            }
        }

        if socket.exists() {
            std::fs::remove_file(socket)?;
        }
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket)
            .with_context(|| format!("binding control socket {}", socket.display()))?;
        info!(socket = %socket.display(), "control socket bound");

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            state: Arc::new(DaemonState {
                config: config_handle,
                log,
                audit,
                pipeline,
                injector,
                registry,
                lifecycle,
                started_at: Instant::now(),
                shutdown_tx,
            }),
        })
    }

    /// Accept connections until a shutdown request or ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state).await {
                                    debug!("connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested over control socket");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
            }
        }

        self.state.pipeline.shutdown();
        if let Err(e) = self.state.lifecycle.shutdown().await {
            warn!("lifecycle shutdown: {e}");
        }
        Ok(())
    }
}

fn spawn_device_table_consumer(log: &EventLog, devices: Arc<DeviceTable>) {
    let consumer = log.subscribe("device-table");
    tokio::spawn(async move {
        loop {
            let batch = match consumer.poll(64) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("device table consumer failed: {e}");
                    return;
                }
            };
            if batch.is_empty() {
                let _ = tokio::time::timeout(Duration::from_millis(100), consumer.wait()).await;
                continue;
            }
            for (offset, event) in batch {
                devices.apply(&event.event);
                if consumer.commit(offset).is_err() {
                    return;
                }
            }
        }
    });
}

async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let id = request.id.clone();
                dispatch(&state, request)
                    .await
                    .unwrap_or_else(|e| internal_error(id, e))
            }
            Err(e) => Response::error(None, PARSE_ERROR, format!("unparseable request: {e}")),
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
    }
    Ok(())
}

fn internal_error(id: Option<RequestId>, err: impl std::fmt::Display) -> Response {
    error!("internal error: {err}");
    Response::error(id, INTERNAL_ERROR, "internal server error")
}

async fn dispatch(state: &DaemonState, request: Request) -> Result<Response> {
    let id = request.id.clone();
    let params = request.params;

    let response = match request.method.as_str() {
        "health" => handle_health(state, id).await,
        "plugin.submit" => handle_submit(state, id, params).await,
        "plugin.start" => handle_start(state, id, params).await,
        "plugin.status" => handle_status(state, id, params).await,
        "plugin.list" => handle_list(state, id).await?,
        "plugin.stop" => handle_stop(state, id, params).await,
        "events.stats" => Response::success(
            id,
            json!({
                "pipeline": state.pipeline.stats(),
                "log": state.log.stats(),
            }),
        ),
        "audit.export" => {
            let limit = params
                .get("limit")
                .and_then(Value::as_u64)
                .unwrap_or(100) as usize;
            Response::success(id, serde_json::to_value(state.audit.tail(limit))?)
        }
        "device.simulate" => handle_simulate(state, id, params),
        "config.reload" => handle_reload(state, id),
        "shutdown" => {
            let _ = state.shutdown_tx.send(());
            Response::success(id, json!({ "stopping": true }))
        }
        other => Response::error(id, METHOD_NOT_FOUND, format!("unknown method '{other}'")),
    };
    Ok(response)
}

fn require_str(params: &Value, key: &str) -> Result<String, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing string parameter '{key}'"))
}

async fn handle_health(state: &DaemonState, id: Option<RequestId>) -> Response {
    let sources = state.pipeline.stats().sources;
    let instances = state.lifecycle.list().await.unwrap_or_default();
    let degraded = !state.pipeline.any_source_delivering();

    Response::success(
        id,
        json!({
            "status": if degraded { "degraded" } else { "ok" },
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "sources": sources,
            "instances": instances.len(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn handle_submit(state: &DaemonState, id: Option<RequestId>, params: Value) -> Response {
    let path = match require_str(&params, "path") {
        Ok(path) => PathBuf::from(path),
        Err(e) => return Response::error(id, INVALID_PARAMS, e),
    };
    let start = params.get("start").and_then(Value::as_bool).unwrap_or(true);

    let report = state.registry.submit(&path);
    match &report {
        SubmissionReport::Accepted { plugin_id, .. } if start => {
            let plugin = match state.registry.get(plugin_id) {
                Ok(plugin) => plugin,
                Err(e) => return Response::error(id, INTERNAL_ERROR, e.to_string()),
            };
            match state.lifecycle.load(plugin).await {
                Ok(instance) => Response::success(
                    id,
                    json!({ "report": report, "instance": instance.to_string() }),
                ),
                Err(e) => load_error_response(id, e),
            }
        }
        SubmissionReport::Accepted { .. } => {
            Response::success(id, json!({ "report": report }))
        }
        SubmissionReport::Rejected { rejection, .. } => Response::error_with_data(
            id,
            REJECTED,
            rejection.reason.clone(),
            Some(json!({ "stage": rejection.stage, "code": rejection.code })),
        ),
    }
}

async fn handle_start(state: &DaemonState, id: Option<RequestId>, params: Value) -> Response {
    let plugin_id = match require_str(&params, "id") {
        Ok(plugin_id) => plugin_id,
        Err(e) => return Response::error(id, INVALID_PARAMS, e),
    };
    let plugin = match state.registry.get(&plugin_id) {
        Ok(plugin) => plugin,
        Err(e) => return Response::error(id, UNKNOWN_PLUGIN, e.to_string()),
    };
    match state.lifecycle.load(plugin).await {
        Ok(instance) => Response::success(id, json!({ "instance": instance.to_string() })),
        Err(e) => load_error_response(id, e),
    }
}

async fn handle_status(state: &DaemonState, id: Option<RequestId>, params: Value) -> Response {
    let plugin_id = match require_str(&params, "id") {
        Ok(plugin_id) => plugin_id,
        Err(e) => return Response::error(id, INVALID_PARAMS, e),
    };

    if let Ok(Some(instance)) = state.lifecycle.find(&plugin_id).await {
        if let Ok(Some(status)) = state.lifecycle.status(instance).await {
            return match serde_json::to_value(&status) {
                Ok(value) => Response::success(id, value),
                Err(e) => internal_error(id, e),
            };
        }
    }
    // Validated but never started.
    if state.registry.get(&plugin_id).is_ok() {
        return Response::success(id, json!({ "plugin_id": plugin_id, "state": "validated" }));
    }
    Response::error(id, UNKNOWN_PLUGIN, format!("unknown plugin '{plugin_id}'"))
}

async fn handle_list(state: &DaemonState, id: Option<RequestId>) -> Result<Response> {
    let instances = state.lifecycle.list().await.unwrap_or_default();
    let registered = state.registry.list();
    Ok(Response::success(
        id,
        json!({
            "registered": registered,
            "instances": serde_json::to_value(instances)?,
        }),
    ))
}

async fn handle_stop(state: &DaemonState, id: Option<RequestId>, params: Value) -> Response {
    let plugin_id = match require_str(&params, "id") {
        Ok(plugin_id) => plugin_id,
        Err(e) => return Response::error(id, INVALID_PARAMS, e),
    };
    let instance = match state.lifecycle.find(&plugin_id).await {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            return Response::error(
                id,
                UNKNOWN_PLUGIN,
                format!("no instance for plugin '{plugin_id}'"),
            )
        }
        Err(e) => return internal_error(id, e),
    };
    match state.lifecycle.stop(instance).await {
        Ok(outcome) => Response::success(id, json!({ "outcome": outcome })),
        Err(RuntimeError::WrongState { state: s, .. }) => Response::error(
            id,
            WRONG_STATE,
            format!("instance is {s}, cannot stop"),
        ),
        Err(e) => internal_error(id, e),
    }
}

fn handle_simulate(state: &DaemonState, id: Option<RequestId>, params: Value) -> Response {
    let kind = match params.get("kind").and_then(Value::as_str) {
        Some("attach") => DeviceEventKind::Attach,
        Some("detach") => DeviceEventKind::Detach,
        _ => {
            return Response::error(
                id,
                INVALID_PARAMS,
                "parameter 'kind' must be 'attach' or 'detach'",
            )
        }
    };
    let vendor_id = params.get("vendor_id").and_then(Value::as_u64).unwrap_or(0) as u16;
    let product_id = params.get("product_id").and_then(Value::as_u64).unwrap_or(0) as u16;
    let bus_path = match require_str(&params, "bus_path") {
        Ok(bus_path) => bus_path,
        Err(e) => return Response::error(id, INVALID_PARAMS, e),
    };

    match state.injector.inject(kind, vendor_id, product_id, bus_path) {
        Ok(event) => Response::success(
            id,
            json!({ "signature": event.signature.as_str(), "kind": kind.as_str() }),
        ),
        Err(e) => internal_error(id, e),
    }
}

fn handle_reload(state: &DaemonState, id: Option<RequestId>) -> Response {
    match state.config.reload() {
        Ok(config) => {
            // New policy applies to future submissions and loads only;
            // running instances keep what they were loaded with.
            state.registry.set_validator(validator_from_config(&config));
            Response::success(id, json!({ "reloaded": true }))
        }
        Err(e) => Response::error(id, INVALID_PARAMS, format!("reload failed: {e}")),
    }
}

fn load_error_response(id: Option<RequestId>, err: RuntimeError) -> Response {
    match err {
        RuntimeError::Load(load_error) => {
            let data = serde_json::to_value(&load_error).ok();
            Response::error_with_data(id, REJECTED, load_error.to_string(), data)
        }
        other => internal_error(id, other),
    }
}
