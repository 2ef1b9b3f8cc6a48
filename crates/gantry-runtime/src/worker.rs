//! The isolated worker: one Lua VM on one dedicated thread.
//!
//! Isolation properties, in order of importance:
//!
//! - no shared memory: the VM lives and dies on its own thread; the only
//!   way in or out is the inbox/outbox channel pair owned by the boundary
//! - heap ceiling: the VM allocator refuses allocations past its limit,
//!   which is set with headroom above the policy ceiling so the enforcer
//!   sees a breach before the allocator hard-stops it
//! - interrupt hook: every N VM instructions the kill flag is checked, so a
//!   busy-looping script can be aborted without OS-level thread murder
//! - reduced stdlib: `table`, `string`, and `math` only; `os`, `io`, and
//!   `require` never exist inside the VM, host facilities arrive solely as
//!   boundary messages

use crate::messages::{HostCall, HostCallResult, WorkerMessage, WorkerRequest, WorkerUsage};
use mlua::{Function, HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Value, VmState};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Worker tuning derived from the instance's resource policy.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// VM allocator ceiling; kept above the policy heap ceiling so the
    /// enforcer observes the breach first.
    pub vm_memory_limit: usize,

    /// Instructions between kill-flag checks.
    pub hook_interval: u32,

    /// How long a blocking host call may wait for its reply.
    pub host_call_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            vm_memory_limit: 128 * 1024 * 1024,
            hook_interval: 4096,
            host_call_timeout: Duration::from_secs(5),
        }
    }
}

/// Host-side handle onto a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: Uuid,
    plugin_id: String,
    inbox: Mutex<Option<flume::Sender<WorkerRequest>>>,
    kill: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    throttle_ms: Arc<AtomicU64>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Queue a request, applying backpressure through the bounded inbox.
    pub async fn send(&self, request: WorkerRequest) -> Result<(), WorkerGone> {
        let sender = self.inbox.lock().as_ref().cloned().ok_or(WorkerGone)?;
        sender.send_async(request).await.map_err(|_| WorkerGone)
    }

    /// Non-blocking send for shutdown requests.
    pub fn try_send(&self, request: WorkerRequest) -> Result<(), WorkerGone> {
        let sender = self.inbox.lock().as_ref().cloned().ok_or(WorkerGone)?;
        sender.try_send(request).map_err(|_| WorkerGone)
    }

    /// True once the worker thread has finished.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Per-instance throttle: the dispatcher sleeps this long before each
    /// delivery. Zero means unthrottled.
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms.load(Ordering::Relaxed))
    }

    pub fn set_throttle(&self, delay: Duration) {
        self.throttle_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Forced termination: raise the kill flag (aborting any running script
    /// at the next hook) and close the inbox so a blocked receive wakes up.
    pub fn force_kill(&self) {
        warn!(worker = %self.id, plugin = %self.plugin_id, "force-killing worker");
        self.kill.store(true, Ordering::SeqCst);
        self.inbox.lock().take();
    }

    /// Wait (off the async runtime) for the thread to finish.
    pub fn join(&self) {
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                warn!(worker = %self.id, "worker thread panicked");
            }
        }
    }
}

/// The worker is no longer accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerGone;

impl std::fmt::Display for WorkerGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("worker is gone")
    }
}

impl std::error::Error for WorkerGone {}

/// A freshly spawned worker plus the channel ends the boundary pump owns.
pub(crate) struct SpawnedWorker {
    pub handle: WorkerHandle,
    pub outbox_rx: flume::Receiver<WorkerMessage>,
    pub host_reply_tx: flume::Sender<HostCallResult>,
}

/// Spawn the worker thread for a plugin entry point.
pub(crate) fn spawn(
    plugin_id: String,
    entry_source: String,
    config: WorkerConfig,
) -> std::io::Result<SpawnedWorker> {
    let (inbox_tx, inbox_rx) = flume::bounded::<WorkerRequest>(64);
    let (outbox_tx, outbox_rx) = flume::unbounded::<WorkerMessage>();
    let (host_reply_tx, host_reply_rx) = flume::bounded::<HostCallResult>(1);

    let kill = Arc::new(AtomicBool::new(false));
    let exited = Arc::new(AtomicBool::new(false));
    let id = Uuid::new_v4();

    let thread = {
        let kill = Arc::clone(&kill);
        let exited = Arc::clone(&exited);
        let plugin = plugin_id.clone();
        std::thread::Builder::new()
            .name(format!("gantry-worker-{plugin}"))
            .spawn(move || {
                worker_main(
                    plugin,
                    entry_source,
                    config,
                    inbox_rx,
                    outbox_tx,
                    host_reply_rx,
                    kill,
                );
                exited.store(true, Ordering::SeqCst);
            })?
    };

    Ok(SpawnedWorker {
        handle: WorkerHandle {
            id,
            plugin_id,
            inbox: Mutex::new(Some(inbox_tx)),
            kill,
            exited,
            throttle_ms: Arc::new(AtomicU64::new(0)),
            join: Mutex::new(Some(thread)),
        },
        outbox_rx,
        host_reply_tx,
    })
}

fn worker_main(
    plugin_id: String,
    entry_source: String,
    config: WorkerConfig,
    inbox: flume::Receiver<WorkerRequest>,
    outbox: flume::Sender<WorkerMessage>,
    host_reply: flume::Receiver<HostCallResult>,
    kill: Arc<AtomicBool>,
) {
    let (lua, on_event) = match prime_vm(
        &entry_source,
        &config,
        outbox.clone(),
        host_reply,
        Arc::clone(&kill),
    ) {
        Ok(primed) => primed,
        Err(e) => {
            let _ = outbox.send(WorkerMessage::InitFailed {
                reason: e.to_string(),
            });
            return;
        }
    };

    if outbox.send(WorkerMessage::Ready).is_err() {
        return;
    }
    debug!(plugin = %plugin_id, "worker ready");

    let mut busy_ns: u64 = 0;
    let mut ops: u64 = 0;

    while !kill.load(Ordering::SeqCst) {
        // A timeout keeps the kill flag observable while idle.
        let request = match inbox.recv_timeout(Duration::from_millis(100)) {
            Ok(request) => request,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };

        match request {
            WorkerRequest::DeliverEvent { sequence, payload } => {
                let started = Instant::now();
                let outcome = deliver(&lua, &on_event, &payload);
                busy_ns += started.elapsed().as_nanos() as u64;
                ops += 1;

                let usage = WorkerUsage {
                    heap_bytes: lua.used_memory() as u64,
                    busy_ns,
                    ops_handled: ops,
                };
                let message = match outcome {
                    Ok(()) => WorkerMessage::EventHandled { sequence, usage },
                    Err(e) => WorkerMessage::EventFailed {
                        sequence,
                        error: e.to_string(),
                        usage,
                    },
                };
                if outbox.send(message).is_err() {
                    break;
                }
            }
            WorkerRequest::Shutdown => {
                trace!(plugin = %plugin_id, "worker received shutdown");
                run_on_stop(&lua);
                let _ = outbox.send(WorkerMessage::ShuttingDown);
                break;
            }
        }
    }
    debug!(plugin = %plugin_id, "worker exiting");
}

fn prime_vm(
    entry_source: &str,
    config: &WorkerConfig,
    outbox: flume::Sender<WorkerMessage>,
    host_reply: flume::Receiver<HostCallResult>,
    kill: Arc<AtomicBool>,
) -> mlua::Result<(Lua, Function)> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(config.vm_memory_limit)?;

    {
        let kill = Arc::clone(&kill);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(config.hook_interval),
            move |_lua, _debug| {
                if kill.load(Ordering::Relaxed) {
                    Err(mlua::Error::runtime("terminated by host"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );
    }

    register_host_api(&lua, config, outbox, host_reply)?;

    lua.load(entry_source).exec()?;

    let on_event: Function = lua.globals().get("on_event").map_err(|_| {
        mlua::Error::runtime("entry point does not define a global on_event function")
    })?;

    Ok((lua, on_event))
}

/// Expose the boundary facilities as the `gantry` table.
///
/// Every function is a thin shim that ships a [`HostCall`] through the
/// outbox and blocks on the reply; policy decisions all happen host-side.
fn register_host_api(
    lua: &Lua,
    config: &WorkerConfig,
    outbox: flume::Sender<WorkerMessage>,
    host_reply: flume::Receiver<HostCallResult>,
) -> mlua::Result<()> {
    let gantry = lua.create_table()?;
    let timeout = config.host_call_timeout;

    macro_rules! host_fn {
        ($name:literal, |$($arg:ident : $ty:ty),*| $call:expr) => {{
            let outbox = outbox.clone();
            let host_reply = host_reply.clone();
            gantry.set(
                $name,
                lua.create_function(move |lua, ($($arg,)*): ($($ty,)*)| {
                    dispatch_host_call(lua, &outbox, &host_reply, timeout, $call)
                })?,
            )?;
        }};
    }

    host_fn!("fs_read", |path: String| HostCall::FsRead {
        path: PathBuf::from(path)
    });
    host_fn!("fs_write", |path: String, contents: String| {
        HostCall::FsWrite {
            path: PathBuf::from(path),
            contents,
        }
    });
    host_fn!("net_probe", |host: String, port: u16| HostCall::NetProbe {
        host,
        port
    });
    host_fn!("system_info", |facility: String| HostCall::SystemInfo {
        facility
    });
    {
        let outbox = outbox.clone();
        let host_reply = host_reply.clone();
        gantry.set(
            "list_devices",
            lua.create_function(move |lua, ()| {
                dispatch_host_call(lua, &outbox, &host_reply, timeout, HostCall::ListDevices)
            })?,
        )?;
    }
    {
        let outbox = outbox.clone();
        gantry.set(
            "log",
            lua.create_function(move |_lua, message: String| {
                outbox
                    .send(WorkerMessage::Log { message })
                    .map_err(|_| mlua::Error::runtime("host channel closed"))
            })?,
        )?;
    }

    lua.globals().set("gantry", gantry)?;
    Ok(())
}

fn dispatch_host_call(
    lua: &Lua,
    outbox: &flume::Sender<WorkerMessage>,
    host_reply: &flume::Receiver<HostCallResult>,
    timeout: Duration,
    call: HostCall,
) -> mlua::Result<Value> {
    outbox
        .send(WorkerMessage::HostCall { call })
        .map_err(|_| mlua::Error::runtime("host channel closed"))?;

    match host_reply.recv_timeout(timeout) {
        Ok(HostCallResult::Ok { value }) => lua.to_value(&value),
        Ok(HostCallResult::Denied { reason }) => {
            Err(mlua::Error::runtime(format!("denied: {reason}")))
        }
        Ok(HostCallResult::Failed { reason }) => {
            Err(mlua::Error::runtime(format!("host call failed: {reason}")))
        }
        Err(_) => Err(mlua::Error::runtime("host call timed out")),
    }
}

fn deliver(lua: &Lua, on_event: &Function, payload: &serde_json::Value) -> mlua::Result<()> {
    let value = lua.to_value(payload)?;
    on_event.call::<()>(value)
}

fn run_on_stop(lua: &Lua) {
    if let Ok(on_stop) = lua.globals().get::<Function>("on_stop") {
        if let Err(e) = on_stop.call::<()>(()) {
            debug!("on_stop raised: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER_PLUGIN: &str = r#"
count = 0
function on_event(event)
    count = count + 1
end
"#;

    fn spawn_ready(source: &str) -> SpawnedWorker {
        let spawned = spawn("test-plugin".into(), source.into(), WorkerConfig::default()).unwrap();
        match spawned
            .outbox_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("worker should report")
        {
            WorkerMessage::Ready => {}
            other => panic!("expected Ready, got {other:?}"),
        }
        spawned
    }

    fn event_payload() -> serde_json::Value {
        serde_json::json!({ "kind": "attach", "bus_path": "usb:1-1" })
    }

    #[tokio::test]
    async fn worker_handles_events_and_reports_usage() {
        let spawned = spawn_ready(COUNTER_PLUGIN);

        for seq in 0..3u64 {
            spawned
                .handle
                .send(WorkerRequest::DeliverEvent {
                    sequence: seq,
                    payload: event_payload(),
                })
                .await
                .unwrap();
        }

        for seq in 0..3u64 {
            match spawned.outbox_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                WorkerMessage::EventHandled { sequence, usage } => {
                    assert_eq!(sequence, seq);
                    assert_eq!(usage.ops_handled, seq + 1);
                    assert!(usage.heap_bytes > 0);
                }
                other => panic!("expected EventHandled, got {other:?}"),
            }
        }

        spawned.handle.try_send(WorkerRequest::Shutdown).unwrap();
        assert!(matches!(
            spawned.outbox_rx.recv_timeout(Duration::from_secs(5)),
            Ok(WorkerMessage::ShuttingDown)
        ));
        spawned.handle.join();
        assert!(spawned.handle.has_exited());
    }

    #[tokio::test]
    async fn handler_error_reports_event_failed() {
        let spawned = spawn_ready("function on_event(e) error('boom') end");

        spawned
            .handle
            .send(WorkerRequest::DeliverEvent {
                sequence: 7,
                payload: event_payload(),
            })
            .await
            .unwrap();

        match spawned.outbox_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerMessage::EventFailed { sequence, error, .. } => {
                assert_eq!(sequence, 7);
                assert!(error.contains("boom"));
            }
            other => panic!("expected EventFailed, got {other:?}"),
        }

        spawned.handle.force_kill();
        spawned.handle.join();
    }

    #[test]
    fn missing_on_event_fails_init() {
        let spawned = spawn("bad".into(), "x = 1".into(), WorkerConfig::default()).unwrap();
        match spawned.outbox_rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            WorkerMessage::InitFailed { reason } => assert!(reason.contains("on_event")),
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[test]
    fn syntax_error_fails_init() {
        let spawned = spawn("bad".into(), "function (".into(), WorkerConfig::default()).unwrap();
        assert!(matches!(
            spawned.outbox_rx.recv_timeout(Duration::from_secs(10)),
            Ok(WorkerMessage::InitFailed { .. })
        ));
    }

    #[tokio::test]
    async fn busy_loop_is_killed_by_interrupt_hook() {
        let spawned = spawn_ready("function on_event(e) while true do end end");

        spawned
            .handle
            .send(WorkerRequest::DeliverEvent {
                sequence: 0,
                payload: event_payload(),
            })
            .await
            .unwrap();

        // Let the loop spin, then pull the plug.
        tokio::time::sleep(Duration::from_millis(100)).await;
        spawned.handle.force_kill();

        let joined = tokio::task::spawn_blocking(move || {
            spawned.handle.join();
            spawned.handle.has_exited()
        })
        .await
        .unwrap();
        assert!(joined, "worker thread must exit after force_kill");
    }

    #[test]
    fn stdlib_is_reduced() {
        let spawned = spawn(
            "probe".into(),
            r#"
if os ~= nil or io ~= nil or require ~= nil then
    error("ambient authority leaked into the sandbox")
end
function on_event(e) end
"#
            .into(),
            WorkerConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            spawned.outbox_rx.recv_timeout(Duration::from_secs(10)),
            Ok(WorkerMessage::Ready)
        ));
        spawned.handle.force_kill();
        spawned.handle.join();
    }

    #[tokio::test]
    async fn log_messages_flow_through_outbox() {
        let spawned = spawn_ready(
            r#"
function on_event(e)
    gantry.log("saw " .. e.bus_path)
end
"#,
        );

        spawned
            .handle
            .send(WorkerRequest::DeliverEvent {
                sequence: 0,
                payload: event_payload(),
            })
            .await
            .unwrap();

        let mut saw_log = false;
        for _ in 0..2 {
            match spawned.outbox_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                WorkerMessage::Log { message } => {
                    assert_eq!(message, "saw usb:1-1");
                    saw_log = true;
                }
                WorkerMessage::EventHandled { .. } => {}
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(saw_log);

        spawned.handle.force_kill();
        spawned.handle.join();
    }

    #[tokio::test]
    async fn denied_host_call_surfaces_as_lua_error() {
        let spawned = spawn_ready(
            r#"
function on_event(e)
    gantry.fs_read("/etc/passwd")
end
"#,
        );

        spawned
            .handle
            .send(WorkerRequest::DeliverEvent {
                sequence: 0,
                payload: event_payload(),
            })
            .await
            .unwrap();

        // Play the boundary: receive the call, refuse it.
        match spawned.outbox_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerMessage::HostCall { call } => {
                assert_eq!(call.kind(), "fs_read");
                spawned
                    .host_reply_tx
                    .send(HostCallResult::Denied {
                        reason: "path outside declared roots".into(),
                    })
                    .unwrap();
            }
            other => panic!("expected HostCall, got {other:?}"),
        }

        match spawned.outbox_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerMessage::EventFailed { error, .. } => {
                assert!(error.contains("denied"), "error was: {error}");
            }
            other => panic!("expected EventFailed, got {other:?}"),
        }

        spawned.handle.force_kill();
        spawned.handle.join();
    }
}
