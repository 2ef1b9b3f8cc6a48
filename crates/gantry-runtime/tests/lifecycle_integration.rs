//! End-to-end lifecycle scenarios against real Lua workers.

use gantry_core::{
    AuditRecord, AuditTrail, ConditionedEvent, DeviceEvent, DeviceEventKind, EventLog,
    EventLogConfig, InstanceId, LifecycleState, ResourcePolicy, SecurityLevel, SourceId,
    ViolationKind,
};
use gantry_plugins::{PluginManifest, ValidatedPlugin};
use gantry_runtime::{
    BehaviorThresholds, DeviceTable, LifecycleHandle, LifecycleManager, RuntimeSettings,
    StopOutcome,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    log: EventLog,
    audit: AuditTrail,
    lifecycle: LifecycleHandle,
    _dir: tempfile::TempDir,
    package_dir: std::path::PathBuf,
}

fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        pool_max: 4,
        load_timeout: Duration::from_secs(20),
        recycle_after_ops: 0,
        monitor_interval: Duration::from_millis(100),
        hard_breach_multiplier: 1.5,
        strict_boundary: false,
        thresholds: BehaviorThresholds {
            errors_per_minute: 3,
            violation_count: 50,
            events_per_minute: 1_000_000,
        },
    }
}

async fn harness(entry: &str, settings: RuntimeSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let package_dir = dir.path().to_path_buf();
    std::fs::write(package_dir.join("init.lua"), entry).unwrap();

    let log = EventLog::open(EventLogConfig::default()).unwrap();
    let (audit, writer) = AuditTrail::new(None, 256).unwrap();
    tokio::spawn(writer.run());

    let lifecycle = LifecycleManager::start(
        settings,
        log.clone(),
        audit.clone(),
        Arc::new(DeviceTable::new()),
    );

    Harness {
        log,
        audit,
        lifecycle,
        _dir: dir,
        package_dir,
    }
}

fn plugin(package_dir: &Path, policy: ResourcePolicy) -> ValidatedPlugin {
    let manifest = PluginManifest::from_yaml(
        r#"
id: scenario-plugin
version: "1.0.0"
permissions:
  usb:
    - "*:*"
"#,
    )
    .unwrap();
    ValidatedPlugin {
        manifest: Arc::new(manifest),
        package_dir: package_dir.to_path_buf(),
        policy,
        security_level: SecurityLevel::Medium,
    }
}

fn attach_event(sequence: u64, bus: &str) -> ConditionedEvent {
    ConditionedEvent {
        sequence,
        batch_id: Uuid::new_v4(),
        event: DeviceEvent::new(
            DeviceEventKind::Attach,
            0x046d,
            0xc52b,
            bus,
            SourceId::new("test"),
        ),
    }
}

async fn wait_for_state(
    lifecycle: &LifecycleHandle,
    instance: InstanceId,
    wanted: LifecycleState,
    timeout: Duration,
) {
    tokio::time::timeout(timeout, async {
        loop {
            if let Ok(Some(status)) = lifecycle.status(instance).await {
                if status.state == wanted {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("instance never reached {wanted}"));
}

#[tokio::test]
async fn running_instance_stops_gracefully() {
    let h = harness("function on_event(e) end", fast_settings()).await;
    let policy = ResourcePolicy::for_level(SecurityLevel::Medium);
    let instance = h
        .lifecycle
        .load(plugin(&h.package_dir, policy))
        .await
        .unwrap();

    wait_for_state(&h.lifecycle, instance, LifecycleState::Running, Duration::from_secs(5)).await;

    let outcome = h.lifecycle.stop(instance).await.unwrap();
    assert_eq!(outcome, StopOutcome::StoppedGracefully);

    let status = h.lifecycle.status(instance).await.unwrap().unwrap();
    assert_eq!(status.state, LifecycleState::Stopped);
}

#[tokio::test]
async fn terminal_state_admits_no_further_operations() {
    let h = harness("function on_event(e) end", fast_settings()).await;
    let policy = ResourcePolicy::for_level(SecurityLevel::Medium);
    let instance = h
        .lifecycle
        .load(plugin(&h.package_dir, policy))
        .await
        .unwrap();

    wait_for_state(&h.lifecycle, instance, LifecycleState::Running, Duration::from_secs(5)).await;
    h.lifecycle.stop(instance).await.unwrap();

    // A second stop must be refused, not hang or transition anywhere.
    assert!(h.lifecycle.stop(instance).await.is_err());
    let status = h.lifecycle.status(instance).await.unwrap().unwrap();
    assert_eq!(status.state, LifecycleState::Stopped);
}

#[tokio::test]
async fn events_are_delivered_and_handled() {
    let h = harness(
        r#"
handled = 0
function on_event(e)
    handled = handled + 1
    gantry.log("handled " .. e.bus_path)
end
"#,
        fast_settings(),
    )
    .await;
    let policy = ResourcePolicy::for_level(SecurityLevel::Medium);
    let instance = h
        .lifecycle
        .load(plugin(&h.package_dir, policy))
        .await
        .unwrap();
    wait_for_state(&h.lifecycle, instance, LifecycleState::Running, Duration::from_secs(5)).await;

    for i in 0..3 {
        h.log.append(attach_event(i, &format!("usb:1-{i}"))).unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(Some(status)) = h.lifecycle.status(instance).await {
                if status.usage.ops_handled >= 3 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("all three events should be handled");

    h.lifecycle.stop(instance).await.unwrap();
}

#[tokio::test]
async fn heap_breach_beyond_grace_blocks_instance() {
    // Behavioral escalation is effectively off so the resource path alone
    // must produce the containment.
    let mut settings = fast_settings();
    settings.thresholds.errors_per_minute = 1_000_000;

    // Each event grows a retained global table; the policy ceiling is tiny.
    let h = harness(
        r#"
data = {}
function on_event(e)
    for i = 1, 2000 do
        data[#data + 1] = string.rep("x", 128)
    end
end
"#,
        settings,
    )
    .await;

    let policy = ResourcePolicy {
        max_heap_bytes: 256 * 1024,
        max_cpu_percent: 100.0,
        max_message_bytes: 256 * 1024,
        grace_period: Duration::from_millis(300),
    };
    let instance = h
        .lifecycle
        .load(plugin(&h.package_dir, policy))
        .await
        .unwrap();
    wait_for_state(&h.lifecycle, instance, LifecycleState::Running, Duration::from_secs(5)).await;

    // Keep feeding events until containment kicks in.
    let feeder = {
        let log = h.log.clone();
        tokio::spawn(async move {
            for i in 0..200u64 {
                if log.append(attach_event(i, "usb:9-9")).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
    };

    wait_for_state(&h.lifecycle, instance, LifecycleState::Blocked, Duration::from_secs(30)).await;
    feeder.abort();

    // The breach is on the audit trail as a resource violation.
    let tail = h.audit.tail(512);
    let has_breach = tail.iter().any(|record| {
        matches!(
            record,
            AuditRecord::Violation(v) if v.kind == ViolationKind::ResourceBreach
        )
    });
    assert!(has_breach, "audit trail must record the resource breach");

    // Blocked is terminal: no stop, no resume.
    assert!(h.lifecycle.stop(instance).await.is_err());
}

#[tokio::test]
async fn error_storm_escalates_to_blocked() {
    let h = harness("function on_event(e) error('always broken') end", fast_settings()).await;
    let policy = ResourcePolicy::for_level(SecurityLevel::Medium);
    let instance = h
        .lifecycle
        .load(plugin(&h.package_dir, policy))
        .await
        .unwrap();
    wait_for_state(&h.lifecycle, instance, LifecycleState::Running, Duration::from_secs(5)).await;

    for i in 0..10 {
        h.log.append(attach_event(i, &format!("usb:2-{i}"))).unwrap();
    }

    // Behavioral path, no resource breach involved: errors/minute crosses
    // the threshold and the monitor escalates.
    wait_for_state(&h.lifecycle, instance, LifecycleState::Blocked, Duration::from_secs(30)).await;

    let tail = h.audit.tail(512);
    let has_anomaly = tail.iter().any(|record| {
        matches!(
            record,
            AuditRecord::Violation(v) if v.kind == ViolationKind::BehavioralAnomaly
        )
    });
    assert!(has_anomaly, "audit trail must record the anomaly");
}

#[tokio::test]
async fn undeclared_events_are_not_delivered() {
    // Plugin declares a single vendor filter; events from another vendor
    // must never reach its handler.
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("init.lua"),
        "handled = 0\nfunction on_event(e) handled = handled + 1 end",
    )
    .unwrap();

    let log = EventLog::open(EventLogConfig::default()).unwrap();
    let (audit, writer) = AuditTrail::new(None, 64).unwrap();
    tokio::spawn(writer.run());
    let lifecycle = LifecycleManager::start(
        fast_settings(),
        log.clone(),
        audit.clone(),
        Arc::new(DeviceTable::new()),
    );

    let manifest = PluginManifest::from_yaml(
        "id: narrow\nversion: \"1.0\"\npermissions:\n  usb:\n    - \"aaaa:*\"\n",
    )
    .unwrap();
    let validated = ValidatedPlugin {
        manifest: Arc::new(manifest),
        package_dir: dir.path().to_path_buf(),
        policy: ResourcePolicy::for_level(SecurityLevel::Medium),
        security_level: SecurityLevel::Medium,
    };
    let instance = lifecycle.load(validated).await.unwrap();
    wait_for_state(&lifecycle, instance, LifecycleState::Running, Duration::from_secs(5)).await;

    // 0x046d does not match the declared aaaa vendor.
    for i in 0..5 {
        log.append(attach_event(i, &format!("usb:3-{i}"))).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = lifecycle.status(instance).await.unwrap().unwrap();
    assert_eq!(status.usage.ops_handled, 0, "filtered events must not be delivered");

    lifecycle.stop(instance).await.unwrap();
}
