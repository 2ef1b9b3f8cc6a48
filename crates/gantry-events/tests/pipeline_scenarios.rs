//! Conditioning pipeline scenarios, end to end through the event log.

use gantry_config::EventsConfig;
use gantry_core::{DeviceEventKind, EventLog, EventLogConfig};
use gantry_events::{AdapterSet, ChannelSource, DeviceSource, EventPipeline};
use std::sync::Arc;
use std::time::Duration;

fn config(window_ms: u64) -> EventsConfig {
    EventsConfig {
        debounce_window_ms: window_ms,
        rate_capacity: 10_000,
        rate_interval_ms: 1,
        queue_capacity: 256,
        batch_max_size: 32,
        poll_interval_ms: 1000,
        device_dir: "/dev/bus/usb".into(),
    }
}

struct Rig {
    consumer: gantry_core::Consumer,
    injector: gantry_events::DeviceInjector,
    pipeline: gantry_events::PipelineHandle,
}

fn rig(window_ms: u64) -> Rig {
    let log = EventLog::open(EventLogConfig::default()).unwrap();
    let consumer = log.subscribe("scenario");
    let (source, injector) = ChannelSource::new();
    let adapters = AdapterSet::new().with_source(Arc::new(source) as Arc<dyn DeviceSource>);
    let pipeline = EventPipeline::start(&config(window_ms), log, adapters);
    Rig {
        consumer,
        injector,
        pipeline,
    }
}

async fn drain_for(rig: &Rig, wait: Duration) -> Vec<(u64, Arc<gantry_core::ConditionedEvent>)> {
    tokio::time::sleep(wait).await;
    rig.consumer.poll(1000).unwrap()
}

#[tokio::test]
async fn flap_inside_window_yields_no_events() {
    let r = rig(60);

    r.injector
        .inject(DeviceEventKind::Attach, 0x1d6b, 0x0002, "flappy")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    r.injector
        .inject(DeviceEventKind::Detach, 0x1d6b, 0x0002, "flappy")
        .unwrap();

    let published = drain_for(&r, Duration::from_millis(300)).await;
    assert!(
        published.is_empty(),
        "flap must be suppressed entirely, got {published:?}"
    );
    assert_eq!(r.pipeline.stats().conditioner.flaps_suppressed, 1);

    r.pipeline.shutdown();
}

#[tokio::test]
async fn attach_and_later_detach_both_publish_in_order() {
    let r = rig(40);

    r.injector
        .inject(DeviceEventKind::Attach, 0x1d6b, 0x0002, "steady")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    r.injector
        .inject(DeviceEventKind::Detach, 0x1d6b, 0x0002, "steady")
        .unwrap();

    let published = drain_for(&r, Duration::from_millis(300)).await;
    let kinds: Vec<DeviceEventKind> = published.iter().map(|(_, e)| e.event.kind).collect();
    assert_eq!(kinds, vec![DeviceEventKind::Attach, DeviceEventKind::Detach]);

    // Sequences are strictly increasing.
    let sequences: Vec<u64> = published.iter().map(|(_, e)| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    r.pipeline.shutdown();
}

#[tokio::test]
async fn distinct_devices_all_publish() {
    let r = rig(40);

    for i in 0..5u16 {
        r.injector
            .inject(DeviceEventKind::Attach, 0x1d6b, i, format!("usb:1-{i}"))
            .unwrap();
    }

    let published = drain_for(&r, Duration::from_millis(300)).await;
    assert_eq!(published.len(), 5);

    // Near-simultaneous arrivals land in one or two flush windows at most.
    let mut batch_ids: Vec<_> = published.iter().map(|(_, e)| e.batch_id).collect();
    batch_ids.dedup();
    assert!(batch_ids.len() <= 2, "batching went unexpectedly fine-grained");

    r.pipeline.shutdown();
}

#[tokio::test]
async fn rate_ceiling_drops_are_counted_not_queued() {
    let log = EventLog::open(EventLogConfig::default()).unwrap();
    let consumer = log.subscribe("scenario");
    let (source, injector) = ChannelSource::new();
    let adapters = AdapterSet::new().with_source(Arc::new(source) as Arc<dyn DeviceSource>);

    let mut cfg = config(30);
    cfg.rate_capacity = 3;
    cfg.rate_interval_ms = 60_000;
    let pipeline = EventPipeline::start(&cfg, log.clone(), adapters);

    for i in 0..20u16 {
        injector
            .inject(DeviceEventKind::Attach, 0x1d6b, i, format!("usb:2-{i}"))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let published = consumer.poll(1000).unwrap();
    assert_eq!(published.len(), 3, "only the rate budget publishes");

    let stats = pipeline.stats();
    assert_eq!(stats.conditioner.rate_dropped, 17);
    assert_eq!(stats.conditioner.accepted, 3);

    pipeline.shutdown();
}

#[tokio::test]
async fn bounded_queue_survives_pinned_log() {
    // A never-committing group with tiny retention makes the log refuse
    // appends; the pipeline must keep memory bounded and count drops.
    let log = EventLog::open(EventLogConfig {
        retention: 2,
        persist_dir: None,
    })
    .unwrap();
    let _pinner = log.subscribe("pinned");

    let (source, injector) = ChannelSource::new();
    let adapters = AdapterSet::new().with_source(Arc::new(source) as Arc<dyn DeviceSource>);
    let mut cfg = config(20);
    cfg.queue_capacity = 8;
    let pipeline = EventPipeline::start(&cfg, log.clone(), adapters);

    for i in 0..100u16 {
        injector
            .inject(DeviceEventKind::Attach, 0x1d6b, i, format!("usb:3-{i}"))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = pipeline.stats();
    assert!(stats.queue.current_size <= 8, "queue stays bounded");
    assert!(stats.queue.dropped > 0, "overflow is counted, not absorbed");
    assert!(stats.published <= 2, "log accepted at most its retention");

    pipeline.shutdown();
}
