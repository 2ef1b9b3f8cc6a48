//! Pipeline wiring: adapters, conditioner task, publisher task.

use crate::adapter::{AdapterHandle, AdapterSet, SourceHealth};
use crate::batcher::EventBatcher;
use crate::conditioner::{Conditioner, ConditionerStats};
use crate::queue::{EventQueue, QueueStats};
use gantry_config::EventsConfig;
use gantry_core::{CoreError, EventLog};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Aggregate pipeline counters for status queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub conditioner: ConditionerStats,
    pub queue: QueueStats,
    pub published: u64,
    pub publish_retries: u64,
    pub sources: HashMap<String, SourceHealth>,
}

struct PublisherCounters {
    published: AtomicU64,
    retries: AtomicU64,
}

/// The assembled event pipeline.
pub struct EventPipeline;

impl EventPipeline {
    /// Wire sources through conditioning into the log and start everything.
    pub fn start(config: &EventsConfig, log: EventLog, adapters: AdapterSet) -> PipelineHandle {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let adapter = adapters.spawn(raw_tx);

        let conditioner = Arc::new(Mutex::new(Conditioner::new(
            Duration::from_millis(config.debounce_window_ms),
            config.rate_capacity,
            Duration::from_millis(config.rate_interval_ms),
        )));
        let queue = Arc::new(Mutex::new(EventQueue::new(config.queue_capacity)));
        let queue_notify = Arc::new(Notify::new());
        let counters = Arc::new(PublisherCounters {
            published: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });

        let conditioner_task = tokio::spawn(Self::run_conditioner(
            raw_rx,
            Arc::clone(&conditioner),
            EventBatcher::new(config.batch_max_size),
            Arc::clone(&queue),
            Arc::clone(&queue_notify),
            Duration::from_millis(config.debounce_window_ms),
        ));

        let publisher_task = tokio::spawn(Self::run_publisher(
            log,
            Arc::clone(&queue),
            Arc::clone(&queue_notify),
            Arc::clone(&counters),
        ));

        info!("event pipeline started");
        PipelineHandle {
            adapter,
            conditioner,
            queue,
            counters,
            conditioner_task,
            publisher_task,
        }
    }

    async fn run_conditioner(
        mut raw_rx: mpsc::UnboundedReceiver<gantry_core::DeviceEvent>,
        conditioner: Arc<Mutex<Conditioner>>,
        batcher: EventBatcher,
        queue: Arc<Mutex<EventQueue>>,
        queue_notify: Arc<Notify>,
        window: Duration,
    ) {
        // Tick a few times per window so flush latency stays well under one
        // extra window.
        let tick = (window / 4).max(Duration::from_millis(5));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = raw_rx.recv() => match maybe {
                    Some(event) => conditioner.lock().offer(event),
                    None => break,
                },
                _ = ticker.tick() => {
                    let due = conditioner.lock().flush_due(std::time::Instant::now());
                    if !due.is_empty() {
                        let stamped = batcher.stamp(due);
                        let mut q = queue.lock();
                        for event in stamped {
                            q.push(event);
                        }
                        drop(q);
                        queue_notify.notify_waiters();
                    }
                }
            }
        }

        // Sources are gone; drain what is left so nothing silently vanishes.
        let remaining = conditioner.lock().flush_all();
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "draining conditioner on shutdown");
            let stamped = batcher.stamp(remaining);
            let mut q = queue.lock();
            for event in stamped {
                q.push(event);
            }
        }
        queue_notify.notify_waiters();
    }

    async fn run_publisher(
        log: EventLog,
        queue: Arc<Mutex<EventQueue>>,
        queue_notify: Arc<Notify>,
        counters: Arc<PublisherCounters>,
    ) {
        let mut backoff = Duration::from_millis(50);
        const MAX_BACKOFF: Duration = Duration::from_secs(5);

        loop {
            let next = queue.lock().pop();
            match next {
                Some(event) => match log.append(event.clone()) {
                    Ok(_) => {
                        counters.published.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("gantry_events_published_total").increment(1);
                        backoff = Duration::from_millis(50);
                    }
                    Err(e) => {
                        // Retention pressure or sink failure: put the event
                        // back and retry with backoff. The bounded queue
                        // absorbs the overflow and drops, counted, past
                        // capacity.
                        match &e {
                            CoreError::RetentionExhausted { .. } => {
                                debug!("event log full, backing off: {e}")
                            }
                            other => warn!("event log append failed: {other}"),
                        }
                        queue.lock().push_front(event);
                        counters.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                },
                // The timeout bounds the notify race between a pop that saw
                // an empty queue and a push that already notified.
                None => {
                    let _ = tokio::time::timeout(
                        Duration::from_millis(100),
                        queue_notify.notified(),
                    )
                    .await;
                }
            }
        }
    }
}

/// Handle onto the running pipeline.
pub struct PipelineHandle {
    adapter: AdapterHandle,
    conditioner: Arc<Mutex<Conditioner>>,
    queue: Arc<Mutex<EventQueue>>,
    counters: Arc<PublisherCounters>,
    conditioner_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            conditioner: self.conditioner.lock().stats(),
            queue: self.queue.lock().stats(),
            published: self.counters.published.load(Ordering::Relaxed),
            publish_retries: self.counters.retries.load(Ordering::Relaxed),
            sources: self.adapter.health(),
        }
    }

    /// True while at least one source is delivering.
    pub fn any_source_delivering(&self) -> bool {
        self.adapter.any_delivering()
    }

    /// Tear the pipeline down (daemon shutdown).
    pub fn shutdown(&self) {
        self.adapter.shutdown();
        self.conditioner_task.abort();
        self.publisher_task.abort();
    }
}
