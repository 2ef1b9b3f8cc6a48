//! The event log: append-only, ordered, multi-consumer.
//!
//! Writers append and never mutate existing entries. Each consumer group
//! reads independently through its own committed offset, so a slow consumer
//! never blocks appends or other groups; what it *can* do is pin retention,
//! in which case the log refuses further appends and the conditioner's
//! bounded queue upstream absorbs (and eventually drops, counted) the
//! overflow. Memory stays bounded either way.
//!
//! When a persist directory is configured every appended event is also
//! written as one JSON line to `events.jsonl`, append-only.

use crate::error::{CoreError, Result};
use crate::event::ConditionedEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Event log tuning.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Maximum events held in the in-memory segment.
    pub retention: usize,

    /// Directory for the JSONL sink; `None` keeps the log memory-only.
    pub persist_dir: Option<PathBuf>,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retention: 4096,
            persist_dir: None,
        }
    }
}

struct LogState {
    /// Offset of `entries[0]`.
    base_offset: u64,
    /// The in-memory segment, oldest first.
    entries: VecDeque<Arc<ConditionedEvent>>,
    /// Next offset each group will read.
    groups: HashMap<String, u64>,
    /// Optional JSONL sink.
    sink: Option<BufWriter<File>>,
    appended: u64,
    evicted: u64,
}

/// Counters and positions for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub appended: u64,
    pub evicted: u64,
    pub base_offset: u64,
    pub end_offset: u64,
    pub groups: HashMap<String, u64>,
}

/// Append-only event stream with consumer-group offsets.
#[derive(Clone)]
pub struct EventLog {
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
    retention: usize,
}

impl EventLog {
    /// Open the log, creating the JSONL sink when persistence is configured.
    pub fn open(config: EventLogConfig) -> Result<Self> {
        let sink = match &config.persist_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("events.jsonl"))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(LogState {
                base_offset: 0,
                entries: VecDeque::with_capacity(config.retention.min(1024)),
                groups: HashMap::new(),
                sink,
                appended: 0,
                evicted: 0,
            })),
            notify: Arc::new(Notify::new()),
            retention: config.retention.max(1),
        })
    }

    /// Append one event, returning its offset.
    ///
    /// Fails with [`CoreError::RetentionExhausted`] when the segment is full
    /// and the slowest consumer group still holds an offset inside it; the
    /// caller is expected to buffer or drop, never to block the log.
    pub fn append(&self, event: ConditionedEvent) -> Result<u64> {
        let mut state = self.state.lock();

        if state.entries.len() >= self.retention && !can_evict(&state) {
            let slowest = state.groups.values().copied().min().unwrap_or(0);
            return Err(CoreError::RetentionExhausted {
                capacity: self.retention,
                slowest,
            });
        }

        if let Some(sink) = state.sink.as_mut() {
            let line = serde_json::to_string(&event).map_err(std::io::Error::other)?;
            sink.write_all(line.as_bytes())?;
            sink.write_all(b"\n")?;
            sink.flush()?;
        }

        let offset = state.base_offset + state.entries.len() as u64;
        state.entries.push_back(Arc::new(event));
        state.appended += 1;

        while state.entries.len() > self.retention && can_evict(&state) {
            state.entries.pop_front();
            state.base_offset += 1;
            state.evicted += 1;
        }

        trace!(offset, "event appended");
        drop(state);
        self.notify.notify_waiters();
        Ok(offset)
    }

    /// Register (or re-attach to) a consumer group.
    ///
    /// A new group starts at the oldest retained offset so it sees the full
    /// available history; an existing group keeps its committed position.
    pub fn subscribe(&self, group: impl Into<String>) -> Consumer {
        self.subscribe_from(group, false)
    }

    /// Register a consumer group starting at the end of the stream: only
    /// events appended after subscription are delivered. Used for consumers
    /// that must not replay history, like freshly loaded plugins.
    pub fn subscribe_at_end(&self, group: impl Into<String>) -> Consumer {
        self.subscribe_from(group, true)
    }

    fn subscribe_from(&self, group: impl Into<String>, at_end: bool) -> Consumer {
        let group = group.into();
        let mut state = self.state.lock();
        let start = if at_end {
            state.base_offset + state.entries.len() as u64
        } else {
            state.base_offset
        };
        state.groups.entry(group.clone()).or_insert(start);
        debug!(group = %group, at_end, "consumer group subscribed");
        Consumer {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            group,
        }
    }

    /// Drop a consumer group so it no longer pins retention. Terminal
    /// plugin instances must do this or the log eventually refuses appends
    /// on their behalf.
    pub fn unsubscribe(&self, group: &str) -> bool {
        let removed = self.state.lock().groups.remove(group).is_some();
        if removed {
            debug!(group, "consumer group unsubscribed");
        }
        removed
    }

    /// Current counters and group positions.
    pub fn stats(&self) -> LogStats {
        let state = self.state.lock();
        LogStats {
            appended: state.appended,
            evicted: state.evicted,
            base_offset: state.base_offset,
            end_offset: state.base_offset + state.entries.len() as u64,
            groups: state.groups.clone(),
        }
    }
}

fn can_evict(state: &LogState) -> bool {
    state.groups.is_empty()
        || state
            .groups
            .values()
            .all(|&committed| committed > state.base_offset)
}

/// A consumer group's handle onto the log.
pub struct Consumer {
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
    group: String,
}

impl Consumer {
    /// Read up to `max` events from the group's committed offset, paired with
    /// their offsets. Does not advance the offset; call [`Consumer::commit`]
    /// after processing for at-least-once delivery.
    pub fn poll(&self, max: usize) -> Result<Vec<(u64, Arc<ConditionedEvent>)>> {
        let state = self.state.lock();
        let committed = *state
            .groups
            .get(&self.group)
            .ok_or_else(|| CoreError::UnknownGroup(self.group.clone()))?;

        // A group pinned behind the base (only possible after external
        // manipulation) resumes at the oldest retained entry.
        let start = committed.max(state.base_offset);
        if committed < state.base_offset {
            warn!(group = %self.group, "consumer group behind retention; skipping ahead");
        }

        let skip = (start - state.base_offset) as usize;
        Ok(state
            .entries
            .iter()
            .enumerate()
            .skip(skip)
            .take(max)
            .map(|(i, e)| (state.base_offset + i as u64, Arc::clone(e)))
            .collect())
    }

    /// Mark everything up to and including `offset` as processed.
    pub fn commit(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        let committed = state
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| CoreError::UnknownGroup(self.group.clone()))?;

        let next = offset + 1;
        if next < *committed {
            return Err(CoreError::CommitRegression {
                group: self.group.clone(),
                committed: *committed,
                requested: next,
            });
        }
        *committed = next;
        Ok(())
    }

    /// Wait until an append might have made new events visible.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// The group name.
    pub fn group(&self) -> &str {
        &self.group
    }
}
