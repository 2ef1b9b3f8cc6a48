//! The append-only audit trail.
//!
//! Every cross-boundary message and every security violation lands here.
//! Records flow through one mpsc writer task, which gives strict append
//! ordering per producer without any shared mutable state; the task owns the
//! JSONL sink and a bounded in-memory tail for export queries.

use crate::error::{CoreError, Result};
use crate::violation::SecurityViolation;
use crate::PluginId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Direction of a boundary message, from the host's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Host to worker.
    Outbound,
    /// Worker to host.
    Inbound,
}

/// One audit record. Append-only; never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    /// A message crossed (or was refused at) the security boundary.
    Message {
        plugin_id: PluginId,
        direction: MessageDirection,
        kind: String,
        bytes: usize,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A security violation was recorded.
    Violation(SecurityViolation),
}

impl AuditRecord {
    /// Convenience constructor for boundary message records.
    pub fn message(
        plugin_id: impl Into<PluginId>,
        direction: MessageDirection,
        kind: impl Into<String>,
        bytes: usize,
        accepted: bool,
        reason: Option<String>,
    ) -> Self {
        Self::Message {
            plugin_id: plugin_id.into(),
            direction,
            kind: kind.into(),
            bytes,
            accepted,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Handle for appending records and reading the tail.
#[derive(Clone)]
pub struct AuditTrail {
    tx: mpsc::UnboundedSender<AuditRecord>,
    tail: Arc<Mutex<VecDeque<AuditRecord>>>,
    tail_capacity: usize,
}

impl AuditTrail {
    /// Create the trail and its writer. Spawn [`AuditWriter::run`] on the
    /// runtime; records appended after the writer stops are lost with an
    /// error, never silently.
    pub fn new(persist_dir: Option<PathBuf>, tail_capacity: usize) -> Result<(Self, AuditWriter)> {
        let sink = match &persist_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("audit.jsonl"))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(tail_capacity)));

        Ok((
            Self {
                tx,
                tail: Arc::clone(&tail),
                tail_capacity: tail_capacity.max(1),
            },
            AuditWriter {
                rx,
                sink,
                tail,
                tail_capacity: tail_capacity.max(1),
            },
        ))
    }

    /// Append a record.
    pub fn record(&self, record: AuditRecord) -> Result<()> {
        self.tx.send(record).map_err(|_| CoreError::AuditClosed)
    }

    /// The most recent records, newest last, up to `limit`.
    pub fn tail(&self, limit: usize) -> Vec<AuditRecord> {
        let tail = self.tail.lock();
        let skip = tail.len().saturating_sub(limit.min(self.tail_capacity));
        tail.iter().skip(skip).cloned().collect()
    }
}

/// The single writer task behind an [`AuditTrail`].
pub struct AuditWriter {
    rx: mpsc::UnboundedReceiver<AuditRecord>,
    sink: Option<BufWriter<File>>,
    tail: Arc<Mutex<VecDeque<AuditRecord>>>,
    tail_capacity: usize,
}

impl AuditWriter {
    /// Drain records until every [`AuditTrail`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            self.write(&record);
        }
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
    }

    fn write(&mut self, record: &AuditRecord) {
        trace!(?record, "audit record");

        if let Some(sink) = self.sink.as_mut() {
            match serde_json::to_string(record) {
                Ok(line) => {
                    if let Err(e) = sink
                        .write_all(line.as_bytes())
                        .and_then(|_| sink.write_all(b"\n"))
                        .and_then(|_| sink.flush())
                    {
                        error!("audit sink write failed: {e}");
                    }
                }
                Err(e) => error!("audit record serialization failed: {e}"),
            }
        }

        let mut tail = self.tail.lock();
        if tail.len() >= self.tail_capacity {
            tail.pop_front();
        }
        tail.push_back(record.clone());
    }
}
