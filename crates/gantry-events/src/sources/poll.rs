//! Snapshot-diff polling source.

use super::node_event;
use crate::error::Result;
use crate::traits::{DeviceSource, EventSender};
use async_trait::async_trait;
use gantry_core::DeviceEventKind;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Cross-platform fallback: scans a device directory on an interval and
/// diffs consecutive snapshots. The first scan primes the snapshot without
/// emitting, so a restart never replays the whole bus as attaches.
pub struct PollSource {
    dir: PathBuf,
    interval: Duration,
}

impl PollSource {
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
        }
    }

    fn scan(dir: &Path) -> Result<HashSet<PathBuf>> {
        let mut nodes = HashSet::new();
        // A vanished directory scans as empty rather than failing: buses can
        // disappear wholesale (controller unbind) and reappear later.
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(nodes),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                for sub in std::fs::read_dir(&path)? {
                    nodes.insert(sub?.path());
                }
            } else {
                nodes.insert(path);
            }
        }
        Ok(nodes)
    }
}

#[async_trait]
impl DeviceSource for PollSource {
    fn name(&self) -> &str {
        "poll"
    }

    async fn run(&self, tx: EventSender) -> Result<()> {
        info!(dir = %self.dir.display(), interval = ?self.interval, "poll source started");

        let mut snapshot = Self::scan(&self.dir)?;
        trace!(nodes = snapshot.len(), "poll snapshot primed");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it so
        // the priming scan is not diffed against itself.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let current = Self::scan(&self.dir)?;

            for added in current.difference(&snapshot) {
                debug!(node = %added.display(), "poll detected attach");
                if tx
                    .send(node_event(DeviceEventKind::Attach, added, self.name()))
                    .is_err()
                {
                    return Ok(());
                }
            }
            for removed in snapshot.difference(&current) {
                debug!(node = %removed.display(), "poll detected detach");
                if tx
                    .send(node_event(DeviceEventKind::Detach, removed, self.name()))
                    .is_err()
                {
                    return Ok(());
                }
            }

            snapshot = current;
        }
    }
}
