//! Batch stamping for flushed debounce windows.

use gantry_core::{ConditionedEvent, DeviceEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Turns flushed device events into sequenced, batch-stamped
/// [`ConditionedEvent`]s.
///
/// Every call produces one or more batches of at most `max_batch_size`
/// events sharing a `batch_id`; the sequence counter is process-wide and
/// strictly monotonic across batches.
pub struct EventBatcher {
    max_batch_size: usize,
    sequence: Arc<AtomicU64>,
}

impl EventBatcher {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamp a flush into conditioned batches.
    pub fn stamp(&self, events: Vec<DeviceEvent>) -> Vec<ConditionedEvent> {
        let mut out = Vec::with_capacity(events.len());
        for chunk in events.chunks(self.max_batch_size) {
            let batch_id = Uuid::new_v4();
            for event in chunk {
                out.push(ConditionedEvent {
                    sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                    batch_id,
                    event: event.clone(),
                });
            }
        }
        out
    }

    /// The next sequence number that will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{DeviceEventKind, SourceId};

    fn events(n: usize) -> Vec<DeviceEvent> {
        (0..n)
            .map(|i| {
                DeviceEvent::new(
                    DeviceEventKind::Attach,
                    0,
                    0,
                    format!("usb:{i}"),
                    SourceId::new("test"),
                )
            })
            .collect()
    }

    #[test]
    fn sequences_are_monotonic_across_flushes() {
        let batcher = EventBatcher::new(8);
        let first = batcher.stamp(events(3));
        let second = batcher.stamp(events(2));
        let seqs: Vec<u64> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn oversized_flush_splits_batches() {
        let batcher = EventBatcher::new(2);
        let stamped = batcher.stamp(events(5));
        assert_eq!(stamped.len(), 5);

        let batch_ids: Vec<Uuid> = stamped.iter().map(|e| e.batch_id).collect();
        assert_eq!(batch_ids[0], batch_ids[1]);
        assert_eq!(batch_ids[2], batch_ids[3]);
        assert_ne!(batch_ids[1], batch_ids[2]);
        assert_ne!(batch_ids[3], batch_ids[4]);
    }

    #[test]
    fn single_window_shares_one_batch_id() {
        let batcher = EventBatcher::new(64);
        let stamped = batcher.stamp(events(4));
        assert!(stamped.iter().all(|e| e.batch_id == stamped[0].batch_id));
    }
}
