//! Bounded queue between the conditioner and the log publisher.

use gantry_core::ConditionedEvent;
use std::collections::VecDeque;
use tracing::debug;

/// Bounded event queue with drop-oldest backpressure.
///
/// When full, the oldest entry is dropped (and counted) to make room; the
/// memory bound always wins over completeness. The publisher can push a
/// not-yet-persisted event back to the front while the log is unavailable.
pub struct EventQueue {
    queue: VecDeque<ConditionedEvent>,
    capacity: usize,
    dropped: u64,
    enqueued: u64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
            enqueued: 0,
        }
    }

    /// Push an event, dropping the oldest on overflow.
    pub fn push(&mut self, event: ConditionedEvent) {
        if self.queue.len() >= self.capacity {
            if let Some(removed) = self.queue.pop_front() {
                debug!(
                    sequence = removed.sequence,
                    "queue full, dropping oldest event"
                );
                self.dropped += 1;
                metrics::counter!("gantry_events_queue_dropped_total").increment(1);
            }
        }
        self.queue.push_back(event);
        self.enqueued += 1;
    }

    /// Re-queue an event at the front after a failed publish. If the queue
    /// filled up in the meantime the event is dropped instead; retention
    /// pressure must not grow the queue past its bound.
    pub fn push_front(&mut self, event: ConditionedEvent) {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            metrics::counter!("gantry_events_queue_dropped_total").increment(1);
            return;
        }
        self.queue.push_front(event);
    }

    pub fn pop(&mut self) -> Option<ConditionedEvent> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            current_size: self.queue.len(),
            capacity: self.capacity,
            enqueued: self.enqueued,
            dropped: self.dropped,
        }
    }
}

/// Queue counters for status queries.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub current_size: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{DeviceEvent, DeviceEventKind, SourceId};
    use uuid::Uuid;

    fn event(seq: u64) -> ConditionedEvent {
        ConditionedEvent {
            sequence: seq,
            batch_id: Uuid::new_v4(),
            event: DeviceEvent::new(
                DeviceEventKind::Attach,
                0,
                0,
                format!("usb:{seq}"),
                SourceId::new("test"),
            ),
        }
    }

    #[test]
    fn fifo_order() {
        let mut q = EventQueue::new(4);
        q.push(event(1));
        q.push(event(2));
        assert_eq!(q.pop().unwrap().sequence, 1);
        assert_eq!(q.pop().unwrap().sequence, 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let mut q = EventQueue::new(2);
        q.push(event(1));
        q.push(event(2));
        q.push(event(3));

        let stats = q.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.current_size, 2);
        assert_eq!(q.pop().unwrap().sequence, 2);
        assert_eq!(q.pop().unwrap().sequence, 3);
    }

    #[test]
    fn push_front_requeues_for_retry() {
        let mut q = EventQueue::new(4);
        q.push(event(1));
        q.push(event(2));
        let head = q.pop().unwrap();
        q.push_front(head);
        assert_eq!(q.pop().unwrap().sequence, 1);
    }

    #[test]
    fn push_front_on_full_queue_drops() {
        let mut q = EventQueue::new(1);
        q.push(event(1));
        q.push_front(event(0));
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.pop().unwrap().sequence, 1);
    }
}
