//! Signature-keyed debouncing, flap suppression, and the rate ceiling.

use crate::ratelimit::TokenBucket;
use gantry_core::{DeviceEvent, DeviceEventKind, EventSignature};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct Slot {
    event: DeviceEvent,
    deadline: Instant,
}

/// Conditioner counters for status queries.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ConditionerStats {
    /// Events collapsed into a newer one with the same signature.
    pub deduplicated: u64,
    /// Attach/detach pairs suppressed entirely.
    pub flaps_suppressed: u64,
    /// Events dropped by the inbound rate ceiling.
    pub rate_dropped: u64,
    /// Events accepted into a debounce slot.
    pub accepted: u64,
    /// Events flushed downstream.
    pub flushed: u64,
}

/// Collapses the raw event stream into at most one event per signature per
/// debounce window.
///
/// The window is anchored at the first arrival for a signature, so
/// conditioning latency is bounded by one window regardless of how fast a
/// device flaps. Within a signature, relative attach/detach order is
/// preserved; across signatures no order is promised.
pub struct Conditioner {
    window: Duration,
    bucket: TokenBucket,
    pending: HashMap<EventSignature, Slot>,
    /// Flush order: (deadline at insertion, signature). Stale entries are
    /// skipped when the slot was flap-removed or re-created later.
    order: VecDeque<(Instant, EventSignature)>,
    stats: ConditionerStats,
}

impl Conditioner {
    pub fn new(window: Duration, rate_capacity: u32, rate_interval: Duration) -> Self {
        Self {
            window,
            bucket: TokenBucket::new(rate_capacity, rate_interval),
            pending: HashMap::new(),
            order: VecDeque::new(),
            stats: ConditionerStats::default(),
        }
    }

    /// Offer one raw event.
    pub fn offer(&mut self, event: DeviceEvent) {
        self.offer_at(event, Instant::now());
    }

    /// Deterministic variant for tests.
    pub fn offer_at(&mut self, event: DeviceEvent, now: Instant) {
        if !self.bucket.try_acquire_at(now) {
            self.stats.rate_dropped += 1;
            metrics::counter!("gantry_events_rate_dropped_total").increment(1);
            trace!(signature = %event.signature, "rate ceiling drop");
            return;
        }

        self.stats.accepted += 1;
        let signature = event.signature.clone();

        enum Action {
            Insert,
            Replace,
            Flap,
        }
        let action = match self.pending.get(&signature) {
            Some(slot)
                if slot.event.kind == DeviceEventKind::Attach
                    && event.kind == DeviceEventKind::Detach =>
            {
                Action::Flap
            }
            Some(_) => Action::Replace,
            None => Action::Insert,
        };

        match action {
            Action::Flap => {
                // The device came and went inside one window: nobody
                // downstream needs to hear about it.
                debug!(signature = %signature, "flap suppressed");
                self.pending.remove(&signature);
                self.stats.flaps_suppressed += 1;
                metrics::counter!("gantry_events_flaps_suppressed_total").increment(1);
            }
            Action::Replace => {
                trace!(signature = %signature, "deduplicated, latest wins");
                if let Some(slot) = self.pending.get_mut(&signature) {
                    slot.event = event;
                }
                self.stats.deduplicated += 1;
                metrics::counter!("gantry_events_deduplicated_total").increment(1);
            }
            Action::Insert => {
                let deadline = now + self.window;
                self.pending.insert(signature.clone(), Slot { event, deadline });
                self.order.push_back((deadline, signature));
            }
        }
    }

    /// Flush every slot whose window has elapsed, in arrival order.
    pub fn flush_due(&mut self, now: Instant) -> Vec<DeviceEvent> {
        let mut due = Vec::new();

        loop {
            let due_now = match self.order.front() {
                Some((deadline, _)) => *deadline <= now,
                None => break,
            };
            if !due_now {
                break;
            }
            let Some((entry_deadline, signature)) = self.order.pop_front() else {
                break;
            };

            // Skip stale entries: slot flap-removed, or re-created with a
            // later deadline (its own order entry will flush it).
            let matches = self
                .pending
                .get(&signature)
                .is_some_and(|slot| slot.deadline == entry_deadline);
            if !matches {
                continue;
            }
            if let Some(slot) = self.pending.remove(&signature) {
                due.push(slot.event);
            }
        }

        self.stats.flushed += due.len() as u64;
        due
    }

    /// Flush everything regardless of deadlines (shutdown).
    pub fn flush_all(&mut self) -> Vec<DeviceEvent> {
        let mut due = Vec::new();
        while let Some((entry_deadline, signature)) = self.order.pop_front() {
            let matches = self
                .pending
                .get(&signature)
                .is_some_and(|slot| slot.deadline == entry_deadline);
            if matches {
                if let Some(slot) = self.pending.remove(&signature) {
                    due.push(slot.event);
                }
            }
        }
        self.stats.flushed += due.len() as u64;
        due
    }

    /// Number of signatures currently in a window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ConditionerStats {
        self.stats
    }

    /// The debounce window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::SourceId;

    const WINDOW: Duration = Duration::from_millis(50);

    fn conditioner() -> Conditioner {
        Conditioner::new(WINDOW, 1000, Duration::from_millis(1))
    }

    fn event(kind: DeviceEventKind, bus: &str) -> DeviceEvent {
        DeviceEvent::new(kind, 0x1d6b, 0x0002, bus, SourceId::new("test"))
    }

    #[test]
    fn two_attaches_in_window_collapse_to_one() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Attach, "dev-123"), t0);
        c.offer_at(
            event(DeviceEventKind::Attach, "dev-123"),
            t0 + Duration::from_millis(5),
        );

        let flushed = c.flush_due(t0 + WINDOW);
        assert_eq!(flushed.len(), 1);
        assert_eq!(c.stats().deduplicated, 1);
    }

    #[test]
    fn attach_then_detach_in_window_is_fully_suppressed() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Attach, "dev-9"), t0);
        c.offer_at(
            event(DeviceEventKind::Detach, "dev-9"),
            t0 + Duration::from_millis(10),
        );

        assert!(c.flush_due(t0 + WINDOW * 2).is_empty());
        assert_eq!(c.stats().flaps_suppressed, 1);
    }

    #[test]
    fn detach_then_attach_keeps_latest() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Detach, "dev-9"), t0);
        c.offer_at(
            event(DeviceEventKind::Attach, "dev-9"),
            t0 + Duration::from_millis(10),
        );

        let flushed = c.flush_due(t0 + WINDOW);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, DeviceEventKind::Attach);
    }

    #[test]
    fn events_outside_window_both_survive() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Attach, "dev-1"), t0);
        let first = c.flush_due(t0 + WINDOW);
        assert_eq!(first.len(), 1);

        c.offer_at(event(DeviceEventKind::Detach, "dev-1"), t0 + WINDOW * 2);
        let second = c.flush_due(t0 + WINDOW * 3);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind, DeviceEventKind::Detach);
    }

    #[test]
    fn per_signature_order_is_preserved() {
        let mut c = conditioner();
        let t0 = Instant::now();

        // Attach flushes, then a detach in a later window: attach must come
        // out before the detach.
        c.offer_at(event(DeviceEventKind::Attach, "dev-x"), t0);
        let mut all = c.flush_due(t0 + WINDOW);
        c.offer_at(event(DeviceEventKind::Detach, "dev-x"), t0 + WINDOW * 2);
        all.extend(c.flush_due(t0 + WINDOW * 3));

        let kinds: Vec<_> = all.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![DeviceEventKind::Attach, DeviceEventKind::Detach]);
    }

    #[test]
    fn distinct_signatures_do_not_collapse() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Attach, "dev-a"), t0);
        c.offer_at(event(DeviceEventKind::Attach, "dev-b"), t0);

        assert_eq!(c.flush_due(t0 + WINDOW).len(), 2);
    }

    #[test]
    fn flush_respects_deadlines() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Attach, "early"), t0);
        c.offer_at(
            event(DeviceEventKind::Attach, "late"),
            t0 + Duration::from_millis(30),
        );

        // Only the early slot is due at t0+window.
        let flushed = c.flush_due(t0 + WINDOW);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].bus_path, "early");
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn rate_ceiling_drops_excess() {
        let mut c = Conditioner::new(WINDOW, 2, Duration::from_secs(60));
        let t0 = Instant::now();

        for i in 0..5 {
            c.offer_at(event(DeviceEventKind::Attach, &format!("dev-{i}")), t0);
        }

        let stats = c.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rate_dropped, 3);
        assert_eq!(c.flush_due(t0 + WINDOW).len(), 2);
    }

    #[test]
    fn flap_then_fresh_attach_survives() {
        let mut c = conditioner();
        let t0 = Instant::now();

        c.offer_at(event(DeviceEventKind::Attach, "dev-f"), t0);
        c.offer_at(
            event(DeviceEventKind::Detach, "dev-f"),
            t0 + Duration::from_millis(5),
        );
        // New attach after the flap, still inside the original window.
        c.offer_at(
            event(DeviceEventKind::Attach, "dev-f"),
            t0 + Duration::from_millis(20),
        );

        // The fresh slot has its own window anchored at +20ms.
        assert!(c.flush_due(t0 + WINDOW).is_empty());
        let flushed = c.flush_due(t0 + Duration::from_millis(20) + WINDOW);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].kind, DeviceEventKind::Attach);
    }

    #[test]
    fn flush_all_drains_everything() {
        let mut c = conditioner();
        let t0 = Instant::now();
        c.offer_at(event(DeviceEventKind::Attach, "a"), t0);
        c.offer_at(event(DeviceEventKind::Attach, "b"), t0);
        assert_eq!(c.flush_all().len(), 2);
        assert_eq!(c.pending_len(), 0);
    }
}
