//! Device event types and signature hashing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content hash identifying a physical device position.
///
/// Two notifications for the same device on the same bus path hash to the
/// same signature regardless of which source adapter produced them, which is
/// what makes dedup and flap suppression work across heterogeneous sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventSignature(String);

impl EventSignature {
    /// Compute the signature for the identifying device fields.
    pub fn compute(vendor_id: u16, product_id: u16, bus_path: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&vendor_id.to_be_bytes());
        hasher.update(&product_id.to_be_bytes());
        hasher.update(bus_path.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Full digests are unwieldy in logs; the prefix is plenty to correlate.
        f.write_str(&self.0[..16.min(self.0.len())])
    }
}

/// Which source adapter produced an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Kind of hot-plug notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    /// Device appeared on the bus.
    Attach,
    /// Device left the bus.
    Detach,
}

impl DeviceEventKind {
    /// String form used in log lines and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
        }
    }
}

/// A canonical hot-plug event, normalized from a raw OS notification.
///
/// Immutable once created. Produced by source adapters, collapsed by the
/// conditioner, then published to the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    /// Content hash of the identifying fields; dedup key.
    pub signature: EventSignature,

    /// Attach or detach.
    pub kind: DeviceEventKind,

    /// USB vendor id, zero when the source could not resolve it.
    pub vendor_id: u16,

    /// USB product id, zero when the source could not resolve it.
    pub product_id: u16,

    /// Bus position, e.g. `usb:1-4.2`.
    pub bus_path: String,

    /// When the source observed the notification.
    pub timestamp: DateTime<Utc>,

    /// Which adapter produced it.
    pub source: SourceId,
}

impl DeviceEvent {
    /// Build an event, computing the signature from the identifying fields.
    pub fn new(
        kind: DeviceEventKind,
        vendor_id: u16,
        product_id: u16,
        bus_path: impl Into<String>,
        source: SourceId,
    ) -> Self {
        let bus_path = bus_path.into();
        Self {
            signature: EventSignature::compute(vendor_id, product_id, &bus_path),
            kind,
            vendor_id,
            product_id,
            bus_path,
            timestamp: Utc::now(),
            source,
        }
    }

    /// True for attach events.
    pub fn is_attach(&self) -> bool {
        matches!(self.kind, DeviceEventKind::Attach)
    }
}

/// A device event that survived conditioning.
///
/// Wraps the original event with the process-wide monotonic sequence number
/// assigned at publication and the id of the batch it was flushed with.
/// Consumers deduplicate on `(signature, sequence)` for at-least-once
/// delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionedEvent {
    /// Strictly monotonic per process.
    pub sequence: u64,

    /// Shared by every event flushed in the same conditioning window.
    pub batch_id: Uuid,

    /// The surviving device event.
    pub event: DeviceEvent,
}

impl ConditionedEvent {
    pub fn signature(&self) -> &EventSignature {
        &self.event.signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(bus: &str) -> DeviceEvent {
        DeviceEvent::new(
            DeviceEventKind::Attach,
            0x1d6b,
            0x0002,
            bus,
            SourceId::new("test"),
        )
    }

    #[test]
    fn signature_is_stable_across_sources() {
        let a = DeviceEvent::new(
            DeviceEventKind::Attach,
            0x1d6b,
            0x0002,
            "usb:1-4",
            SourceId::new("devfs"),
        );
        let b = DeviceEvent::new(
            DeviceEventKind::Detach,
            0x1d6b,
            0x0002,
            "usb:1-4",
            SourceId::new("poll"),
        );
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn signature_differs_by_bus_path() {
        assert_ne!(attach("usb:1-4").signature, attach("usb:1-5").signature);
    }

    #[test]
    fn signature_differs_by_ids() {
        let a = DeviceEvent::new(
            DeviceEventKind::Attach,
            0x1d6b,
            0x0002,
            "usb:1-4",
            SourceId::new("test"),
        );
        let b = DeviceEvent::new(
            DeviceEventKind::Attach,
            0x1d6b,
            0x0003,
            "usb:1-4",
            SourceId::new("test"),
        );
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn signature_display_is_truncated() {
        let ev = attach("usb:1-4");
        assert_eq!(format!("{}", ev.signature).len(), 16);
    }

    #[test]
    fn event_roundtrips_through_json() {
        let ev = attach("usb:3-1.2");
        let json = serde_json::to_string(&ev).unwrap();
        let back: DeviceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn kind_as_str() {
        assert_eq!(DeviceEventKind::Attach.as_str(), "attach");
        assert_eq!(DeviceEventKind::Detach.as_str(), "detach");
    }
}
