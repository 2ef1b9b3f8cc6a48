//! The attached-device table.

use dashmap::DashMap;
use gantry_core::{DeviceEvent, DeviceEventKind, EventSignature};
use serde::Serialize;

/// Devices currently believed attached, keyed by signature.
///
/// Maintained by the event dispatch path (attach inserts, detach removes)
/// and queried through the boundary's `list_devices` host call, filtered by
/// each plugin's declared usb grants.
#[derive(Default)]
pub struct DeviceTable {
    devices: DashMap<EventSignature, DeviceEvent>,
}

/// Wire form of one attached device.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_path: String,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one conditioned event.
    pub fn apply(&self, event: &DeviceEvent) {
        match event.kind {
            DeviceEventKind::Attach => {
                self.devices.insert(event.signature.clone(), event.clone());
            }
            DeviceEventKind::Detach => {
                self.devices.remove(&event.signature);
            }
        }
    }

    /// Attached devices passing `filter`.
    pub fn matching(&self, filter: impl Fn(u16, u16) -> bool) -> Vec<AttachedDevice> {
        let mut out: Vec<AttachedDevice> = self
            .devices
            .iter()
            .filter(|entry| filter(entry.vendor_id, entry.product_id))
            .map(|entry| AttachedDevice {
                vendor_id: entry.vendor_id,
                product_id: entry.product_id,
                bus_path: entry.bus_path.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.bus_path.cmp(&b.bus_path));
        out
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::SourceId;

    fn event(kind: DeviceEventKind, vendor: u16, bus: &str) -> DeviceEvent {
        DeviceEvent::new(kind, vendor, 0x0001, bus, SourceId::new("test"))
    }

    #[test]
    fn attach_then_detach_leaves_table_empty() {
        let table = DeviceTable::new();
        table.apply(&event(DeviceEventKind::Attach, 0x046d, "usb:1-1"));
        assert_eq!(table.len(), 1);
        table.apply(&event(DeviceEventKind::Detach, 0x046d, "usb:1-1"));
        assert!(table.is_empty());
    }

    #[test]
    fn matching_filters_by_ids() {
        let table = DeviceTable::new();
        table.apply(&event(DeviceEventKind::Attach, 0x046d, "usb:1-1"));
        table.apply(&event(DeviceEventKind::Attach, 0x1d6b, "usb:1-2"));

        let logitech = table.matching(|v, _| v == 0x046d);
        assert_eq!(logitech.len(), 1);
        assert_eq!(logitech[0].bus_path, "usb:1-1");

        assert_eq!(table.matching(|_, _| true).len(), 2);
        assert!(table.matching(|_, _| false).is_empty());
    }

    #[test]
    fn reattach_overwrites() {
        let table = DeviceTable::new();
        table.apply(&event(DeviceEventKind::Attach, 0x046d, "usb:1-1"));
        table.apply(&event(DeviceEventKind::Attach, 0x046d, "usb:1-1"));
        assert_eq!(table.len(), 1);
    }
}
