//! In-process injection source.

use crate::error::{Error, Result};
use crate::traits::{DeviceSource, EventSender};
use async_trait::async_trait;
use gantry_core::{DeviceEvent, DeviceEventKind, SourceId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Source fed by [`DeviceInjector`] instead of the OS.
///
/// Used by tests and by the daemon's `device.simulate` endpoint; events pass
/// through the exact same conditioning path as hardware notifications.
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
}

/// Handle for pushing synthetic events into a [`ChannelSource`].
#[derive(Clone)]
pub struct DeviceInjector {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceInjector {
    /// Inject a synthetic notification.
    pub fn inject(
        &self,
        kind: DeviceEventKind,
        vendor_id: u16,
        product_id: u16,
        bus_path: impl Into<String>,
    ) -> Result<DeviceEvent> {
        let event = DeviceEvent::new(kind, vendor_id, product_id, bus_path, SourceId::new("channel"));
        debug!(kind = kind.as_str(), bus = %event.bus_path, "injected device event");
        self.tx
            .send(event.clone())
            .map_err(|_| Error::ChannelClosed)?;
        Ok(event)
    }
}

impl ChannelSource {
    pub fn new() -> (Self, DeviceInjector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Mutex::new(Some(rx)),
            },
            DeviceInjector { tx },
        )
    }
}

#[async_trait]
impl DeviceSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn run(&self, tx: EventSender) -> Result<()> {
        let mut rx = self.rx.lock().take().ok_or_else(|| Error::Source {
            source_name: self.name().to_string(),
            reason: "channel source is single-run".to_string(),
        })?;

        while let Some(event) = rx.recv().await {
            if tx.send(event).is_err() {
                return Ok(());
            }
        }
        // All injectors dropped: a clean end, not a failure to retry.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_events_flow_through() {
        let (source, injector) = ChannelSource::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { source.run(tx).await });

        injector
            .inject(DeviceEventKind::Attach, 0x046d, 0xc52b, "usb:1-2")
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, DeviceEventKind::Attach);
        assert_eq!(event.vendor_id, 0x046d);
        assert_eq!(event.source.as_str(), "channel");

        drop(injector);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_run_is_refused() {
        let (source, _injector) = ChannelSource::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let mut taken = source.rx.lock();
            taken.take();
        }
        assert!(source.run(tx).await.is_err());
    }
}
