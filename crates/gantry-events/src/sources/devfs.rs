//! Device-node notification source backed by the OS watcher.

use super::node_event;
use crate::error::{Error, Result};
use crate::traits::{DeviceSource, EventSender};
use async_trait::async_trait;
use gantry_core::DeviceEventKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Watches a device-node directory (`/dev/bus/usb` by default) and maps node
/// creation to `Attach`, node removal to `Detach`.
///
/// The kernel's device manager creates and removes nodes on hot-plug, so the
/// node lifetime mirrors the bus. Vendor/product ids are not resolvable from
/// the node path alone and stay zeroed; the bus path anchors the signature.
pub struct DevfsSource {
    dir: PathBuf,
}

impl DevfsSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DeviceSource for DevfsSource {
    fn name(&self) -> &str {
        "devfs"
    }

    async fn run(&self, tx: EventSender) -> Result<()> {
        if !self.dir.exists() {
            return Err(Error::Source {
                source_name: self.name().to_string(),
                reason: format!("watch directory {} does not exist", self.dir.display()),
            });
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            // The watcher thread outliving the receiver is a normal shutdown
            // race, not an error.
            let _ = raw_tx.send(res);
        })?;
        watcher.watch(&self.dir, RecursiveMode::Recursive)?;
        info!(dir = %self.dir.display(), "devfs source watching");

        while let Some(res) = raw_rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("devfs backend error: {e}");
                    return Err(Error::Watch(e));
                }
            };

            let kind = match event.kind {
                EventKind::Create(_) => DeviceEventKind::Attach,
                EventKind::Remove(_) => DeviceEventKind::Detach,
                other => {
                    trace!(?other, "ignoring non-lifecycle node event");
                    continue;
                }
            };

            for path in &event.paths {
                let device_event = node_event(kind, path, self.name());
                debug!(
                    kind = kind.as_str(),
                    bus = %device_event.bus_path,
                    "devfs notification"
                );
                if tx.send(device_event).is_err() {
                    return Err(Error::ChannelClosed);
                }
            }
        }

        // Receiver side of the watcher bridge closed: the watcher was torn
        // down underneath us, report as a source failure so the adapter set
        // restarts it.
        Err(Error::Source {
            source_name: self.name().to_string(),
            reason: "notification stream ended".to_string(),
        })
    }
}
