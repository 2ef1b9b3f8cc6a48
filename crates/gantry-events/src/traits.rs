//! The device source contract.

use crate::error::Result;
use async_trait::async_trait;
use gantry_core::DeviceEvent;
use tokio::sync::mpsc;

/// Sender a source pushes canonical events into.
pub type EventSender = mpsc::UnboundedSender<DeviceEvent>;

/// One OS-level notification backend.
///
/// A source normalizes raw notifications into [`DeviceEvent`]s and performs
/// no filtering; dedup and rate policy belong to the conditioner. `run`
/// produces an infinite stream and returns only on failure or when the
/// receiving side is dropped. Sources must be restartable: the adapter set
/// calls `run` again (with backoff) after a failure, and a fresh run must
/// not replay stale state from the previous one.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Stable name used in health reporting and event `source` fields.
    fn name(&self) -> &str;

    /// Pump notifications into `tx` until failure or channel close.
    async fn run(&self, tx: EventSender) -> Result<()>;
}
