//! Source adapter backends.
//!
//! Three backends cover the deployment spectrum: `DevfsSource` rides the
//! OS notification machinery, `PollSource` is the cross-platform snapshot
//! fallback, and `ChannelSource` injects events in-process for tests and the
//! daemon's simulation endpoint.

mod channel;
mod devfs;
mod poll;

pub use channel::{ChannelSource, DeviceInjector};
pub use devfs::DevfsSource;
pub use poll::PollSource;

use gantry_core::{DeviceEvent, DeviceEventKind, SourceId};
use std::path::{Component, Path};

/// Derive a canonical bus path from a device node path.
///
/// `/dev/bus/usb/001/004` becomes `usb:001/004`; anything shallower falls
/// back to the lossless full path.
pub(crate) fn bus_path_from_node(path: &Path) -> String {
    let comps: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .collect();
    match comps.as_slice() {
        [.., bus, dev] => format!("usb:{bus}/{dev}"),
        _ => path.display().to_string(),
    }
}

/// Build the canonical event for a node appearing or vanishing.
///
/// Device nodes carry no vendor/product ids; they stay zeroed and the bus
/// path anchors the signature.
pub(crate) fn node_event(kind: DeviceEventKind, path: &Path, source: &str) -> DeviceEvent {
    DeviceEvent::new(kind, 0, 0, bus_path_from_node(path), SourceId::new(source))
}
