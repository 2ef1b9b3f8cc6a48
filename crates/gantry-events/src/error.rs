//! Event pipeline error types.

use thiserror::Error;

/// Errors from sources and the conditioning pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS-level notification backend failed.
    #[error("source '{source_name}' failed: {reason}")]
    Source { source_name: String, reason: String },

    /// The notify backend could not be created or attached.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Filesystem access during a poll scan failed.
    #[error("scan error: {0}")]
    Scan(#[from] std::io::Error),

    /// The downstream channel is gone; the pipeline is shutting down.
    #[error("event channel closed")]
    ChannelClosed,

    /// Errors bubbling up from the event log.
    #[error(transparent)]
    Core(#[from] gantry_core::CoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
