//! Plugin package error types.

use thiserror::Error;

/// Errors from package discovery and manifest handling.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read package: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("manifest field '{field}' is invalid: {reason}")]
    Manifest { field: &'static str, reason: String },

    #[error("no manifest found in package directory {0}")]
    MissingManifest(std::path::PathBuf),

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
}

pub type Result<T> = std::result::Result<T, PluginError>;
