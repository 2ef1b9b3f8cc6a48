//! # Gantry Configuration
//!
//! Layered configuration for the Gantry daemon: TOML file over serde
//! defaults, validated before anything starts. Policy is supplied at process
//! start; an explicit [`ConfigHandle::reload`] re-validates and swaps the
//! active config, which affects newly loaded plugin instances only. Running
//! instances keep the policy they were loaded with until restart.
//!
//! This crate deliberately has no dependency on the rest of the workspace so
//! every other crate can depend on it.

mod error;
mod loader;
mod settings;

pub use error::{ConfigError, Result};
pub use loader::{default_config_path, ConfigHandle};
pub use settings::{
    DaemonConfig, EventsConfig, GantryConfig, LogConfig, PluginsConfig, RuntimeConfig,
};
