//! Config file loading and explicit reload.

use crate::error::{ConfigError, Result};
use crate::settings::GantryConfig;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Default config path: `$XDG_CONFIG_HOME/gantry/gantry.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("gantry")
        .join("gantry.toml")
}

fn load_file(path: &Path) -> Result<GantryConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: GantryConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    config.validate()?;
    Ok(config)
}

/// The process-wide configuration handle.
///
/// Holds the validated active config. [`ConfigHandle::reload`] re-reads and
/// re-validates the file and swaps the active snapshot on success; a failed
/// reload leaves the previous config in place. Components take their own
/// `Arc` snapshot at construction, which is what makes "running instances
/// keep their policy until restart" fall out naturally.
pub struct ConfigHandle {
    path: Option<PathBuf>,
    active: RwLock<Arc<GantryConfig>>,
}

impl ConfigHandle {
    /// Load from `path`, or fall back to defaults when the file is absent.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            let config = load_file(&path)?;
            info!(path = %path.display(), "configuration loaded");
            config
        } else {
            info!(path = %path.display(), "no config file, using defaults");
            let config = GantryConfig::default();
            config.validate()?;
            config
        };

        Ok(Self {
            path: Some(path),
            active: RwLock::new(Arc::new(config)),
        })
    }

    /// Wrap an already-built config (tests, embedders).
    pub fn from_config(config: GantryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: None,
            active: RwLock::new(Arc::new(config)),
        })
    }

    /// The active config snapshot.
    pub fn snapshot(&self) -> Arc<GantryConfig> {
        self.active.read().clone()
    }

    /// Re-read, re-validate, and swap the active config.
    ///
    /// Only affects components that take a fresh snapshot afterwards, i.e.
    /// newly loaded plugin instances; running instances are untouched.
    pub fn reload(&self) -> Result<Arc<GantryConfig>> {
        let Some(path) = &self.path else {
            warn!("reload requested on a file-less config handle; keeping current");
            return Ok(self.snapshot());
        };

        let config = Arc::new(load_file(path)?);
        *self.active.write() = Arc::clone(&config);
        info!(path = %path.display(), "configuration reloaded");
        Ok(config)
    }
}
