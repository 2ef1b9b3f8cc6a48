//! Plugin manifest parsing.
//!
//! The manifest is the whole of a plugin's contract with the host: identity,
//! entry point, declared permissions, and an optional package signature.
//! Parsing checks field shape only; the staged checks that can actually
//! refuse a package live in [`crate::validator`].

use crate::error::{PluginError, Result};
use gantry_core::PermissionGrants;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Immutable description of a plugin package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    /// Stable identifier: lowercase alphanumeric with hyphens/underscores.
    pub id: String,

    /// Package version, dotted numerics with an optional suffix.
    pub version: String,

    /// Lua entry point, relative to the package directory.
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub author: String,

    /// Declared permission upper bound. Absent sections grant nothing.
    #[serde(default)]
    pub permissions: PermissionGrants,

    /// Base64 ed25519 signature over the entry-point bytes.
    #[serde(default)]
    pub signature: Option<String>,

    /// Other plugins this one needs loaded first.
    #[serde(default)]
    pub dependencies: Vec<ManifestDependency>,

    /// Oldest host version the plugin supports.
    #[serde(default)]
    pub min_host_version: Option<String>,
}

fn default_entry_point() -> String {
    "init.lua".to_string()
}

/// A declared dependency on another plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestDependency {
    pub id: String,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub optional: bool,
}

impl PluginManifest {
    /// Parse a manifest from YAML and check field shape.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.check_shape()?;
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Locate and parse the manifest inside a package directory.
    pub fn discover(package_dir: &Path) -> Result<Self> {
        for candidate in ["plugin.yaml", "plugin.yml", "manifest.yaml", "manifest.yml"] {
            let path = package_dir.join(candidate);
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Err(PluginError::MissingManifest(package_dir.to_path_buf()))
    }

    /// Absolute path of the entry point inside `package_dir`.
    pub fn entry_point_path(&self, package_dir: &Path) -> PathBuf {
        package_dir.join(&self.entry_point)
    }

    fn check_shape(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(PluginError::Manifest {
                field: "id",
                reason: "must not be empty".into(),
            });
        }
        if !is_valid_id(&self.id) {
            return Err(PluginError::Manifest {
                field: "id",
                reason: format!(
                    "'{}' must be lowercase alphanumeric with hyphens or underscores",
                    self.id
                ),
            });
        }
        if self.version.is_empty() {
            return Err(PluginError::Manifest {
                field: "version",
                reason: "must not be empty".into(),
            });
        }
        if !is_valid_version(&self.version) {
            return Err(PluginError::Manifest {
                field: "version",
                reason: format!("'{}' is not a dotted numeric version", self.version),
            });
        }
        if self.entry_point.trim().is_empty() {
            return Err(PluginError::Manifest {
                field: "entry_point",
                reason: "must not be empty".into(),
            });
        }
        if Path::new(&self.entry_point).is_absolute()
            || self.entry_point.split('/').any(|c| c == "..")
        {
            return Err(PluginError::Manifest {
                field: "entry_point",
                reason: "must be a relative path inside the package".into(),
            });
        }
        Ok(())
    }

    /// Dependencies that must be present.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &ManifestDependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }
}

fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 64 {
        return false;
    }
    let mut chars = id.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !id.ends_with('-')
        && !id.ends_with('_')
}

fn is_valid_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.is_empty() || parts.len() > 4 {
        return false;
    }
    for (i, part) in parts.iter().enumerate() {
        let numeric = part.parse::<u32>().is_ok();
        if i < parts.len() - 1 {
            if !numeric {
                return false;
            }
        } else if !numeric && !part.chars().all(|c| c.is_alphanumeric() || c == '-') {
            return false;
        }
    }
    true
}
