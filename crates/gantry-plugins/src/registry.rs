//! Plugin registry: discovery and submission.

use crate::error::{PluginError, Result};
use crate::manifest::PluginManifest;
use crate::validator::{ValidatedPlugin, ValidationRejection, Validator};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of a package submission, surfaced verbatim over the control
/// surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionReport {
    Accepted {
        plugin_id: String,
        version: String,
    },
    Rejected {
        package_dir: PathBuf,
        rejection: ValidationRejection,
    },
}

/// Holds validated manifests; rejected packages are reported and forgotten.
///
/// The registry never runs code. It feeds [`ValidatedPlugin`]s to the
/// lifecycle manager, which owns everything from `Loading` onward.
pub struct PluginRegistry {
    validator: RwLock<Validator>,
    validated: RwLock<HashMap<String, ValidatedPlugin>>,
}

impl PluginRegistry {
    pub fn new(validator: Validator) -> Self {
        Self {
            validator: RwLock::new(validator),
            validated: RwLock::new(HashMap::new()),
        }
    }

    /// Swap the validation policy. Applies to future submissions only;
    /// already-validated plugins and running instances are untouched.
    pub fn set_validator(&self, validator: Validator) {
        *self.validator.write() = validator;
    }

    /// Scan package directories, validating everything found. Returns how
    /// many packages were accepted; individual failures are reported per
    /// package and do not abort the scan.
    pub fn discover(&self, plugin_dirs: &[PathBuf]) -> Result<Vec<SubmissionReport>> {
        let mut reports = Vec::new();
        for dir in plugin_dirs {
            if !dir.exists() {
                debug!(dir = %dir.display(), "plugin directory absent, skipping");
                continue;
            }
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                // Directories without a manifest are not packages; stay quiet
                // about them beyond a debug line.
                if PluginManifest::discover(&path).is_err() {
                    debug!(dir = %path.display(), "no manifest, not a package");
                    continue;
                }
                reports.push(self.submit(&path));
            }
        }
        let accepted = reports
            .iter()
            .filter(|r| matches!(r, SubmissionReport::Accepted { .. }))
            .count();
        info!(
            accepted,
            rejected = reports.len() - accepted,
            "plugin discovery finished"
        );
        Ok(reports)
    }

    /// Validate one package directory and register it on success.
    pub fn submit(&self, package_dir: &Path) -> SubmissionReport {
        let known: HashSet<String> = self.validated.read().keys().cloned().collect();
        match self.validator.read().validate(package_dir, &known) {
            Ok(validated) => {
                let id = validated.manifest.id.clone();
                let version = validated.manifest.version.clone();
                let previous = self.validated.write().insert(id.clone(), validated);
                if previous.is_some() {
                    info!(plugin = %id, %version, "plugin re-registered");
                } else {
                    info!(plugin = %id, %version, "plugin registered");
                }
                SubmissionReport::Accepted {
                    plugin_id: id,
                    version,
                }
            }
            Err(rejection) => {
                warn!(
                    package = %package_dir.display(),
                    "submission rejected: {rejection}"
                );
                SubmissionReport::Rejected {
                    package_dir: package_dir.to_path_buf(),
                    rejection: *rejection,
                }
            }
        }
    }

    /// A validated plugin by id.
    pub fn get(&self, plugin_id: &str) -> Result<ValidatedPlugin> {
        self.validated
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::UnknownPlugin(plugin_id.to_string()))
    }

    /// Ids of every validated plugin.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.validated.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{ValidationPolicy, ValidationStage};
    use gantry_core::SecurityLevel;

    fn registry() -> PluginRegistry {
        PluginRegistry::new(Validator::new(ValidationPolicy {
            require_signature: false,
            trusted_keys: Vec::new(),
            security_level: SecurityLevel::Medium,
            host_version: "0.1.0".into(),
        }))
    }

    fn write_package(root: &Path, id: &str) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.yaml"),
            format!("id: {id}\nversion: \"1.0.0\"\n"),
        )
        .unwrap();
        std::fs::write(dir.join("init.lua"), "function on_event(e) end\n").unwrap();
        dir
    }

    #[test]
    fn discover_registers_valid_packages() {
        let root = tempfile::tempdir().unwrap();
        write_package(root.path(), "alpha");
        write_package(root.path(), "beta");

        let registry = registry();
        let reports = registry.discover(&[root.path().to_path_buf()]).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(registry.list(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn rejected_package_is_not_registered() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        // Manifest present but entry point missing.
        std::fs::write(dir.join("plugin.yaml"), "id: broken\nversion: \"1.0\"\n").unwrap();

        let registry = registry();
        let report = registry.submit(&dir);
        match report {
            SubmissionReport::Rejected { rejection, .. } => {
                assert_eq!(rejection.stage, ValidationStage::Schema);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(registry.list().is_empty());
        assert!(registry.get("broken").is_err());
    }

    #[test]
    fn resubmission_after_fix_succeeds() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("fixable");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("plugin.yaml"), "id: fixable\nversion: \"1.0\"\n").unwrap();

        let registry = registry();
        assert!(matches!(
            registry.submit(&dir),
            SubmissionReport::Rejected { .. }
        ));

        // The corrected package goes through a fresh submission.
        std::fs::write(dir.join("init.lua"), "return true\n").unwrap();
        assert!(matches!(
            registry.submit(&dir),
            SubmissionReport::Accepted { .. }
        ));
        assert!(registry.get("fixable").is_ok());
    }

    #[test]
    fn dependency_resolution_sees_registered_plugins() {
        let root = tempfile::tempdir().unwrap();
        write_package(root.path(), "base");
        let dependent = root.path().join("child");
        std::fs::create_dir_all(&dependent).unwrap();
        std::fs::write(
            dependent.join("plugin.yaml"),
            "id: child\nversion: \"1.0\"\ndependencies:\n  - id: base\n",
        )
        .unwrap();
        std::fs::write(dependent.join("init.lua"), "").unwrap();

        let registry = registry();
        // Before base is registered the child is rejected.
        assert!(matches!(
            registry.submit(&dependent),
            SubmissionReport::Rejected { .. }
        ));

        registry.submit(&root.path().join("base"));
        assert!(matches!(
            registry.submit(&dependent),
            SubmissionReport::Accepted { .. }
        ));
    }

    #[test]
    fn non_package_directories_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("random-junk")).unwrap();
        write_package(root.path(), "real");

        let registry = registry();
        let reports = registry.discover(&[root.path().to_path_buf()]).unwrap();
        assert_eq!(reports.len(), 1);
    }
}
