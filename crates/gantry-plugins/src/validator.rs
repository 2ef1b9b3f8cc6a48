//! The staged validation pipeline.
//!
//! Schema, dependencies/compatibility, signature, permission sanity; each
//! stage short-circuits. The outcome is terminal either way: a
//! [`ValidatedPlugin`] ready for the worker pool, or a
//! [`ValidationRejection`] carrying a machine-readable code plus
//! human-readable detail for the submitter. Rejections are never retried
//! automatically.

use crate::manifest::PluginManifest;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use gantry_core::{PermissionGrants, ResourcePolicy, SecurityLevel};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// System facilities a plugin may declare under `permissions.system`.
const RECOGNIZED_FACILITIES: &[&str] = &["clock", "hostname", "os_release", "uptime"];

/// Which stage refused the package.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Schema,
    Dependencies,
    Signature,
    Permissions,
}

/// Machine-readable rejection codes surfaced to the submitter.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    ManifestUnreadable,
    ManifestInvalid,
    EntryPointMissing,
    DependencyMissing,
    HostIncompatible,
    SignatureMissing,
    SignatureInvalid,
    SignerUntrusted,
    PermissionMalformed,
    PermissionUnrecognized,
}

/// Terminal refusal of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRejection {
    pub stage: ValidationStage,
    pub code: RejectionCode,
    pub reason: String,
}

impl ValidationRejection {
    fn new(stage: ValidationStage, code: RejectionCode, reason: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:?}: {}", self.stage, self.code, self.reason)
    }
}

/// A package that passed every stage.
#[derive(Debug, Clone)]
pub struct ValidatedPlugin {
    pub manifest: Arc<PluginManifest>,
    pub package_dir: PathBuf,
    /// Policy computed at validation from the configured security level.
    pub policy: ResourcePolicy,
    pub security_level: SecurityLevel,
}

impl ValidatedPlugin {
    /// Absolute entry point path.
    pub fn entry_point(&self) -> PathBuf {
        self.manifest.entry_point_path(&self.package_dir)
    }
}

/// Validator policy, fixed at construction from the active config snapshot.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub require_signature: bool,
    pub trusted_keys: Vec<VerifyingKey>,
    pub security_level: SecurityLevel,
    pub host_version: String,
}

impl ValidationPolicy {
    /// Parse base64 public keys from config, skipping malformed ones loudly.
    pub fn with_encoded_keys(
        require_signature: bool,
        encoded_keys: &[String],
        security_level: SecurityLevel,
        host_version: impl Into<String>,
    ) -> Self {
        let trusted_keys = encoded_keys
            .iter()
            .filter_map(|encoded| match decode_key(encoded) {
                Ok(key) => Some(key),
                Err(reason) => {
                    warn!("ignoring malformed trusted key: {reason}");
                    None
                }
            })
            .collect();
        Self {
            require_signature,
            trusted_keys,
            security_level,
            host_version: host_version.into(),
        }
    }
}

fn decode_key(encoded: &str) -> Result<VerifyingKey, String> {
    let bytes = BASE64.decode(encoded).map_err(|e| e.to_string())?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "ed25519 public key must be 32 bytes".to_string())?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| e.to_string())
}

/// Runs the staged pipeline against a package directory.
pub struct Validator {
    policy: ValidationPolicy,
}

impl Validator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    /// Validate a package. `known_plugins` supplies dependency resolution.
    pub fn validate(
        &self,
        package_dir: &Path,
        known_plugins: &HashSet<String>,
    ) -> Result<ValidatedPlugin, Box<ValidationRejection>> {
        let manifest = self.check_schema(package_dir)?;
        self.check_dependencies(&manifest, known_plugins)?;
        self.check_signature(&manifest, package_dir)?;
        self.check_permissions(&manifest.permissions)?;

        info!(
            plugin = %manifest.id,
            version = %manifest.version,
            level = self.policy.security_level.as_str(),
            "plugin validated"
        );
        Ok(ValidatedPlugin {
            manifest: Arc::new(manifest),
            package_dir: package_dir.to_path_buf(),
            policy: ResourcePolicy::for_level(self.policy.security_level),
            security_level: self.policy.security_level,
        })
    }

    fn check_schema(&self, package_dir: &Path) -> Result<PluginManifest, Box<ValidationRejection>> {
        let manifest = PluginManifest::discover(package_dir).map_err(|e| {
            Box::new(ValidationRejection::new(
                ValidationStage::Schema,
                match e {
                    crate::error::PluginError::MissingManifest(_) => {
                        RejectionCode::ManifestUnreadable
                    }
                    _ => RejectionCode::ManifestInvalid,
                },
                e.to_string(),
            ))
        })?;

        let entry = manifest.entry_point_path(package_dir);
        if !entry.is_file() {
            return Err(Box::new(ValidationRejection::new(
                ValidationStage::Schema,
                RejectionCode::EntryPointMissing,
                format!("entry point {} does not exist", entry.display()),
            )));
        }
        debug!(plugin = %manifest.id, "schema stage passed");
        Ok(manifest)
    }

    fn check_dependencies(
        &self,
        manifest: &PluginManifest,
        known_plugins: &HashSet<String>,
    ) -> Result<(), Box<ValidationRejection>> {
        for dep in manifest.required_dependencies() {
            if !known_plugins.contains(&dep.id) {
                return Err(Box::new(ValidationRejection::new(
                    ValidationStage::Dependencies,
                    RejectionCode::DependencyMissing,
                    format!("required dependency '{}' is not registered", dep.id),
                )));
            }
        }

        if let Some(min) = &manifest.min_host_version {
            if version_lt(&self.policy.host_version, min) {
                return Err(Box::new(ValidationRejection::new(
                    ValidationStage::Dependencies,
                    RejectionCode::HostIncompatible,
                    format!(
                        "plugin requires host >= {min}, this host is {}",
                        self.policy.host_version
                    ),
                )));
            }
        }
        Ok(())
    }

    fn check_signature(
        &self,
        manifest: &PluginManifest,
        package_dir: &Path,
    ) -> Result<(), Box<ValidationRejection>> {
        let Some(encoded) = &manifest.signature else {
            if self.policy.require_signature {
                return Err(Box::new(ValidationRejection::new(
                    ValidationStage::Signature,
                    RejectionCode::SignatureMissing,
                    "policy requires signed packages and the manifest carries no signature",
                )));
            }
            return Ok(());
        };

        let signature_bytes = BASE64.decode(encoded).map_err(|e| {
            Box::new(ValidationRejection::new(
                ValidationStage::Signature,
                RejectionCode::SignatureInvalid,
                format!("signature is not valid base64: {e}"),
            ))
        })?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|e| {
            Box::new(ValidationRejection::new(
                ValidationStage::Signature,
                RejectionCode::SignatureInvalid,
                format!("signature is malformed: {e}"),
            ))
        })?;

        let entry = manifest.entry_point_path(package_dir);
        let payload = std::fs::read(&entry).map_err(|e| {
            Box::new(ValidationRejection::new(
                ValidationStage::Signature,
                RejectionCode::SignatureInvalid,
                format!("cannot read entry point for verification: {e}"),
            ))
        })?;

        let verified = self
            .policy
            .trusted_keys
            .iter()
            .any(|key| key.verify(&payload, &signature).is_ok());
        if !verified {
            return Err(Box::new(ValidationRejection::new(
                ValidationStage::Signature,
                RejectionCode::SignerUntrusted,
                "signature does not verify against any trusted key",
            )));
        }
        debug!(plugin = %manifest.id, "signature stage passed");
        Ok(())
    }

    fn check_permissions(
        &self,
        grants: &PermissionGrants,
    ) -> Result<(), Box<ValidationRejection>> {
        // Globs and host patterns must compile into boundary matchers now,
        // not at first use on the hot path.
        grants.compile().map_err(|e| {
            Box::new(ValidationRejection::new(
                ValidationStage::Permissions,
                RejectionCode::PermissionMalformed,
                e.to_string(),
            ))
        })?;

        for entry in &grants.usb {
            if !is_valid_usb_filter(entry) {
                return Err(Box::new(ValidationRejection::new(
                    ValidationStage::Permissions,
                    RejectionCode::PermissionMalformed,
                    format!("usb filter '{entry}' is not vendor:product hex (wildcards allowed)"),
                )));
            }
        }

        for entry in &grants.network {
            if entry.trim().is_empty() || entry.contains('/') || entry.contains(' ') {
                return Err(Box::new(ValidationRejection::new(
                    ValidationStage::Permissions,
                    RejectionCode::PermissionMalformed,
                    format!("network entry '{entry}' is not a host pattern"),
                )));
            }
        }

        for entry in &grants.system {
            if entry != "*" && !RECOGNIZED_FACILITIES.contains(&entry.as_str()) {
                return Err(Box::new(ValidationRejection::new(
                    ValidationStage::Permissions,
                    RejectionCode::PermissionUnrecognized,
                    format!(
                        "system facility '{entry}' is outside the recognized taxonomy {RECOGNIZED_FACILITIES:?}"
                    ),
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_usb_filter(entry: &str) -> bool {
    let mut parts = entry.splitn(2, ':');
    let vendor = parts.next().unwrap_or("");
    let product = parts.next().unwrap_or("*");
    let ok = |s: &str| s == "*" || (s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit()));
    ok(vendor) && ok(product)
}

/// Dotted-numeric comparison; non-numeric tails compare as zero.
fn version_lt(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> {
        v.split('.')
            .map(|p| p.parse::<u32>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        if x != y {
            return x < y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashSet;

    fn write_package(dir: &Path, manifest_yaml: &str, entry: &str) {
        std::fs::write(dir.join("plugin.yaml"), manifest_yaml).unwrap();
        std::fs::write(dir.join("init.lua"), entry).unwrap();
    }

    fn validator() -> Validator {
        Validator::new(ValidationPolicy {
            require_signature: false,
            trusted_keys: Vec::new(),
            security_level: SecurityLevel::Medium,
            host_version: "0.1.0".to_string(),
        })
    }

    fn no_plugins() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn valid_package_passes_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: ok-plugin\nversion: \"1.0.0\"\n",
            "function on_event(e) end\n",
        );
        let validated = validator().validate(dir.path(), &no_plugins()).unwrap();
        assert_eq!(validated.manifest.id, "ok-plugin");
        assert_eq!(validated.security_level, SecurityLevel::Medium);
    }

    #[test]
    fn missing_entry_point_rejects_at_schema() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.yaml"),
            "id: no-entry\nversion: \"1.0\"\n",
        )
        .unwrap();

        let rejection = validator().validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.stage, ValidationStage::Schema);
        assert_eq!(rejection.code, RejectionCode::EntryPointMissing);
    }

    #[test]
    fn unknown_permission_category_rejects_at_schema() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: greedy\nversion: \"1.0\"\npermissions:\n  shell:\n    - \"/bin/sh\"\n",
            "",
        );
        let rejection = validator().validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.stage, ValidationStage::Schema);
        assert_eq!(rejection.code, RejectionCode::ManifestInvalid);
    }

    #[test]
    fn missing_dependency_rejects() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: needy\nversion: \"1.0\"\ndependencies:\n  - id: absent\n",
            "",
        );
        let rejection = validator().validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.stage, ValidationStage::Dependencies);
        assert_eq!(rejection.code, RejectionCode::DependencyMissing);
    }

    #[test]
    fn optional_dependency_may_be_absent() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: flexible\nversion: \"1.0\"\ndependencies:\n  - id: absent\n    optional: true\n",
            "",
        );
        assert!(validator().validate(dir.path(), &no_plugins()).is_ok());
    }

    #[test]
    fn newer_host_requirement_rejects() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: futuristic\nversion: \"1.0\"\nmin_host_version: \"99.0\"\n",
            "",
        );
        let rejection = validator().validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::HostIncompatible);
    }

    #[test]
    fn unsigned_package_rejected_when_policy_requires() {
        let dir = tempfile::tempdir().unwrap();
        write_package(dir.path(), "id: unsigned\nversion: \"1.0\"\n", "");

        let validator = Validator::new(ValidationPolicy {
            require_signature: true,
            trusted_keys: Vec::new(),
            security_level: SecurityLevel::High,
            host_version: "0.1.0".into(),
        });
        let rejection = validator.validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.stage, ValidationStage::Signature);
        assert_eq!(rejection.code, RejectionCode::SignatureMissing);
    }

    #[test]
    fn signed_package_verifies_against_trusted_key() {
        let dir = tempfile::tempdir().unwrap();
        let entry_source = "function on_event(e) end\n";

        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let signature = signing_key.sign(entry_source.as_bytes());
        let encoded_sig = BASE64.encode(signature.to_bytes());

        write_package(
            dir.path(),
            &format!("id: signed\nversion: \"1.0\"\nsignature: \"{encoded_sig}\"\n"),
            entry_source,
        );

        let validator = Validator::new(ValidationPolicy {
            require_signature: true,
            trusted_keys: vec![signing_key.verifying_key()],
            security_level: SecurityLevel::High,
            host_version: "0.1.0".into(),
        });
        assert!(validator.validate(dir.path(), &no_plugins()).is_ok());
    }

    #[test]
    fn signature_from_untrusted_key_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let entry_source = "return 1\n";

        let rogue = SigningKey::from_bytes(&[9u8; 32]);
        let signature = rogue.sign(entry_source.as_bytes());
        let encoded_sig = BASE64.encode(signature.to_bytes());

        write_package(
            dir.path(),
            &format!("id: rogue\nversion: \"1.0\"\nsignature: \"{encoded_sig}\"\n"),
            entry_source,
        );

        let trusted = SigningKey::from_bytes(&[7u8; 32]);
        let validator = Validator::new(ValidationPolicy {
            require_signature: true,
            trusted_keys: vec![trusted.verifying_key()],
            security_level: SecurityLevel::High,
            host_version: "0.1.0".into(),
        });
        let rejection = validator.validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::SignerUntrusted);
    }

    #[test]
    fn tampered_entry_point_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let signature = signing_key.sign(b"original contents");
        let encoded_sig = BASE64.encode(signature.to_bytes());

        write_package(
            dir.path(),
            &format!("id: tampered\nversion: \"1.0\"\nsignature: \"{encoded_sig}\"\n"),
            "tampered contents",
        );

        let validator = Validator::new(ValidationPolicy {
            require_signature: true,
            trusted_keys: vec![signing_key.verifying_key()],
            security_level: SecurityLevel::High,
            host_version: "0.1.0".into(),
        });
        assert!(validator.validate(dir.path(), &no_plugins()).is_err());
    }

    #[test]
    fn malformed_usb_filter_rejects() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: badusb\nversion: \"1.0\"\npermissions:\n  usb:\n    - \"zzzz:0001\"\n",
            "",
        );
        let rejection = validator().validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.stage, ValidationStage::Permissions);
        assert_eq!(rejection.code, RejectionCode::PermissionMalformed);
    }

    #[test]
    fn unrecognized_system_facility_rejects() {
        let dir = tempfile::tempdir().unwrap();
        write_package(
            dir.path(),
            "id: sysful\nversion: \"1.0\"\npermissions:\n  system:\n    - reboot\n",
            "",
        );
        let rejection = validator().validate(dir.path(), &no_plugins()).unwrap_err();
        assert_eq!(rejection.code, RejectionCode::PermissionUnrecognized);
    }

    #[test]
    fn version_comparison() {
        assert!(version_lt("0.1.0", "0.2.0"));
        assert!(version_lt("1.9", "1.10"));
        assert!(!version_lt("2.0", "1.9.9"));
        assert!(!version_lt("1.0", "1.0"));
    }
}
