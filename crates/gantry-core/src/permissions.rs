//! Declared permission grants and runtime narrowing.
//!
//! A plugin's declared permissions are fixed at validation time and form a
//! strict upper bound for the lifetime of every instance loaded from that
//! manifest. The only mutation the type offers is [`PermissionGrants::narrow`],
//! which removes entries; nothing can add one after validation.

use crate::error::{CoreError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The recognized permission taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    Filesystem,
    Network,
    Usb,
    System,
}

impl PermissionCategory {
    pub fn all() -> [Self; 4] {
        [Self::Filesystem, Self::Network, Self::Usb, Self::System]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Usb => "usb",
            Self::System => "system",
        }
    }
}

/// Per-category permission grants declared in a plugin manifest.
///
/// Filesystem entries are path globs; network entries are host patterns;
/// usb entries are `vendor:product` filters (`*` wildcards allowed); system
/// entries name host facilities (`clock`, `hostname`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PermissionGrants {
    #[serde(default)]
    pub filesystem: Vec<String>,

    #[serde(default)]
    pub network: Vec<String>,

    #[serde(default)]
    pub usb: Vec<String>,

    #[serde(default)]
    pub system: Vec<String>,
}

impl PermissionGrants {
    /// Grants that allow nothing at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// True when no category grants anything.
    pub fn is_empty(&self) -> bool {
        self.filesystem.is_empty()
            && self.network.is_empty()
            && self.usb.is_empty()
            && self.system.is_empty()
    }

    /// Entries for one category.
    pub fn entries(&self, category: PermissionCategory) -> &[String] {
        match category {
            PermissionCategory::Filesystem => &self.filesystem,
            PermissionCategory::Network => &self.network,
            PermissionCategory::Usb => &self.usb,
            PermissionCategory::System => &self.system,
        }
    }

    /// Remove every entry not retained by `keep`. Narrowing is the only
    /// permitted runtime mutation; widening requires re-validation of a new
    /// manifest.
    pub fn narrow(&mut self, category: PermissionCategory, keep: impl Fn(&str) -> bool) {
        let entries = match category {
            PermissionCategory::Filesystem => &mut self.filesystem,
            PermissionCategory::Network => &mut self.network,
            PermissionCategory::Usb => &mut self.usb,
            PermissionCategory::System => &mut self.system,
        };
        entries.retain(|e| keep(e));
    }

    /// True when every grant in `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        PermissionCategory::all().iter().all(|&cat| {
            self.entries(cat)
                .iter()
                .all(|e| other.entries(cat).contains(e))
        })
    }

    /// Compile the grants into a matcher usable on the hot path.
    pub fn compile(&self) -> Result<CompiledGrants> {
        CompiledGrants::new(self)
    }
}

/// Pre-compiled matchers for boundary-time permission checks.
pub struct CompiledGrants {
    filesystem: GlobSet,
    network: Vec<String>,
    usb: Vec<String>,
    system: Vec<String>,
}

impl CompiledGrants {
    fn new(grants: &PermissionGrants) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for entry in &grants.filesystem {
            let glob = Glob::new(entry).map_err(|e| CoreError::InvalidPermission {
                entry: entry.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let filesystem = builder.build().map_err(|e| CoreError::InvalidPermission {
            entry: "<filesystem set>".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            filesystem,
            network: grants.network.clone(),
            usb: grants.usb.clone(),
            system: grants.system.clone(),
        })
    }

    /// Does any declared filesystem glob cover this path?
    pub fn allows_path(&self, path: &Path) -> bool {
        self.filesystem.is_match(path)
    }

    /// Does any declared network entry match this host? Entries of the form
    /// `*.example.com` match subdomains; exact entries match exactly.
    pub fn allows_host(&self, host: &str) -> bool {
        self.network.iter().any(|entry| {
            if let Some(suffix) = entry.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                entry == host
            }
        })
    }

    /// Does any declared usb filter match this vendor/product pair?
    pub fn allows_device(&self, vendor_id: u16, product_id: u16) -> bool {
        let vendor = format!("{vendor_id:04x}");
        let product = format!("{product_id:04x}");
        self.usb.iter().any(|entry| {
            let mut parts = entry.splitn(2, ':');
            let v = parts.next().unwrap_or("");
            let p = parts.next().unwrap_or("*");
            (v == "*" || v.eq_ignore_ascii_case(&vendor)) && (p == "*" || p.eq_ignore_ascii_case(&product))
        })
    }

    /// Is this system facility declared?
    pub fn allows_system(&self, facility: &str) -> bool {
        self.system.iter().any(|e| e == facility || e == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn grants() -> PermissionGrants {
        PermissionGrants {
            filesystem: vec!["/var/lib/gantry/**".to_string()],
            network: vec!["api.example.com".to_string(), "*.vendor.io".to_string()],
            usb: vec!["1d6b:*".to_string(), "046d:c52b".to_string()],
            system: vec!["clock".to_string()],
        }
    }

    #[test]
    fn narrow_removes_entries() {
        let mut g = grants();
        g.narrow(PermissionCategory::Network, |e| e == "api.example.com");
        assert_eq!(g.network, vec!["api.example.com".to_string()]);
    }

    #[test]
    fn narrowed_grants_are_subset() {
        let full = grants();
        let mut narrowed = grants();
        narrowed.narrow(PermissionCategory::Usb, |_| false);
        assert!(narrowed.is_subset_of(&full));
        assert!(!full.is_subset_of(&narrowed));
    }

    #[test]
    fn compiled_path_matching() {
        let compiled = grants().compile().unwrap();
        assert!(compiled.allows_path(&PathBuf::from("/var/lib/gantry/state/cache.db")));
        assert!(!compiled.allows_path(&PathBuf::from("/etc/passwd")));
    }

    #[test]
    fn compiled_host_matching() {
        let compiled = grants().compile().unwrap();
        assert!(compiled.allows_host("api.example.com"));
        assert!(compiled.allows_host("cdn.vendor.io"));
        assert!(compiled.allows_host("vendor.io"));
        assert!(!compiled.allows_host("evil.com"));
        assert!(!compiled.allows_host("notvendor.io"));
    }

    #[test]
    fn compiled_device_matching() {
        let compiled = grants().compile().unwrap();
        assert!(compiled.allows_device(0x1d6b, 0x0002));
        assert!(compiled.allows_device(0x046d, 0xc52b));
        assert!(!compiled.allows_device(0x046d, 0xc52c));
        assert!(!compiled.allows_device(0xdead, 0xbeef));
    }

    #[test]
    fn compiled_system_matching() {
        let compiled = grants().compile().unwrap();
        assert!(compiled.allows_system("clock"));
        assert!(!compiled.allows_system("hostname"));
    }

    #[test]
    fn empty_grants_allow_nothing() {
        let compiled = PermissionGrants::none().compile().unwrap();
        assert!(!compiled.allows_path(&PathBuf::from("/tmp/x")));
        assert!(!compiled.allows_host("example.com"));
        assert!(!compiled.allows_device(0, 0));
        assert!(!compiled.allows_system("clock"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let g = PermissionGrants {
            filesystem: vec!["/data/[".to_string()],
            ..Default::default()
        };
        assert!(g.compile().is_err());
    }
}
