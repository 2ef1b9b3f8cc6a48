//! # Gantry Plugin Packages
//!
//! Everything that happens to third-party code *before* it runs: package
//! discovery, manifest parsing, and the staged validation pipeline that
//! gate-keeps entry into the worker pool.
//!
//! ## Package layout
//!
//! A plugin package is a directory containing a `plugin.yaml` manifest and a
//! Lua entry point:
//!
//! ```yaml
//! id: usb-logger
//! version: "1.2.0"
//! entry_point: init.lua
//! description: Logs attach/detach activity
//!
//! permissions:
//!   filesystem:
//!     - /var/log/usb-logger/**
//!   usb:
//!     - "046d:*"
//! ```
//!
//! Validation is sequential and short-circuits: schema, then dependencies
//! and host compatibility, then the package signature when policy demands
//! one, then permission-taxonomy sanity. A failure at any stage yields a
//! terminal rejection with a machine-readable code; corrected packages are
//! resubmitted, never retried automatically.

pub mod error;
pub mod manifest;
pub mod registry;
pub mod validator;

pub use error::{PluginError, Result};
pub use manifest::{ManifestDependency, PluginManifest};
pub use registry::{PluginRegistry, SubmissionReport};
pub use validator::{
    RejectionCode, ValidatedPlugin, ValidationPolicy, ValidationRejection, ValidationStage,
    Validator,
};
