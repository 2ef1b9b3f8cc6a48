//! Property tests for the permission upper bound.
//!
//! Whatever a worker asks for, nothing outside its declared grants may pass
//! the boundary: for every permission category, generated boundary-crossing
//! requests must be rejected, and requests inside the declared sets must be
//! accepted.

use gantry_core::{AuditTrail, PermissionGrants, ResourcePolicy, SecurityLevel};
use gantry_runtime::{BoundaryVerdict, HostCall, SecurityBoundary, WorkerMessage};
use proptest::prelude::*;
use std::path::PathBuf;

fn boundary() -> SecurityBoundary {
    // Writer is dropped: audit appends fail quietly, which is fine for a
    // pure screening property.
    let (audit, _writer) = AuditTrail::new(None, 16).unwrap();
    let grants = PermissionGrants {
        filesystem: vec!["/var/lib/gantry/sandbox/**".to_string()],
        network: vec!["api.allowed.example".to_string()],
        usb: vec!["046d:c52b".to_string()],
        system: vec!["clock".to_string()],
    };
    let policy = ResourcePolicy::for_level(SecurityLevel::Medium);
    SecurityBoundary::new("prop", &grants, &policy, false, audit).unwrap()
}

fn screen(call: HostCall) -> BoundaryVerdict {
    boundary().screen_inbound(&WorkerMessage::HostCall { call })
}

proptest! {
    #[test]
    fn filesystem_access_outside_declared_roots_is_rejected(
        segment in "[a-z]{1,12}",
        file in "[a-z]{1,12}",
    ) {
        // Absolute, well-formed, and definitely not under the declared root.
        let path = PathBuf::from(format!("/outside/{segment}/{file}"));
        let verdict = screen(HostCall::FsRead { path });
        prop_assert!(!verdict.is_accepted());
    }

    #[test]
    fn filesystem_access_inside_declared_roots_is_accepted(
        file in "[a-z]{1,12}",
    ) {
        let path = PathBuf::from(format!("/var/lib/gantry/sandbox/{file}"));
        let verdict = screen(HostCall::FsRead { path });
        prop_assert!(verdict.is_accepted());
    }

    #[test]
    fn network_access_to_undeclared_hosts_is_rejected(
        host in "[a-z]{1,10}\\.[a-z]{2,6}",
        port in 1u16..,
    ) {
        prop_assume!(host != "api.allowed.example");
        let verdict = screen(HostCall::NetProbe { host, port });
        prop_assert!(!verdict.is_accepted());
    }

    #[test]
    fn network_access_to_the_declared_host_is_accepted(port in 1u16..) {
        let verdict = screen(HostCall::NetProbe {
            host: "api.allowed.example".to_string(),
            port,
        });
        prop_assert!(verdict.is_accepted());
    }

    #[test]
    fn undeclared_system_facilities_are_rejected(facility in "[a-z_]{1,16}") {
        prop_assume!(facility != "clock");
        let verdict = screen(HostCall::SystemInfo { facility });
        prop_assert!(!verdict.is_accepted());
    }

    #[test]
    fn usb_visibility_never_exceeds_declared_filters(
        vendor in any::<u16>(),
        product in any::<u16>(),
    ) {
        let visible = boundary().allows_event(vendor, product);
        let declared = vendor == 0x046d && product == 0xc52b;
        prop_assert_eq!(visible, declared);
    }

    #[test]
    fn traversal_never_passes_even_under_declared_roots(
        file in "[a-z]{1,12}",
    ) {
        let path = PathBuf::from(format!("/var/lib/gantry/sandbox/../{file}"));
        let verdict = screen(HostCall::FsRead { path });
        prop_assert!(!verdict.is_accepted());
    }
}
