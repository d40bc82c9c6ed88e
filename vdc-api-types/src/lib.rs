//! Common API and storage types for the VDC control plane.
//!
//! Everything the Store persists and the HTTP API exchanges is defined here,
//! so that the daemon, the drivers and the allocators share one vocabulary.

use serde::{Deserialize, Serialize};

mod cidr;
pub use cidr::{CidrError, Ipv4Cidr};

mod cloud_init;
pub use cloud_init::{AptSource, CloudInitDocument, CloudInitUser, CloudInitWriteFile};

mod disk;
pub use disk::{Disk, DiskAttachment, DiskCreateRequest, DiskStatus, OrphanRecord};

mod error;
pub use error::{error_code, ApiError, ErrorCode};

mod host;
pub use host::{Host, HostCapacity, HostHealth, PortRange};

mod image;
pub use image::Image;

mod ip;
pub use ip::{AllocScope, AllocStatus, FloatingIp, FloatingIpStatus, IpAllocation};

mod migration;
pub use migration::{Migration, MigrationCreateRequest, MigrationPhase};

mod ulid;
pub use ulid::Ulid;

mod vm;
pub use vm::{
    Nic, PowerState, VmCreateRequest, VmDiskRef, VmError, VmRecord, VmResizeRequest, VmStatus,
};

mod vpc;
pub use vpc::{
    FirewallDirection, FirewallProtocol, FirewallRule, FirewallRuleCreateRequest, Subnet,
    SubnetCreateRequest, Vpc, VpcCreateRequest, DEFAULT_RULE_PRIORITY,
};

pub mod keys;
pub mod time;

/// Guest and host CPU architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
}

serde_plain::derive_display_from_serialize!(Arch);
serde_plain::derive_fromstr_from_deserialize!(Arch);

const NAME_REGEX_STR: &str = r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$";

/// Check an entity name (VPC, VM, disk, host).
///
/// Names are DNS-label-like: lowercase alphanumerics plus `._-`, at most 63
/// characters, no leading or trailing separator.
pub fn verify_entity_name(name: &str) -> Result<(), anyhow::Error> {
    use std::sync::LazyLock;
    static NAME_REGEX: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(NAME_REGEX_STR).unwrap());

    if name.is_empty() || name.len() > 63 {
        api_bail!(Validation, "name must be between 1 and 63 characters");
    }
    if !NAME_REGEX.is_match(name) {
        api_bail!(
            Validation,
            "name '{name}' contains invalid characters (allowed: a-z, 0-9, '.', '_', '-')"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_names() {
        for good in ["a", "web-1", "db.prod", "x0_y1", "h1"] {
            verify_entity_name(good).unwrap();
        }
        for bad in ["", "-x", "x-", "UPPER", "a b", "ü", &"a".repeat(64)] {
            verify_entity_name(bad).unwrap_err();
        }
    }

    #[test]
    fn arch_round_trip() {
        assert_eq!(Arch::X86_64.to_string(), "x86_64");
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert!("armv7".parse::<Arch>().is_err());
    }
}
