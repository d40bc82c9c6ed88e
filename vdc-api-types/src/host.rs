use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Arch;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    Ready,
    Unreachable,
    Unknown,
}

serde_plain::derive_display_from_serialize!(HostHealth);

/// Schedulable resources of a host, also used for the running total of
/// resources handed out to VMs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_bytes: u64,
}

/// An inclusive port range, e.g. for VNC displays or SSH NAT ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// A registered hypervisor host.
///
/// Registration data comes from the hosts config file; health, heartbeat and
/// the firewall digests are runtime bookkeeping owned by the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    /// Address the SSH transport connects to.
    pub address: String,
    pub arch: Arch,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub capacity: HostCapacity,
    /// Resources currently promised to non-terminated VMs.
    #[serde(default)]
    pub allocated: HostCapacity,
    pub health: HostHealth,
    pub last_heartbeat: i64,
    /// Per-host workspace; images, disks and volumes live below it.
    pub vm_root: String,
    /// Primary uplink interface used for NAT masquerade.
    pub uplink: String,
    pub vnc_ports: PortRange,
    pub nat_ports: PortRange,
    /// Image ids known present on this host.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// VPC chain name -> sha256 of the last applied firewall script.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fw_digests: BTreeMap<String, String>,
}

impl Host {
    /// Remaining capacity after subtracting current allocations.
    pub fn free(&self) -> HostCapacity {
        HostCapacity {
            vcpus: self.capacity.vcpus.saturating_sub(self.allocated.vcpus),
            memory_mib: self
                .capacity
                .memory_mib
                .saturating_sub(self.allocated.memory_mib),
            disk_bytes: self
                .capacity
                .disk_bytes
                .saturating_sub(self.allocated.disk_bytes),
        }
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.iter().any(|i| i == image)
    }
}
