use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{api_bail, Arch, CloudInitDocument, ErrorCode, Ulid};

/// Desired or observed power state of a VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

serde_plain::derive_display_from_serialize!(PowerState);

/// Lifecycle state of a VM as tracked by the reconciler.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Creating,
    Stopped,
    Running,
    Stopping,
    Starting,
    Migrating,
    Resizing,
    Error,
    Terminating,
    Terminated,
}

serde_plain::derive_display_from_serialize!(VmStatus);

impl VmStatus {
    /// Terminated VMs release their name and no longer count against host
    /// capacity.
    pub fn is_terminated(self) -> bool {
        matches!(self, VmStatus::Terminated)
    }
}

/// A virtual NIC, attached to the per-VPC bridge on the owner host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Ulid>,
}

/// Reference from a VM to an attached data disk. Slot 0 is the root disk,
/// slot 1 the cloud-init ISO; data volumes start at slot 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDiskRef {
    pub disk: Ulid,
    pub slot: u8,
}

impl VmDiskRef {
    pub const FIRST_DATA_SLOT: u8 = 2;
    pub const LAST_DATA_SLOT: u8 = 25;

    /// The guest device name for a slot (`vda`, `vdb`, ...).
    pub fn device_name(slot: u8) -> String {
        format!("vd{}", (b'a' + slot) as char)
    }
}

/// Last error recorded by the reconciler on a VM row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmError {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: i64,
    /// The reconciliation step that failed, e.g. `define_domain`.
    pub step: String,
}

/// The authoritative VM record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: Ulid,
    pub name: String,
    /// Owner host; `None` until scheduled and after termination.
    pub host: Option<String>,
    pub image: String,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub root_disk_gb: u64,
    pub vpc: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<VmDiskRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<Nic>,
    pub desired_power: PowerState,
    pub observed_power: PowerState,
    pub status: VmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_nat_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_socket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floating_ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_affinity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    /// Increases on every observed-state transition; echoed by the API for
    /// optimistic concurrency.
    pub generation: u64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<VmError>,
}

impl VmRecord {
    /// The private address of the primary NIC.
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.nics.first().map(|nic| nic.ip)
    }

    /// Whether the VM still holds capacity and resources on its host.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminated()
    }

    /// First free data disk slot, if any.
    pub fn free_disk_slot(&self) -> Option<u8> {
        (VmDiskRef::FIRST_DATA_SLOT..=VmDiskRef::LAST_DATA_SLOT)
            .find(|slot| !self.disks.iter().any(|d| d.slot == *slot))
    }
}

pub const MIN_MEMORY_MB: u64 = 512;
pub const MEMORY_STEP_MB: u64 = 512;
pub const MAX_MEMORY_MB: u64 = 512 * 1024;
pub const MAX_CPU_CORES: u32 = 64;
pub const MIN_DISK_GB: u64 = 10;

/// Create-VM request. `network_name` is a deprecated alias for `vpc`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmCreateRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_disk_gb")]
    pub disk_size_gb: u64,
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<Arch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_affinity: Option<String>,
    /// Client-supplied idempotence token: re-issuing an identical request
    /// with the same token yields the same VM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<bool>,
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_disk_gb() -> u64 {
    MIN_DISK_GB
}

impl VmCreateRequest {
    /// Validate ranges and resolve the VPC name (`vpc` wins over the
    /// deprecated `network_name` alias).
    pub fn validate(&self) -> Result<String, anyhow::Error> {
        crate::verify_entity_name(&self.name)?;

        let vpc = match (&self.vpc, &self.network_name) {
            (Some(vpc), _) => vpc.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => api_bail!(Validation, "missing required field 'vpc'"),
        };

        if self.cpu_cores < 1 || self.cpu_cores > MAX_CPU_CORES {
            api_bail!(
                Validation,
                "cpu_cores must be between 1 and {MAX_CPU_CORES}"
            );
        }
        if self.memory_mb < MIN_MEMORY_MB
            || self.memory_mb > MAX_MEMORY_MB
            || self.memory_mb % MEMORY_STEP_MB != 0
        {
            api_bail!(
                Validation,
                "memory_mb must be a multiple of {MEMORY_STEP_MB} between {MIN_MEMORY_MB} and {MAX_MEMORY_MB}"
            );
        }
        if self.disk_size_gb < MIN_DISK_GB {
            api_bail!(Validation, "disk_size_gb must be at least {MIN_DISK_GB}");
        }
        if self.image_id.is_empty() {
            api_bail!(Validation, "missing required field 'image_id'");
        }
        if let Some(cloud_init) = &self.cloud_init {
            cloud_init.validate()?;
        }

        Ok(vpc)
    }
}

/// Offline resize request; at least one field must be present.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmResizeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

impl VmResizeRequest {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.cpu_cores.is_none() && self.memory_mb.is_none() {
            api_bail!(Validation, "resize request without cpu_cores or memory_mb");
        }
        if let Some(cores) = self.cpu_cores {
            if cores < 1 || cores > MAX_CPU_CORES {
                api_bail!(Validation, "cpu_cores must be between 1 and {MAX_CPU_CORES}");
            }
        }
        if let Some(memory_mb) = self.memory_mb {
            if memory_mb < MIN_MEMORY_MB
                || memory_mb > MAX_MEMORY_MB
                || memory_mb % MEMORY_STEP_MB != 0
            {
                api_bail!(
                    Validation,
                    "memory_mb must be a multiple of {MEMORY_STEP_MB} between {MIN_MEMORY_MB} and {MAX_MEMORY_MB}"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> VmCreateRequest {
        serde_json::from_value(serde_json::json!({
            "name": "a",
            "vpc": "v1",
            "image_id": "ubuntu-20.04",
            "cpu_cores": 1,
            "memory_mb": 1024,
            "disk_size_gb": 10,
        }))
        .unwrap()
    }

    #[test]
    fn create_request_validation() {
        assert_eq!(request().validate().unwrap(), "v1");

        let mut req = request();
        req.vpc = None;
        req.network_name = Some("legacy".into());
        assert_eq!(req.validate().unwrap(), "legacy");
        req.network_name = None;
        req.validate().unwrap_err();

        let mut req = request();
        req.memory_mb = 768;
        req.validate().unwrap_err();

        let mut req = request();
        req.cpu_cores = 0;
        req.validate().unwrap_err();

        let mut req = request();
        req.disk_size_gb = 5;
        req.validate().unwrap_err();
    }

    #[test]
    fn unknown_request_fields_rejected() {
        let value = serde_json::json!({
            "name": "a",
            "vpc": "v1",
            "image_id": "img",
            "flavour": "m1.large",
        });
        assert!(serde_json::from_value::<VmCreateRequest>(value).is_err());
    }

    #[test]
    fn disk_slots() {
        assert_eq!(VmDiskRef::device_name(0), "vda");
        assert_eq!(VmDiskRef::device_name(2), "vdc");
    }
}
