use serde::{Deserialize, Serialize};

use crate::{api_bail, Ulid};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Available,
    InUse,
    Resizing,
    Error,
}

serde_plain::derive_display_from_serialize!(DiskStatus);

/// Exclusive attachment of a disk to one VM at one device slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub vm: Ulid,
    pub slot: u8,
}

/// A block volume backed by a qcow2 file on its owner host.
///
/// Disks survive VM termination: detach returns them to `available` and the
/// backing file stays on the host it was created on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Disk {
    pub id: Ulid,
    pub name: String,
    pub size_gb: u64,
    /// Backing file path; set once the volume exists on a host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Host owning the backing file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub status: DiskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<DiskAttachment>,
    /// Set by a failed teardown; the sweeper retries removal.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub orphaned: bool,
    pub created_at: i64,
}

/// A host file that could not be proven gone during teardown. The sweeper
/// retries the removal until it succeeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrphanRecord {
    pub host: String,
    pub path: String,
    pub noted_at: i64,
}

pub const MIN_VOLUME_GB: u64 = 1;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiskCreateRequest {
    pub name: String,
    pub size_gb: u64,
}

impl DiskCreateRequest {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        crate::verify_entity_name(&self.name)?;
        if self.size_gb < MIN_VOLUME_GB {
            api_bail!(Validation, "size_gb must be at least {MIN_VOLUME_GB}");
        }
        Ok(())
    }
}
