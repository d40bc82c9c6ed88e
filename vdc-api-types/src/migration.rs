use serde::{Deserialize, Serialize};

use crate::{api_bail, Ulid};

/// Phases of the live-migration state machine, in order. `Abort` is the
/// only out-of-order transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Prepare,
    Precopy,
    Switchover,
    Finalize,
    Abort,
}

serde_plain::derive_display_from_serialize!(MigrationPhase);

/// State of one live migration, keyed by VM id (one at a time per VM).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Migration {
    pub id: Ulid,
    pub vm: Ulid,
    pub source: String,
    pub destination: String,
    pub phase: MigrationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_downtime_ms: Option<u64>,
    #[serde(default)]
    pub compressed: bool,
    /// 0..=100
    pub progress: f64,
    /// Set by the abort endpoint; the coordinator acts on it at the next
    /// poll, so an abort survives a coordinator restart.
    #[serde(default)]
    pub abort_requested: bool,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Migration {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationCreateRequest {
    pub vm_name: String,
    /// Destination host id (the URI form `qemu+ssh://...` is built by the
    /// driver).
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_downtime_ms: Option<u64>,
    #[serde(default)]
    pub compressed: bool,
}

impl MigrationCreateRequest {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.vm_name.is_empty() {
            api_bail!(Validation, "missing required field 'vm_name'");
        }
        if self.destination.is_empty() {
            api_bail!(Validation, "missing required field 'destination'");
        }
        if self.bandwidth_bps == Some(0) {
            api_bail!(Validation, "bandwidth_bps must not be 0");
        }
        Ok(())
    }
}
