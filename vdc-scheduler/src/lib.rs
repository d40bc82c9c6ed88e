//! VM placement.
//!
//! Stateless: the caller hands in a snapshot of hosts and non-terminated
//! VMs, and gets the chosen host id back. Allocation bookkeeping is computed
//! from the VM snapshot rather than trusted from the host rows, so a
//! placement decision is always consistent with one Store revision.

use anyhow::Error;
use tracing::debug;

use vdc_api_types::{api_err, Arch, Host, HostHealth, Ulid, VmRecord};

/// Fraction of host capacity withheld from placement.
const HEADROOM_PERCENT: u64 = 10;

/// What a VM needs from a host.
pub struct VmRequirements {
    pub arch: Arch,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_bytes: u64,
    pub image: String,
    pub anti_affinity: Option<String>,
    /// Set when re-scheduling an existing VM so its own usage is not
    /// double counted.
    pub vm_id: Option<Ulid>,
}

struct Usage {
    vcpus: u64,
    memory_mib: u64,
    active_vms: u64,
    tags: Vec<String>,
}

fn usage_on(host: &Host, vms: &[VmRecord], skip: Option<Ulid>) -> Usage {
    let mut usage = Usage {
        vcpus: 0,
        memory_mib: 0,
        active_vms: 0,
        tags: Vec::new(),
    };
    for vm in vms {
        if vm.host.as_deref() != Some(host.id.as_str()) || !vm.is_active() {
            continue;
        }
        if skip == Some(vm.id) {
            continue;
        }
        usage.vcpus += u64::from(vm.vcpus);
        usage.memory_mib += vm.memory_mib;
        usage.active_vms += 1;
        if let Some(tag) = &vm.anti_affinity {
            usage.tags.push(tag.clone());
        }
    }
    usage
}

fn with_headroom(value: u64) -> u64 {
    value * (100 - HEADROOM_PERCENT) / 100
}

/// Pick a host for a VM.
///
/// Filters by health, architecture, image presence and capacity (after a
/// 10% reserved headroom), then ranks the survivors by mean free CPU and
/// memory ratio as if the VM were already placed. Ties break on fewest
/// active VMs, then host id. Hosts already carrying the VM's anti-affinity
/// tag are excluded outright.
pub fn schedule(hosts: &[Host], vms: &[VmRecord], req: &VmRequirements) -> Result<String, Error> {
    let mut anti_affinity_blocked = false;
    let mut candidates = Vec::new();

    for host in hosts {
        if host.health != HostHealth::Ready || host.arch != req.arch {
            continue;
        }
        if !host.has_image(&req.image) {
            continue;
        }

        let usage = usage_on(host, vms, req.vm_id);

        let vcpu_limit = with_headroom(u64::from(host.capacity.vcpus));
        let mem_limit = with_headroom(host.capacity.memory_mib);
        let disk_limit = with_headroom(host.capacity.disk_bytes);
        if usage.vcpus + u64::from(req.vcpus) > vcpu_limit
            || usage.memory_mib + req.memory_mib > mem_limit
            || req.disk_bytes > disk_limit
        {
            continue;
        }

        if let Some(tag) = &req.anti_affinity {
            if usage.tags.iter().any(|t| t == tag) {
                anti_affinity_blocked = true;
                continue;
            }
        }

        let free_vcpu = vcpu_limit - usage.vcpus - u64::from(req.vcpus);
        let free_mem = mem_limit - usage.memory_mib - req.memory_mib;
        let score = (free_vcpu as f64 / vcpu_limit.max(1) as f64
            + free_mem as f64 / mem_limit.max(1) as f64)
            / 2.0;

        candidates.push((score, usage.active_vms, host.id.clone()));
    }

    if candidates.is_empty() {
        if anti_affinity_blocked {
            return Err(api_err!(
                Exhausted,
                "insufficient_capacity: anti-affinity tag '{}' blocks every eligible host",
                req.anti_affinity.as_deref().unwrap_or_default()
            ));
        }
        return Err(api_err!(
            Exhausted,
            "unschedulable: no host satisfies arch {}, image '{}' and capacity",
            req.arch,
            req.image
        ));
    }

    candidates.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });

    let (score, _, host) = &candidates[0];
    debug!(host, score, "scheduled vm");
    Ok(host.clone())
}

#[cfg(test)]
mod tests;
