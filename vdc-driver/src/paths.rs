//! Host-side file layout, rooted at the host's `vm_root`.
//!
//! ```text
//! <vm-root>/images/            base images (provisioned out of band)
//! <vm-root>/disks/             root disks and cloud-init ISOs
//! <vm-root>/volumes/           data volumes
//! <vm-root>/consoles/          serial console sockets
//! <vm-root>/nvram/             per-domain UEFI varstores (aarch64)
//! <vm-root>/run/               scratch: seed dirs, migration result files
//! ```

use vdc_api_types::Ulid;

pub fn root_disk(vm_root: &str, vm_id: Ulid) -> String {
    format!("{vm_root}/disks/{vm_id}.qcow2")
}

pub fn cloudinit_iso(vm_root: &str, vm_id: Ulid) -> String {
    format!("{vm_root}/disks/{vm_id}-cidata.iso")
}

pub fn volume(vm_root: &str, disk_id: Ulid) -> String {
    format!("{vm_root}/volumes/{disk_id}.qcow2")
}

pub fn console_socket(vm_root: &str, vm_id: Ulid) -> String {
    format!("{vm_root}/consoles/{vm_id}.sock")
}

pub fn nvram(vm_root: &str, domain: &str) -> String {
    format!("{vm_root}/nvram/{domain}.fd")
}

pub fn migration_rc(vm_root: &str, domain: &str) -> String {
    format!("{vm_root}/run/migrate-{domain}.rc")
}

pub fn migration_log(vm_root: &str, domain: &str) -> String {
    format!("{vm_root}/run/migrate-{domain}.log")
}
