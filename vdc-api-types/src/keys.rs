//! Store key namespace.
//!
//! Every entity lives under a fixed prefix; listing a prefix enumerates the
//! entity type. Keys reference each other by id only.

use std::net::Ipv4Addr;

use crate::{AllocScope, Ulid};

pub const VPC_PREFIX: &str = "/vpc/";
pub const SUBNET_PREFIX: &str = "/subnet/";
pub const VM_PREFIX: &str = "/vm/";
pub const DISK_PREFIX: &str = "/disk/";
pub const IMAGE_PREFIX: &str = "/image/";
pub const HOST_PREFIX: &str = "/host/";
pub const ALLOC_PREFIX: &str = "/alloc/";
pub const FIP_PREFIX: &str = "/fip/";
pub const FWRULE_PREFIX: &str = "/fwrule/";
pub const MIGRATION_PREFIX: &str = "/migration/";
pub const ORPHAN_PREFIX: &str = "/orphan/";

pub fn vpc(name: &str) -> String {
    format!("{VPC_PREFIX}{name}")
}

pub fn subnet(id: Ulid) -> String {
    format!("{SUBNET_PREFIX}{id}")
}

pub fn vm(id: Ulid) -> String {
    format!("{VM_PREFIX}{id}")
}

pub fn disk(id: Ulid) -> String {
    format!("{DISK_PREFIX}{id}")
}

pub fn image(id: &str) -> String {
    format!("{IMAGE_PREFIX}{id}")
}

pub fn host(id: &str) -> String {
    format!("{HOST_PREFIX}{id}")
}

pub fn alloc(scope: &AllocScope, address: Ipv4Addr) -> String {
    format!("{ALLOC_PREFIX}{scope}/{address}")
}

pub fn alloc_scope_prefix(scope: &AllocScope) -> String {
    format!("{ALLOC_PREFIX}{scope}/")
}

pub fn floating_ip(address: Ipv4Addr) -> String {
    format!("{FIP_PREFIX}{address}")
}

pub fn firewall_rule(vpc: &str, id: Ulid) -> String {
    format!("{FWRULE_PREFIX}{vpc}/{id}")
}

pub fn firewall_rule_prefix(vpc: &str) -> String {
    format!("{FWRULE_PREFIX}{vpc}/")
}

/// Migrations are keyed by VM id; this is what enforces "at most one live
/// migration per VM".
pub fn migration(vm: Ulid) -> String {
    format!("{MIGRATION_PREFIX}{vm}")
}

pub fn orphan(host: &str, path: &str) -> String {
    format!("{ORPHAN_PREFIX}{host}{path}")
}
