//! Daemon configuration.
//!
//! One immutable snapshot, read from the environment at startup. The hosts
//! file declares the hypervisor fleet and the images available on it; it is
//! re-read only on restart.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use serde::Deserialize;

use vdc_api_types::{Arch, HostCapacity, Ipv4Cidr, PortRange};

pub struct Config {
    pub store_path: PathBuf,
    pub hosts_config: PathBuf,
    pub api_listen: String,
    pub ws_listen: String,
    pub public_ip_pool: Vec<Ipv4Cidr>,
    pub default_vpc_cidr: Ipv4Cidr,
    pub reconcile_workers: usize,
    pub host_verb_concurrency: usize,
    pub ssh_identity: Option<PathBuf>,
    /// Directory for SSH connection-sharing sockets.
    pub ssh_control_dir: PathBuf,
}

fn var(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        let store_path = PathBuf::from(
            var("STORE_PATH").unwrap_or_else(|| "/var/lib/vdc/store".to_string()),
        );
        let hosts_config = PathBuf::from(
            var("HOSTS_CONFIG").unwrap_or_else(|| "/etc/vdc/hosts.json".to_string()),
        );
        let api_listen = var("API_LISTEN").unwrap_or_else(|| "127.0.0.1:8700".to_string());
        let ws_listen = var("WS_LISTEN").unwrap_or_else(|| "127.0.0.1:8701".to_string());

        let mut public_ip_pool = Vec::new();
        if let Some(pool) = var("PUBLIC_IP_POOL") {
            for part in pool.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let cidr: Ipv4Cidr = part
                    .parse()
                    .with_context(|| format!("invalid PUBLIC_IP_POOL entry '{part}'"))?;
                public_ip_pool.push(cidr);
            }
        }

        let default_vpc_cidr: Ipv4Cidr = var("DEFAULT_VPC_CIDR")
            .unwrap_or_else(|| "10.0.0.0/24".to_string())
            .parse()
            .context("invalid DEFAULT_VPC_CIDR")?;
        if default_vpc_cidr.canonical() != default_vpc_cidr || default_vpc_cidr.mask() > 29 {
            bail!("invalid DEFAULT_VPC_CIDR {default_vpc_cidr}");
        }

        let reconcile_workers = match var("RECONCILE_WORKERS") {
            Some(value) => value.parse().context("invalid RECONCILE_WORKERS")?,
            None => 8,
        };
        if reconcile_workers == 0 {
            bail!("RECONCILE_WORKERS must be at least 1");
        }

        let host_verb_concurrency = match var("HOST_VERB_CONCURRENCY") {
            Some(value) => value.parse().context("invalid HOST_VERB_CONCURRENCY")?,
            None => 4,
        };
        if host_verb_concurrency == 0 {
            bail!("HOST_VERB_CONCURRENCY must be at least 1");
        }

        let ssh_identity = var("SSH_IDENTITY").map(PathBuf::from);
        let ssh_control_dir = store_path.join("ssh-control");

        Ok(Self {
            store_path,
            hosts_config,
            api_listen,
            ws_listen,
            public_ip_pool,
            default_vpc_cidr,
            reconcile_workers,
            host_verb_concurrency,
            ssh_identity,
            ssh_control_dir,
        })
    }
}

/// One host entry of the hosts file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub id: String,
    pub address: String,
    pub arch: Arch,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Drive this host through local exec instead of SSH.
    #[serde(default)]
    pub local: bool,
    pub capacity: HostCapacity,
    #[serde(default = "default_vm_root")]
    pub vm_root: String,
    #[serde(default = "default_uplink")]
    pub uplink: String,
    #[serde(default = "default_vnc_ports")]
    pub vnc_ports: PortRange,
    #[serde(default = "default_nat_ports")]
    pub nat_ports: PortRange,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_vm_root() -> String {
    "/var/lib/vdc".to_string()
}

fn default_uplink() -> String {
    "eth0".to_string()
}

fn default_vnc_ports() -> PortRange {
    PortRange {
        start: 5900,
        end: 5999,
    }
}

fn default_nat_ports() -> PortRange {
    PortRange {
        start: 40000,
        end: 40999,
    }
}

/// One image entry of the hosts file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub arch: Arch,
    pub sha256: String,
    /// Host id -> path of the image file on that host.
    pub paths: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsFile {
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
}

impl HostsFile {
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .with_context(|| format!("unable to read hosts config {path:?}"))?;
        let parsed: HostsFile = serde_json::from_slice(&data)
            .with_context(|| format!("unable to parse hosts config {path:?}"))?;

        let mut seen = std::collections::HashSet::new();
        for host in &parsed.hosts {
            vdc_api_types::verify_entity_name(&host.id)
                .with_context(|| format!("invalid host id '{}'", host.id))?;
            if !seen.insert(&host.id) {
                bail!("duplicate host id '{}' in hosts config", host.id);
            }
            if host.vnc_ports.start > host.vnc_ports.end
                || host.nat_ports.start > host.nat_ports.end
            {
                bail!("invalid port range for host '{}'", host.id);
            }
        }
        for image in &parsed.images {
            for host in image.paths.keys() {
                if !parsed.hosts.iter().any(|h| &h.id == host) {
                    bail!(
                        "image '{}' references unknown host '{host}'",
                        image.id
                    );
                }
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_file_parsing() {
        let raw = serde_json::json!({
            "hosts": [{
                "id": "h1",
                "address": "192.0.2.10",
                "arch": "x86_64",
                "capacity": { "vcpus": 16, "memory_mib": 32768, "disk_bytes": 1099511627776u64 },
            }],
            "images": [{
                "id": "ubuntu-20.04",
                "arch": "x86_64",
                "sha256": "a".repeat(64),
                "paths": { "h1": "/var/lib/vdc/images/ubuntu-20.04.qcow2" },
            }],
        });
        let parsed: HostsFile = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.hosts[0].ssh_user, "root");
        assert_eq!(parsed.hosts[0].vnc_ports.start, 5900);
        assert_eq!(parsed.images.len(), 1);
    }

    #[test]
    fn unknown_host_in_image_is_rejected() {
        let dir = std::env::temp_dir().join(format!(
            "vdcd-config-test-{}-{}",
            std::process::id(),
            vdc_api_types::time::epoch_millis()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "hosts": [],
                "images": [{
                    "id": "img",
                    "arch": "x86_64",
                    "sha256": "00",
                    "paths": { "ghost": "/x" },
                }],
            })
            .to_string(),
        )
        .unwrap();

        assert!(HostsFile::load(&path).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
