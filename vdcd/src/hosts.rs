//! Host registry: registration from the hosts file and the heartbeat loop.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Error};
use tracing::{info, warn};

use vdc_api_types::{keys, time::epoch_i64, Host, HostHealth, Image};
use vdc_driver::VerbContext;
use vdc_store::Expect;

use crate::config::HostsFile;
use crate::context::AppState;

/// Heartbeat probe interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive failed probes before a host is marked unreachable.
const HEARTBEAT_MISSES: u32 = 3;

/// Register (or re-register) hosts and images from the hosts file.
///
/// Registration updates static data; runtime bookkeeping (health, heartbeat,
/// applied firewall digests) of an existing row is preserved.
pub fn register_from_config(state: &AppState) -> Result<(), Error> {
    let parsed = HostsFile::load(&state.config.hosts_config)
        .context("hosts config rejected")?;

    for entry in &parsed.hosts {
        let key = keys::host(&entry.id);
        let existing = state.store.get_typed::<Host>(&key)?;

        let mut host = Host {
            id: entry.id.clone(),
            address: if entry.local {
                "local".to_string()
            } else {
                entry.address.clone()
            },
            arch: entry.arch,
            ssh_user: entry.ssh_user.clone(),
            ssh_port: entry.ssh_port,
            capacity: entry.capacity,
            allocated: Default::default(),
            health: HostHealth::Unknown,
            last_heartbeat: 0,
            vm_root: entry.vm_root.clone(),
            uplink: entry.uplink.clone(),
            vnc_ports: entry.vnc_ports,
            nat_ports: entry.nat_ports,
            images: Vec::new(),
            fw_digests: Default::default(),
        };

        host.images = parsed
            .images
            .iter()
            .filter(|image| image.paths.contains_key(&entry.id))
            .map(|image| image.id.clone())
            .collect();

        let expect = match existing {
            Some((old, rev)) => {
                host.health = old.health;
                host.last_heartbeat = old.last_heartbeat;
                host.allocated = old.allocated;
                host.fw_digests = old.fw_digests;
                Expect::Rev(rev)
            }
            None => Expect::Absent,
        };
        state.store.put(&key, &host, expect)?;
        state.drop_driver(&entry.id);
        info!(host = %entry.id, "host registered");
    }

    for entry in &parsed.images {
        let image = Image {
            id: entry.id.clone(),
            name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
            arch: entry.arch,
            sha256: entry.sha256.clone(),
            paths: entry.paths.clone(),
        };
        state
            .store
            .put(&keys::image(&entry.id), &image, Expect::Any)?;
    }

    Ok(())
}

fn set_health(state: &AppState, host_id: &str, health: HostHealth) -> Result<(), Error> {
    let (mut host, rev) = state.lookup_host(host_id)?;
    let changed = host.health != health;
    host.health = health;
    if health == HostHealth::Ready {
        host.last_heartbeat = epoch_i64();
    }
    state
        .store
        .put(&keys::host(host_id), &host, Expect::Rev(rev))?;
    if changed {
        info!(host = %host_id, %health, "host health changed");
    }
    Ok(())
}

/// Probe every registered host forever; a host missing three beats in a row
/// goes unreachable. Its VMs stay put: failover is explicitly not in scope.
pub async fn heartbeat_loop(state: &'static AppState) {
    let mut misses: HashMap<String, u32> = HashMap::new();

    loop {
        tokio::select! {
            _ = vdc_rest_server::shutdown_future() => return,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => (),
        }

        let hosts = match state.store.list_typed::<Host>(keys::HOST_PREFIX) {
            Ok(hosts) => hosts,
            Err(err) => {
                warn!("heartbeat: unable to list hosts: {err:#}");
                continue;
            }
        };

        for (host, _) in hosts {
            let driver = match state.driver(&host.id) {
                Ok(driver) => driver,
                Err(err) => {
                    warn!(host = %host.id, "heartbeat: no driver: {err:#}");
                    continue;
                }
            };

            let ctx = VerbContext::default().with_timeout(Duration::from_secs(10));
            match driver.ping(&ctx).await {
                Ok(()) => {
                    misses.remove(&host.id);
                    if let Err(err) = set_health(state, &host.id, HostHealth::Ready) {
                        warn!(host = %host.id, "heartbeat: {err:#}");
                    }
                }
                Err(err) => {
                    let count = misses.entry(host.id.clone()).or_insert(0);
                    *count += 1;
                    warn!(host = %host.id, misses = *count, "heartbeat failed: {err:#}");
                    if *count >= HEARTBEAT_MISSES {
                        if let Err(err) = set_health(state, &host.id, HostHealth::Unreachable) {
                            warn!(host = %host.id, "heartbeat: {err:#}");
                        }
                    }
                }
            }
        }
    }
}
