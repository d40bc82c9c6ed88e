//! Per-VPC reconciliation: bridges and firewall chains on every host that
//! carries one of the VPC's VMs.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Error;
use tracing::info;

use vdc_api_types::{keys, FirewallRule, Host, VmRecord, Vpc};
use vdc_driver::VerbContext;
use vdc_rest_server::WorkerTask;
use vdc_store::Expect;

use crate::context::{AppState, HostDriver};
use crate::reconcile::step;

/// Compile the VPC's rule set and push it, skipping hosts whose applied
/// digest already matches.
pub async fn push_firewall(
    state: &AppState,
    driver: &HostDriver,
    vpc: &Vpc,
) -> Result<(), Error> {
    let rules: Vec<FirewallRule> = state
        .store
        .list_typed::<FirewallRule>(&keys::firewall_rule_prefix(&vpc.name))?
        .into_iter()
        .map(|(rule, _)| rule)
        .collect();

    let script = vdc_firewall::compile(vpc, &rules);
    let digest = vdc_firewall::digest(&script);

    let host_id = driver.host_id().to_string();
    let (host, rev) = state.lookup_host(&host_id)?;
    if host.fw_digests.get(&vpc.chain) == Some(&digest) {
        return Ok(());
    }

    driver.apply_firewall(&VerbContext::default(), vpc, &script).await?;

    // stale digest just means one redundant push later on
    let mut host = host;
    host.fw_digests.insert(vpc.chain.clone(), digest);
    let _ = state
        .store
        .put(&keys::host(&host_id), &host, Expect::Rev(rev));

    info!(host = %host_id, vpc = %vpc.name, "firewall pushed");
    Ok(())
}

/// Hosts currently carrying a non-terminated VM of this VPC.
fn hosts_of_vpc(state: &AppState, vpc: &str) -> Result<Vec<String>, Error> {
    let mut hosts = BTreeSet::new();
    for (vm, _) in state.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
        if vm.vpc == vpc && vm.is_active() {
            if let Some(host) = vm.host {
                hosts.insert(host);
            }
        }
    }
    Ok(hosts.into_iter().collect())
}

/// Bring the VPC's network and firewall up to date everywhere it is used.
pub async fn reconcile(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    name: &str,
) -> Result<(), Error> {
    let Some((vpc, _)) = state
        .store
        .get_typed::<Vpc>(&keys::vpc(name))?
    else {
        return Ok(()); // deleted; teardown ran in the delete worker
    };

    let vpc_ref = &vpc;
    for host_id in hosts_of_vpc(state, name)? {
        let driver = state.driver(&host_id)?;
        let drv = &driver;
        step(worker, "define_network", || async move {
            drv.define_network(&VerbContext::default(), vpc_ref).await
        })
        .await?;
        step(worker, "apply_firewall", || async move {
            push_firewall(state, drv, vpc_ref).await
        })
        .await?;
    }

    Ok(())
}

/// Remove the VPC's bridge and chains from every ready host; used by the
/// delete endpoint after the row checks passed.
pub async fn teardown_everywhere(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vpc: &Vpc,
) -> Result<(), Error> {
    for (host, _) in state.store.list_typed::<Host>(keys::HOST_PREFIX)? {
        let driver = state.driver(&host.id)?;
        let drv = &driver;
        step(worker, "destroy_network", || async move {
            drv.destroy_network(&VerbContext::default(), vpc).await
        })
        .await?;

        // forget the applied digest
        if let Ok((mut host, rev)) = state.lookup_host(&host.id) {
            if host.fw_digests.remove(&vpc.chain).is_some() {
                let _ = state
                    .store
                    .put(&keys::host(&host.id), &host, Expect::Rev(rev));
            }
        }
    }
    Ok(())
}
