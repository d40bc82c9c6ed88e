//! Background sweeper.
//!
//! Periodically reaps expired address allocations and retries the removal
//! of orphaned host files left behind by best-effort teardowns.

use std::time::Duration;

use tracing::{debug, info, warn};

use vdc_api_types::{keys, time::epoch_i64, OrphanRecord, Ulid, VmRecord};
use vdc_driver::VerbContext;
use vdc_store::Expect;

use crate::context::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn sweeper_loop(state: &'static AppState) {
    loop {
        tokio::select! {
            _ = vdc_rest_server::shutdown_future() => return,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => (),
        }

        if let Err(err) = sweep_once(state).await {
            warn!("sweep failed: {err:#}");
        }
    }
}

async fn sweep_once(state: &'static AppState) -> Result<(), anyhow::Error> {
    let now = epoch_i64();

    // allocations: expired reservations of vanished owners, released rows
    // past their grace period
    let reaped = vdc_ipam::reap_expired(&state.store, now, |owner: Ulid| {
        match state
            .store
            .get_typed::<VmRecord>(&keys::vm(owner))
        {
            Ok(Some((vm, _))) => vm.is_active(),
            _ => false,
        }
    })?;
    if reaped > 0 {
        info!(reaped, "reaped expired ip allocations");
    }

    // orphaned host files
    for (key, value, rev) in state.store.list(keys::ORPHAN_PREFIX) {
        let orphan: OrphanRecord = match serde_json::from_value(value) {
            Ok(orphan) => orphan,
            Err(_) => continue,
        };
        let driver = match state.driver(&orphan.host) {
            Ok(driver) => driver,
            Err(_) => continue, // host deregistered; keep the record
        };
        match driver
            .delete_volume(&VerbContext::default(), &orphan.path)
            .await
        {
            Ok(()) => {
                debug!(host = %orphan.host, path = %orphan.path, "orphan removed");
                let _ = state.store.delete(&key, Expect::Rev(rev));
            }
            Err(err) => {
                debug!(host = %orphan.host, path = %orphan.path, "orphan still present: {err:#}");
            }
        }
    }

    Ok(())
}
