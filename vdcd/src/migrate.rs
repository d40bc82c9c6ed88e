//! The live-migration coordinator.
//!
//! One coordinator task per migration drives the phase machine
//! `prepare -> precopy -> switchover -> finalize | abort`, with all progress
//! externalized on the Migration row so a restarted daemon resumes from
//! Store state. The owner-host flip and the end of the `migrating` status
//! happen in one Store batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tracing::{info, warn};

use vdc_api_types::{
    api_err, error_code, keys, time::epoch_i64, Disk, ErrorCode, Migration, MigrationPhase,
    PowerState, Ulid, VmRecord, VmStatus,
};
use vdc_driver::{paths, MigrationProgress, VerbContext};
use vdc_rest_server::WorkerTask;
use vdc_store::{Expect, TxOp};

use crate::context::{AppState, HostDriver};
use crate::reconcile::step;

/// Poll interval against the source host.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Give the migration process this long to create a visible job before the
/// attempt counts as failed.
const START_GRACE: Duration = Duration::from_secs(120);

pub fn spawn_coordinator(state: &'static AppState, vm_id: Ulid) -> Ulid {
    WorkerTask::spawn("migrate-vm", Some(format!("vm/{vm_id}")), move |worker| {
        run(state, worker, vm_id)
    })
}

/// Resume coordinators for unfinished migrations (daemon restart).
pub fn resume_all(state: &'static AppState) -> Result<(), Error> {
    for (migration, _) in state
        .store
        .list_typed::<Migration>(keys::MIGRATION_PREFIX)?
    {
        if !migration.is_finished() {
            info!(vm = %migration.vm, "resuming migration coordinator");
            spawn_coordinator(state, migration.vm);
        }
    }
    Ok(())
}

fn update_migration<F>(state: &AppState, vm: Ulid, mut mutate: F) -> Result<Migration, Error>
where
    F: FnMut(&mut Migration),
{
    loop {
        let Some((mut migration, rev)) = state
            .store
            .get_typed::<Migration>(&keys::migration(vm))?
        else {
            return Err(api_err!(NotFound, "migration for vm {vm} vanished"));
        };
        mutate(&mut migration);
        match state
            .store
            .put(&keys::migration(vm), &migration, Expect::Rev(rev))
        {
            Ok(_) => return Ok(migration),
            Err(err) if error_code(&err) == ErrorCode::Conflict => continue,
            Err(err) => return Err(err),
        }
    }
}

async fn run(
    state: &'static AppState,
    worker: Arc<WorkerTask>,
    vm_id: Ulid,
) -> Result<(), Error> {
    let Some((migration, _)) = state
        .store
        .get_typed::<Migration>(&keys::migration(vm_id))?
    else {
        return Ok(());
    };
    if migration.is_finished() {
        return Ok(());
    }

    let (vm, _) = state.lookup_vm(vm_id)?;
    let source_id = migration.source.clone();
    let dest_id = migration.destination.clone();
    let source = state.driver(&source_id)?;
    let dest = state.driver(&dest_id)?;

    match drive(state, &worker, &vm, &migration, &source, &dest).await {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(vm = %vm_id, "migration failed: {err:#}");
            // once switchover began the guest may already run on the
            // destination; tearing that down would destroy a live VM
            let past_switchover = match state
                .store
                .get_typed::<Migration>(&keys::migration(vm_id))
            {
                Ok(Some((current, _))) => {
                    current.is_finished()
                        || matches!(
                            current.phase,
                            MigrationPhase::Switchover | MigrationPhase::Finalize
                        )
                }
                _ => false,
            };
            if past_switchover {
                record_late_failure(state, vm_id, &err);
            } else {
                abort(state, &vm, &source, &dest, &err.to_string()).await;
            }
            Err(err)
        }
    }
}

/// A failure after the switchover point: leave both hypervisors untouched,
/// record the reason and make sure the VM is not stuck in `migrating`.
fn record_late_failure(state: &AppState, vm_id: Ulid, err: &Error) {
    let result = update_migration(state, vm_id, |m| {
        if m.error.is_none() {
            m.error = Some(err.to_string());
        }
        if m.finished_at.is_none() {
            m.finished_at = Some(epoch_i64());
        }
    });
    if let Err(record_err) = result {
        warn!(vm = %vm_id, "unable to record migration failure: {record_err:#}");
    }

    // if the owner-host flip never committed the VM still says migrating;
    // it keeps running on the source, so running is the truthful status
    let result = state.update_vm(vm_id, |record| {
        if record.status == VmStatus::Migrating {
            record.status = VmStatus::Running;
            record.generation += 1;
        }
        Ok(())
    });
    if let Err(record_err) = result {
        warn!(vm = %vm_id, "unable to restore vm status after late failure: {record_err:#}");
    }
}

async fn drive(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
    migration: &Migration,
    source: &HostDriver,
    dest: &HostDriver,
) -> Result<(), Error> {
    let ctx = VerbContext::default();
    let ctx = &ctx;

    // ---- prepare: the destination must be able to receive the VM ----
    prepare_destination(state, worker, vm, dest).await?;

    if migration.phase == MigrationPhase::Prepare {
        update_migration(state, vm.id, |m| {
            m.phase = MigrationPhase::Precopy;
        })?;
        source
            .begin_migration(
                ctx,
                &vm.name,
                dest.host(),
                migration.bandwidth_bps,
                migration.max_downtime_ms,
                migration.compressed,
                true,
            )
            .await?;
        info!(vm = %vm.id, source = %migration.source, dest = %migration.destination, "precopy started");
    }

    // ---- precopy: poll the source once a second ----
    let mut starting_since = tokio::time::Instant::now();
    loop {
        worker.check_abort()?;
        tokio::time::sleep(POLL_INTERVAL).await;

        let Some((current, _)) = state
            .store
            .get_typed::<Migration>(&keys::migration(vm.id))?
        else {
            anyhow::bail!("migration row vanished");
        };
        if current.abort_requested {
            anyhow::bail!("migration aborted by request");
        }

        match source.query_migration(ctx, &vm.name).await? {
            MigrationProgress::Starting => {
                if starting_since.elapsed() > START_GRACE {
                    anyhow::bail!("migration never produced a job on the source");
                }
            }
            MigrationProgress::Running { percent } => {
                starting_since = tokio::time::Instant::now();
                worker.progress(percent / 100.0);
                update_migration(state, vm.id, |m| {
                    m.progress = percent;
                })?;
            }
            MigrationProgress::Completed => break,
            MigrationProgress::Failed { reason } => {
                anyhow::bail!("source reported failure: {reason}");
            }
        }
    }

    // ---- switchover: flip the owner host exactly once, atomically with
    // leaving the migrating status ----
    update_migration(state, vm.id, |m| {
        m.phase = MigrationPhase::Switchover;
        m.progress = 100.0;
    })?;

    loop {
        let (fresh_vm, vm_rev) = state.lookup_vm(vm.id)?;
        let (mut fresh_migration, mig_rev) = state
            .store
            .get_typed::<Migration>(&keys::migration(vm.id))?
            .ok_or_else(|| api_err!(NotFound, "migration row vanished"))?;

        let mut updated_vm = fresh_vm.clone();
        updated_vm.host = Some(migration.destination.clone());
        updated_vm.status = VmStatus::Running;
        updated_vm.observed_power = PowerState::On;
        updated_vm.generation += 1;

        fresh_migration.phase = MigrationPhase::Finalize;
        fresh_migration.finished_at = Some(epoch_i64());

        match state.store.batch(vec![
            TxOp::put(keys::vm(vm.id), Expect::Rev(vm_rev), &updated_vm)?,
            TxOp::put(
                keys::migration(vm.id),
                Expect::Rev(mig_rev),
                &fresh_migration,
            )?,
        ]) {
            Ok(_) => break,
            Err(err) if error_code(&err) == ErrorCode::Conflict => continue,
            Err(err) => return Err(err),
        }
    }

    // ---- finalize: clean the source ----
    // the guest lives on the destination now; everything from here on is
    // best effort and must never propagate as a migration failure
    state.hub.close(vm.id);
    state.forget_vm(vm.id);

    if let Err(err) = source.undefine_domain(ctx, &vm.name).await {
        warn!(vm = %vm.id, "undefine of stale source domain failed: {err:#}");
    }
    let vm_root = source.host().vm_root.clone();
    for path in [
        paths::root_disk(&vm_root, vm.id),
        paths::cloudinit_iso(&vm_root, vm.id),
    ] {
        if let Err(err) = source.delete_volume(ctx, &path).await {
            warn!(vm = %vm.id, "source cleanup failed for {path}: {err:#}");
        }
    }
    if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
        if let Err(err) = source.drop_ssh_nat(ctx, port, nic.ip).await {
            warn!(vm = %vm.id, "source nat cleanup failed: {err:#}");
        }
    }
    if let (Some(floating), Some(nic)) = (vm.floating_ip, vm.nics.first()) {
        if let Err(err) = source.drop_floating_nat(ctx, floating, nic.ip).await {
            warn!(vm = %vm.id, "source floating nat cleanup failed: {err:#}");
        }
    }

    info!(vm = %vm.id, dest = %migration.destination, "migration finished");
    Ok(())
}

/// Make the destination able to receive the domain: workspace, image,
/// network, firewall, disk twins, seed ISO and NAT rules.
async fn prepare_destination(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
    dest: &HostDriver,
) -> Result<(), Error> {
    let ctx = VerbContext::default();
    let ctx = &ctx;
    let (vpc, _) = state.lookup_vpc(&vm.vpc)?;
    let vpc_ref = &vpc;

    step(worker, "dest_workspace", || async move {
        dest.ensure_workspace(ctx).await
    })
    .await?;

    let image = state
        .store
        .get_typed::<vdc_api_types::Image>(&keys::image(&vm.image))?
        .map(|(image, _)| image)
        .ok_or_else(|| api_err!(NotFound, "no such image '{}'", vm.image))?;
    let image_ref = &image;
    let image_path = step(worker, "dest_image", || async move {
        dest.ensure_image(ctx, image_ref).await
    })
    .await?;

    step(worker, "dest_network", || async move {
        dest.define_network(ctx, vpc_ref).await
    })
    .await?;
    step(worker, "dest_firewall", || async move {
        crate::reconcile::vpc::push_firewall(state, dest, vpc_ref).await
    })
    .await?;

    // pre-create matching disk files for --copy-storage-all
    let image_path_ref = image_path.as_str();
    let (vm_id, root_disk_gb) = (vm.id, vm.root_disk_gb);
    step(worker, "dest_root_disk", || async move {
        dest.create_root_disk(ctx, vm_id, image_path_ref, root_disk_gb)
            .await
            .map(|_| ())
    })
    .await?;
    for disk_ref in &vm.disks {
        let Some((disk, _)) = state.store.get_typed::<Disk>(&keys::disk(disk_ref.disk))? else {
            continue;
        };
        let (disk_id, size_gb) = (disk.id, disk.size_gb);
        step(worker, "dest_volume", || async move {
            dest.create_volume(ctx, disk_id, size_gb).await.map(|_| ())
        })
        .await?;
    }

    let user_data = vdc_driver::render_user_data(vm.cloud_init.as_ref(), &vm.name)?;
    let meta_data = vdc_driver::render_meta_data(&vm.id, &vm.name);
    let user_data_ref = user_data.as_str();
    let meta_data_ref = meta_data.as_str();
    step(worker, "dest_seed", || async move {
        dest.build_cloudinit_iso(ctx, vm_id, user_data_ref, meta_data_ref)
            .await
            .map(|_| ())
    })
    .await?;

    if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
        let ip = nic.ip;
        step(worker, "dest_nat", || async move {
            dest.ensure_ssh_nat(ctx, port, ip).await
        })
        .await?;
    }
    if let (Some(floating), Some(nic)) = (vm.floating_ip, vm.nics.first()) {
        let ip = nic.ip;
        step(worker, "dest_floating_nat", || async move {
            dest.ensure_floating_nat(ctx, floating, ip).await
        })
        .await?;
    }

    Ok(())
}

/// Abort: cancel on the source, tear down destination artifacts, leave the
/// VM on the source unmodified and record the reason.
async fn abort(
    state: &'static AppState,
    vm: &VmRecord,
    source: &HostDriver,
    dest: &HostDriver,
    reason: &str,
) {
    let ctx = VerbContext::default();

    if let Err(err) = source.cancel_migration(&ctx, &vm.name).await {
        warn!(vm = %vm.id, "cancel on source failed: {err:#}");
    }

    // destination artifacts: partial domain, disk twins, seed
    if let Err(err) = dest.undefine_domain(&ctx, &vm.name).await {
        warn!(vm = %vm.id, "dest cleanup failed: {err:#}");
    }
    let vm_root = dest.host().vm_root.clone();
    let mut paths_to_remove = vec![
        paths::root_disk(&vm_root, vm.id),
        paths::cloudinit_iso(&vm_root, vm.id),
    ];
    for disk_ref in &vm.disks {
        paths_to_remove.push(paths::volume(&vm_root, disk_ref.disk));
    }
    for path in paths_to_remove {
        if let Err(err) = dest.delete_volume(&ctx, &path).await {
            warn!(vm = %vm.id, "dest cleanup failed for {path}: {err:#}");
        }
    }

    let result = update_migration(state, vm.id, |m| {
        m.phase = MigrationPhase::Abort;
        m.error = Some(reason.to_string());
        m.finished_at = Some(epoch_i64());
    });
    if let Err(err) = result {
        warn!(vm = %vm.id, "unable to record migration abort: {err:#}");
    }

    let result = state.update_vm(vm.id, |record| {
        if record.status == VmStatus::Migrating {
            record.status = VmStatus::Running;
            record.generation += 1;
        }
        Ok(())
    });
    if let Err(err) = result {
        warn!(vm = %vm.id, "unable to restore vm status after abort: {err:#}");
    }

    info!(vm = %vm.id, reason, "migration aborted");
}
