//! The per-VM reconciliation state machine.
//!
//! ```text
//! creating -> (schedule, ensure image, define network, allocate ip,
//!              create disks, define domain, bind ip, nat) -> stopped|starting
//! starting -> running            stopping -> stopped
//! resizing -> stopped|running    (offline: stop, edit definition, start)
//! any      -> terminating -> terminated
//! ```
//!
//! Each step is idempotent and retried with backoff on transient driver
//! failures. A terminal failure rolls back only what the current transition
//! created, records the error on the VM row and parks the VM in `error`
//! until the user retries. Teardown is best effort: what cannot be proven
//! gone is recorded as an orphan for the sweeper.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tracing::{info, warn};

use vdc_api_types::{
    api_err, error_code, keys, time::epoch_i64, Disk, DiskStatus, Image, Nic, OrphanRecord,
    PowerState, Subnet, Ulid, VmError, VmRecord, VmStatus, Vpc,
};
use vdc_driver::{paths, DomainDisk, DomainSpec, DomainState, VerbContext};
use vdc_rest_server::WorkerTask;
use vdc_store::{Expect, TxOp};

use crate::context::{AppState, HostDriver};
use crate::reconcile::step;

/// Upper bound for one VM transition.
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(600);

/// How long a graceful shutdown may take before the domain is destroyed.
const STOP_FORCE_AFTER: Duration = Duration::from_secs(60);

struct StepFailure {
    step: &'static str,
    error: Error,
}

type StepResult = Result<bool, StepFailure>;

async fn run_step<T, F, Fut>(
    worker: &Arc<WorkerTask>,
    name: &'static str,
    run: F,
) -> Result<T, StepFailure>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    step(worker, name, run)
        .await
        .map_err(|error| StepFailure { step: name, error })
}

fn fail(step: &'static str, error: Error) -> StepFailure {
    StepFailure { step, error }
}

/// Drive one VM toward its desired state until it settles.
pub async fn reconcile(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    id: Ulid,
) -> Result<(), Error> {
    loop {
        worker.check_abort()?;

        let Some((vm, _)) = state.store.get_typed::<VmRecord>(&keys::vm(id))? else {
            return Ok(());
        };

        let transition = match vm.status {
            VmStatus::Creating => do_create(state, worker, &vm).await,
            VmStatus::Starting => do_start(state, worker, &vm).await,
            VmStatus::Stopping => do_stop(state, worker, &vm).await,
            VmStatus::Resizing => do_resize(state, worker, &vm).await,
            VmStatus::Terminating => do_terminate(state, worker, &vm).await,
            VmStatus::Running | VmStatus::Stopped => converge(state, &vm).await,
            // owned by the migration coordinator / parked
            VmStatus::Migrating | VmStatus::Error | VmStatus::Terminated => return Ok(()),
        };

        match transition {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(failure) => {
                record_failure(state, id, &failure)?;
                return Ok(());
            }
        }
    }
}

fn record_failure(state: &AppState, id: Ulid, failure: &StepFailure) -> Result<(), Error> {
    warn!(
        vm = %id,
        step = failure.step,
        "transition failed terminally: {:#}",
        failure.error
    );
    state.update_vm(id, |vm| {
        vm.status = VmStatus::Error;
        vm.last_error = Some(VmError {
            code: error_code(&failure.error),
            message: failure.error.to_string(),
            timestamp: epoch_i64(),
            step: failure.step.to_string(),
        });
        vm.generation += 1;
        Ok(())
    })?;
    Ok(())
}

fn verb_ctx() -> VerbContext {
    VerbContext::default()
}

/// What a failed create has to undo. Only resources created by the current
/// transition land here.
enum Rollback {
    ReleaseIp(std::net::Ipv4Addr),
    DeleteVolume { host: String, path: String },
    UndefineDomain { host: String, name: String },
}

async fn run_rollback(state: &AppState, vm: &VmRecord, actions: Vec<Rollback>) {
    let ctx = verb_ctx();
    for action in actions.into_iter().rev() {
        let result: Result<(), Error> = match &action {
            Rollback::ReleaseIp(address) => {
                let scope = vdc_api_types::AllocScope::VpcPrivate(vm.vpc.clone());
                match vdc_ipam::release(&state.store, &scope, *address, Some(vm.id), epoch_i64()) {
                    Ok(Some(op)) => state.store.batch(vec![op]).map(|_| ()),
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Rollback::DeleteVolume { host, path } => match state.driver(host) {
                Ok(driver) => driver.delete_volume(&ctx, path).await,
                Err(err) => Err(err),
            },
            Rollback::UndefineDomain { host, name } => match state.driver(host) {
                Ok(driver) => driver.undefine_domain(&ctx, name).await,
                Err(err) => Err(err),
            },
        };
        if let Err(err) = result {
            warn!(vm = %vm.id, "rollback action failed: {err:#}");
        }
    }
}

async fn do_create(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
) -> StepResult {
    let mut rollback = Vec::new();
    let result = tokio::time::timeout(
        TRANSITION_TIMEOUT,
        create_pipeline(state, worker, vm.id, &mut rollback),
    )
    .await
    .unwrap_or_else(|_| {
        Err(fail(
            "create",
            api_err!(DriverTimeout, "create transition timed out"),
        ))
    });

    if result.is_err() {
        run_rollback(state, vm, rollback).await;
    }
    result
}

async fn create_pipeline(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    id: Ulid,
    rollback: &mut Vec<Rollback>,
) -> StepResult {
    let (mut vm, _) = state.lookup_vm(id).map_err(|e| fail("load", e))?;

    // place the VM onto a host
    if vm.host.is_none() {
        let requirements = vdc_scheduler::VmRequirements {
            arch: vm.arch,
            vcpus: vm.vcpus,
            memory_mib: vm.memory_mib,
            disk_bytes: vm.root_disk_gb << 30,
            image: vm.image.clone(),
            anti_affinity: vm.anti_affinity.clone(),
            vm_id: Some(vm.id),
        };
        let requirements = &requirements;
        let host_id = run_step(worker, "schedule", || async move {
            let hosts: Vec<_> = state
                .store
                .list_typed::<vdc_api_types::Host>(keys::HOST_PREFIX)?
                .into_iter()
                .map(|(host, _)| host)
                .collect();
            let vms: Vec<_> = state
                .store
                .list_typed::<VmRecord>(keys::VM_PREFIX)?
                .into_iter()
                .map(|(vm, _)| vm)
                .collect();
            vdc_scheduler::schedule(&hosts, &vms, requirements)
        })
        .await?;
        info!(vm = %vm.id, host = %host_id, "vm scheduled");

        let (updated, _) = state
            .update_vm(id, |vm| {
                if vm.host.is_none() {
                    vm.host = Some(host_id.clone());
                }
                Ok(())
            })
            .map_err(|e| fail("schedule", e))?;
        vm = updated;
    }

    let host_id = vm.host.clone().expect("scheduled vm has a host");
    let driver = state.driver(&host_id).map_err(|e| fail("driver", e))?;
    let vm_root = driver.host().vm_root.clone();
    let drv = &driver;

    run_step(worker, "ensure_workspace", || async move {
        drv.ensure_workspace(&verb_ctx()).await
    })
    .await?;

    // image must be present; downloads are out of scope
    let image = load_image(state, &vm.image).map_err(|e| fail("ensure_image", e))?;
    let image_ref = &image;
    let image_path = run_step(worker, "ensure_image", || async move {
        drv.ensure_image(&verb_ctx(), image_ref).await
    })
    .await?;

    let (vpc, _) = state
        .lookup_vpc(&vm.vpc)
        .map_err(|e| fail("define_network", e))?;
    let vpc_ref = &vpc;
    run_step(worker, "define_network", || async move {
        drv.define_network(&verb_ctx(), vpc_ref).await
    })
    .await?;

    run_step(worker, "apply_firewall", || async move {
        super::vpc::push_firewall(state, drv, vpc_ref).await
    })
    .await?;

    // private address, reserved now and bound once the domain exists
    if vm.nics.is_empty() {
        let address = run_step(worker, "allocate_ip", || async move {
            allocate_nic(state, vpc_ref, id)
        })
        .await?;
        rollback.push(Rollback::ReleaseIp(address));
        let (updated, _) = state.lookup_vm(id).map_err(|e| fail("allocate_ip", e))?;
        vm = updated;
    }

    // console/vnc/nat endpoints
    if vm.vnc_port.is_none() || vm.ssh_nat_port.is_none() || vm.serial_socket.is_none() {
        let serial_socket = paths::console_socket(&vm_root, id);
        let host_ref = host_id.as_str();
        let (vnc_port, nat_port) = run_step(worker, "allocate_ports", || async move {
            allocate_ports(state, host_ref, id)
        })
        .await?;
        let (updated, _) = state
            .update_vm(id, |vm| {
                vm.vnc_port.get_or_insert(vnc_port);
                vm.ssh_nat_port.get_or_insert(nat_port);
                vm.serial_socket.get_or_insert(serial_socket.clone());
                Ok(())
            })
            .map_err(|e| fail("allocate_ports", e))?;
        vm = updated;
    }

    let image_path_ref = image_path.as_str();
    let root_disk_gb = vm.root_disk_gb;
    let root_path = run_step(worker, "create_root_disk", || async move {
        drv.create_root_disk(&verb_ctx(), id, image_path_ref, root_disk_gb)
            .await
    })
    .await?;
    rollback.push(Rollback::DeleteVolume {
        host: host_id.clone(),
        path: root_path.clone(),
    });

    let user_data = vdc_driver::render_user_data(vm.cloud_init.as_ref(), &vm.name)
        .map_err(|e| fail("build_cloudinit_iso", e))?;
    let meta_data = vdc_driver::render_meta_data(&id, &vm.name);
    let user_data_ref = user_data.as_str();
    let meta_data_ref = meta_data.as_str();
    let iso_path = run_step(worker, "build_cloudinit_iso", || async move {
        drv.build_cloudinit_iso(&verb_ctx(), id, user_data_ref, meta_data_ref)
            .await
    })
    .await?;
    rollback.push(Rollback::DeleteVolume {
        host: host_id.clone(),
        path: iso_path.clone(),
    });

    let spec = domain_spec(&vm, &vpc, &vm_root, &root_path, &iso_path, &[]);
    let spec_ref = &spec;
    run_step(worker, "define_domain", || async move {
        drv.define_domain(&verb_ctx(), spec_ref).await
    })
    .await?;
    rollback.push(Rollback::UndefineDomain {
        host: host_id.clone(),
        name: vm.name.clone(),
    });

    // successful attach: flip the reservation to bound
    let vm_ref = &vm;
    run_step(worker, "bind_ip", || async move {
        let Some(nic) = vm_ref.nics.first() else {
            return Ok(());
        };
        let scope = vdc_api_types::AllocScope::VpcPrivate(vm_ref.vpc.clone());
        let op = vdc_ipam::bind(&state.store, &scope, nic.ip, id, epoch_i64())?;
        state.store.batch(vec![op])?;
        Ok(())
    })
    .await?;

    if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
        let ip = nic.ip;
        run_step(worker, "ssh_nat", || async move {
            drv.ensure_ssh_nat(&verb_ctx(), port, ip).await
        })
        .await?;
    }

    let next = if vm.desired_power == PowerState::On {
        VmStatus::Starting
    } else {
        VmStatus::Stopped
    };
    state
        .update_vm(id, |vm| {
            vm.status = next;
            vm.observed_power = PowerState::Off;
            vm.generation += 1;
            vm.last_error = None;
            Ok(())
        })
        .map_err(|e| fail("finalize", e))?;

    info!(vm = %id, host = %host_id, "vm created");
    Ok(true)
}

fn load_image(state: &AppState, image_id: &str) -> Result<Image, Error> {
    state
        .store
        .get_typed::<Image>(&keys::image(image_id))?
        .map(|(image, _)| image)
        .ok_or_else(|| api_err!(NotFound, "no such image '{image_id}'"))
}

/// Reserve a private address and record the NIC on the VM row in one batch.
fn allocate_nic(state: &AppState, vpc: &Vpc, id: Ulid) -> Result<std::net::Ipv4Addr, Error> {
    let subnets: Vec<Subnet> = state
        .store
        .list_typed::<Subnet>(keys::SUBNET_PREFIX)?
        .into_iter()
        .map(|(subnet, _)| subnet)
        .filter(|subnet| subnet.vpc == vpc.name)
        .collect();

    loop {
        let (mut vm, rev) = state
            .store
            .get_typed::<VmRecord>(&keys::vm(id))?
            .ok_or_else(|| api_err!(NotFound, "vm vanished during ip allocation"))?;
        if let Some(nic) = vm.nics.first() {
            return Ok(nic.ip);
        }

        let reservation =
            vdc_ipam::reserve_private(&state.store, vpc, &subnets, Some(id), None, epoch_i64())?;
        let subnet = subnets
            .iter()
            .find(|s| s.cidr.contains_address(&reservation.address))
            .map(|s| s.id);
        vm.nics.push(Nic {
            mac: vdc_driver::mac_for(&id),
            ip: reservation.address,
            subnet,
        });

        let address = reservation.address;
        match state.store.batch(vec![
            reservation.op,
            TxOp::put(keys::vm(id), Expect::Rev(rev), &vm)?,
        ]) {
            Ok(_) => return Ok(address),
            Err(err) if error_code(&err) == vdc_api_types::ErrorCode::Conflict => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Pick free VNC and SSH NAT ports on a host from its configured ranges.
fn allocate_ports(state: &AppState, host_id: &str, id: Ulid) -> Result<(u16, u16), Error> {
    let (host, _) = state.lookup_host(host_id)?;
    let vms: Vec<VmRecord> = state
        .store
        .list_typed::<VmRecord>(keys::VM_PREFIX)?
        .into_iter()
        .map(|(vm, _)| vm)
        .filter(|vm| vm.id != id && vm.host.as_deref() == Some(host_id) && vm.is_active())
        .collect();

    let vnc = host
        .vnc_ports
        .iter()
        .find(|port| !vms.iter().any(|vm| vm.vnc_port == Some(*port)))
        .ok_or_else(|| api_err!(Exhausted, "no free vnc port on host {host_id}"))?;
    let nat = host
        .nat_ports
        .iter()
        .find(|port| !vms.iter().any(|vm| vm.ssh_nat_port == Some(*port)))
        .ok_or_else(|| api_err!(Exhausted, "no free nat port on host {host_id}"))?;
    Ok((vnc, nat))
}

/// Assemble the domain definition from the authoritative records.
pub fn domain_spec(
    vm: &VmRecord,
    vpc: &Vpc,
    vm_root: &str,
    root_path: &str,
    iso_path: &str,
    volumes: &[(String, u8)],
) -> DomainSpec {
    let mut disks = vec![
        DomainDisk {
            path: root_path.to_string(),
            device: vdc_api_types::VmDiskRef::device_name(0),
            format: "qcow2",
            read_only: false,
        },
        DomainDisk {
            path: iso_path.to_string(),
            device: vdc_api_types::VmDiskRef::device_name(1),
            format: "raw",
            read_only: true,
        },
    ];
    for (path, slot) in volumes {
        disks.push(DomainDisk {
            path: path.clone(),
            device: vdc_api_types::VmDiskRef::device_name(*slot),
            format: "qcow2",
            read_only: false,
        });
    }

    DomainSpec {
        name: vm.name.clone(),
        vm_id: vm.id,
        arch: vm.arch,
        vcpus: vm.vcpus,
        memory_mib: vm.memory_mib,
        disks,
        bridge: vpc.bridge_name(),
        mtu: vpc.mtu,
        mac: vm
            .nics
            .first()
            .map(|nic| nic.mac.clone())
            .unwrap_or_else(|| vdc_driver::mac_for(&vm.id)),
        serial_socket: vm.serial_socket.clone().unwrap_or_default(),
        vnc_port: vm.vnc_port.unwrap_or(5900),
        nvram_path: paths::nvram(vm_root, &vm.name),
    }
}

async fn do_start(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
) -> StepResult {
    let driver = driver_for(state, vm)?;
    let drv = &driver;
    let name = vm.name.as_str();

    run_step(worker, "start_domain", || async move {
        drv.start_domain(&verb_ctx(), name).await
    })
    .await?;

    refresh_observed(state, &driver, vm).await;
    state
        .update_vm(vm.id, |vm| {
            vm.status = VmStatus::Running;
            vm.observed_power = PowerState::On;
            vm.generation += 1;
            vm.last_error = None;
            Ok(())
        })
        .map_err(|e| fail("start_domain", e))?;
    info!(vm = %vm.id, "vm started");
    Ok(false)
}

async fn do_stop(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
) -> StepResult {
    let driver = driver_for(state, vm)?;
    let drv = &driver;
    let name = vm.name.as_str();

    run_step(worker, "stop_domain", || async move {
        drv.stop_domain(&verb_ctx(), name, STOP_FORCE_AFTER).await
    })
    .await?;

    state.hub.close(vm.id);
    state
        .update_vm(vm.id, |vm| {
            vm.status = VmStatus::Stopped;
            vm.observed_power = PowerState::Off;
            vm.generation += 1;
            vm.last_error = None;
            Ok(())
        })
        .map_err(|e| fail("stop_domain", e))?;
    info!(vm = %vm.id, "vm stopped");
    Ok(false)
}

/// Offline resize: stop if needed, edit the definition, restart if the VM
/// wants to run.
async fn do_resize(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
) -> StepResult {
    let driver = driver_for(state, vm)?;
    let drv = &driver;
    let name = vm.name.as_str();
    let (vcpus, memory_mib) = (vm.vcpus, vm.memory_mib);

    run_step(worker, "stop_domain", || async move {
        drv.stop_domain(&verb_ctx(), name, STOP_FORCE_AFTER).await
    })
    .await?;

    run_step(worker, "resize_domain", || async move {
        drv.resize_domain(&verb_ctx(), name, vcpus, memory_mib).await
    })
    .await?;

    let next = if vm.desired_power == PowerState::On {
        VmStatus::Starting
    } else {
        VmStatus::Stopped
    };
    state
        .update_vm(vm.id, |vm| {
            vm.status = next;
            vm.observed_power = PowerState::Off;
            vm.generation += 1;
            vm.last_error = None;
            Ok(())
        })
        .map_err(|e| fail("resize_domain", e))?;
    info!(vm = %vm.id, vcpus, memory_mib, "vm resized");
    Ok(true)
}

/// Settle a VM that is nominally stable: refresh observed state and chase
/// the desired power state.
async fn converge(state: &'static AppState, vm: &VmRecord) -> StepResult {
    let driver = driver_for(state, vm)?;
    let observed = refresh_observed(state, &driver, vm).await;

    if let Some(observed) = observed {
        if observed != vm.observed_power {
            state
                .update_vm(vm.id, |vm| {
                    vm.observed_power = observed;
                    vm.generation += 1;
                    Ok(())
                })
                .map_err(|e| fail("refresh", e))?;
        }

        if vm.desired_power == PowerState::On && observed == PowerState::Off {
            state
                .update_vm(vm.id, |vm| {
                    vm.status = VmStatus::Starting;
                    vm.generation += 1;
                    Ok(())
                })
                .map_err(|e| fail("refresh", e))?;
            return Ok(true);
        }
        if vm.desired_power == PowerState::Off && observed == PowerState::On {
            state
                .update_vm(vm.id, |vm| {
                    vm.status = VmStatus::Stopping;
                    vm.generation += 1;
                    Ok(())
                })
                .map_err(|e| fail("refresh", e))?;
            return Ok(true);
        }
    }

    Ok(false)
}

async fn refresh_observed(
    state: &AppState,
    driver: &HostDriver,
    vm: &VmRecord,
) -> Option<PowerState> {
    match driver.domain_status(&verb_ctx(), &vm.name).await {
        Ok(Some(status)) => {
            let power = match status.state {
                DomainState::Running | DomainState::Paused => PowerState::On,
                DomainState::ShutOff | DomainState::Crashed => PowerState::Off,
                DomainState::Other => PowerState::Unknown,
            };
            state.record_status(vm.id, status);
            Some(power)
        }
        Ok(None) => Some(PowerState::Off),
        Err(err) => {
            warn!(vm = %vm.id, "status refresh failed: {err:#}");
            None
        }
    }
}

fn driver_for(state: &AppState, vm: &VmRecord) -> Result<HostDriver, StepFailure> {
    let host = vm.host.as_deref().ok_or_else(|| {
        fail(
            "driver",
            api_err!(Internal, "vm {} has no owner host", vm.id),
        )
    })?;
    state.driver(host).map_err(|e| fail("driver", e))
}

/// Tear the VM down. Best effort: every failure is recorded, resources that
/// cannot be proven gone become orphan records for the sweeper.
async fn do_terminate(
    state: &'static AppState,
    worker: &Arc<WorkerTask>,
    vm: &VmRecord,
) -> StepResult {
    let _ = worker;
    let mut failures: Vec<String> = Vec::new();
    let ctx = verb_ctx();

    state.hub.close(vm.id);

    if let Some(host_id) = vm.host.clone() {
        match state.driver(&host_id) {
            Err(error) => failures.push(format!("driver: {error:#}")),
            Ok(driver) => {
                let vm_root = driver.host().vm_root.clone();

                if let Err(err) = driver
                    .stop_domain(&ctx, &vm.name, Duration::from_secs(10))
                    .await
                {
                    failures.push(format!("stop: {err:#}"));
                }

                // data disks survive the VM and return to the pool
                for disk_ref in &vm.disks {
                    if let Err(err) =
                        release_disk(state, &driver, &ctx, vm, disk_ref.disk, disk_ref.slot).await
                    {
                        failures.push(format!("detach disk {}: {err:#}", disk_ref.disk));
                    }
                }

                if let Err(err) = driver.undefine_domain(&ctx, &vm.name).await {
                    failures.push(format!("undefine: {err:#}"));
                }

                for path in [
                    paths::root_disk(&vm_root, vm.id),
                    paths::cloudinit_iso(&vm_root, vm.id),
                ] {
                    if let Err(err) = driver.delete_volume(&ctx, &path).await {
                        failures.push(format!("delete {path}: {err:#}"));
                        note_orphan(state, &host_id, &path);
                    }
                }

                if let (Some(port), Some(nic)) = (vm.ssh_nat_port, vm.nics.first()) {
                    if let Err(err) = driver.drop_ssh_nat(&ctx, port, nic.ip).await {
                        failures.push(format!("nat: {err:#}"));
                    }
                }
                if let (Some(floating), Some(nic)) = (vm.floating_ip, vm.nics.first()) {
                    if let Err(err) = driver.drop_floating_nat(&ctx, floating, nic.ip).await {
                        failures.push(format!("floating nat: {err:#}"));
                    }
                }
            }
        }
    }

    // release addresses; the grace period delays reuse
    let now = epoch_i64();
    for nic in &vm.nics {
        let scope = vdc_api_types::AllocScope::VpcPrivate(vm.vpc.clone());
        match vdc_ipam::release(&state.store, &scope, nic.ip, Some(vm.id), now) {
            Ok(Some(op)) => {
                if let Err(err) = state.store.batch(vec![op]) {
                    failures.push(format!("release {}: {err:#}", nic.ip));
                }
            }
            Ok(None) => (),
            Err(err) => failures.push(format!("release {}: {err:#}", nic.ip)),
        }
    }
    if let Some(floating) = vm.floating_ip {
        if let Err(err) = crate::api::ips::unbind_floating(state, floating, vm.id, now) {
            failures.push(format!("release floating {floating}: {err:#}"));
        }
    }

    let had_failures = !failures.is_empty();
    let message = failures.join("; ");
    state
        .update_vm(vm.id, |vm| {
            vm.status = VmStatus::Terminated;
            vm.host = None;
            vm.observed_power = PowerState::Off;
            vm.generation += 1;
            vm.last_error = had_failures.then(|| VmError {
                code: vdc_api_types::ErrorCode::Internal,
                message: message.clone(),
                timestamp: epoch_i64(),
                step: "terminate".to_string(),
            });
            Ok(())
        })
        .map_err(|e| fail("terminate", e))?;

    state.forget_vm(vm.id);
    info!(vm = %vm.id, "vm terminated");
    Ok(false)
}

async fn release_disk(
    state: &AppState,
    driver: &HostDriver,
    ctx: &VerbContext,
    vm: &VmRecord,
    disk_id: Ulid,
    slot: u8,
) -> Result<(), Error> {
    let Some((mut disk, rev)) = state.store.get_typed::<Disk>(&keys::disk(disk_id))? else {
        return Ok(());
    };

    if let Some(path) = &disk.path {
        let device = vdc_api_types::VmDiskRef::device_name(slot);
        driver.detach_volume(ctx, &vm.name, path, &device).await?;
    }

    disk.status = DiskStatus::Available;
    disk.attachment = None;
    state
        .store
        .put(&keys::disk(disk_id), &disk, Expect::Rev(rev))?;
    Ok(())
}

fn note_orphan(state: &AppState, host: &str, path: &str) {
    let record = OrphanRecord {
        host: host.to_string(),
        path: path.to_string(),
        noted_at: epoch_i64(),
    };
    if let Err(err) =
        state
            .store
            .put(&keys::orphan(host, path), &record, vdc_store::Expect::Any)
    {
        warn!("unable to record orphan {path} on {host}: {err:#}");
    }
}
