//! `/api/vms`: VM lifecycle, status, disk/IP attachment, console access.

use anyhow::Error;
use serde::Deserialize;
use serde_json::{json, Value};

use vdc_api_types::{
    api_err, error_code, keys, time::epoch_i64, Disk, DiskStatus, ErrorCode, Image, PowerState,
    Ulid, VmCreateRequest, VmDiskRef, VmRecord, VmResizeRequest, VmStatus,
};
use vdc_driver::VerbContext;
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router, SubdirMap, WorkerTask};
use vdc_store::Expect;

use super::{parse_body, resource_response, take_ulid, task_response};
use crate::context::{state, AppState};

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_VMS)
    .post(&API_METHOD_CREATE_VM)
    .match_all("id", &ITEM_ROUTER);

const ITEM_SUBDIRS: SubdirMap = &[
    ("disks", &DISKS_ROUTER),
    ("ips", &IPS_ROUTER),
    ("metrics", &METRICS_ROUTER),
    ("resize", &RESIZE_ROUTER),
    ("restart", &RESTART_ROUTER),
    ("serial-console", &CONSOLE_ROUTER),
    ("start", &START_ROUTER),
    ("status", &STATUS_ROUTER),
    ("stop", &STOP_ROUTER),
    ("terminate", &TERMINATE_ROUTER),
];

static ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_READ_VM)
    .delete(&API_METHOD_TERMINATE_VM)
    .subdirs(ITEM_SUBDIRS);

const DISK_SUBDIRS: SubdirMap = &[
    ("attach", &DISK_ATTACH_ROUTER),
    ("detach", &DISK_DETACH_ROUTER),
];
static DISKS_ROUTER: Router = Router::new().subdirs(DISK_SUBDIRS);
static DISK_ATTACH_ROUTER: Router = Router::new().post(&API_METHOD_ATTACH_DISK);
static DISK_DETACH_ROUTER: Router = Router::new().post(&API_METHOD_DETACH_DISK);

const IP_SUBDIRS: SubdirMap = &[
    ("attach", &IP_ATTACH_ROUTER),
    ("detach", &IP_DETACH_ROUTER),
];
static IPS_ROUTER: Router = Router::new().subdirs(IP_SUBDIRS);
static IP_ATTACH_ROUTER: Router = Router::new().post(&API_METHOD_ATTACH_IP);
static IP_DETACH_ROUTER: Router = Router::new().post(&API_METHOD_DETACH_IP);

static METRICS_ROUTER: Router = Router::new().get(&API_METHOD_VM_METRICS);
static RESIZE_ROUTER: Router = Router::new().post(&API_METHOD_RESIZE_VM);
static RESTART_ROUTER: Router = Router::new().post(&API_METHOD_RESTART_VM);
static CONSOLE_ROUTER: Router = Router::new().get(&API_METHOD_SERIAL_CONSOLE);
static START_ROUTER: Router = Router::new().post(&API_METHOD_START_VM);
static STATUS_ROUTER: Router = Router::new().get(&API_METHOD_VM_STATUS);
static STOP_ROUTER: Router = Router::new().post(&API_METHOD_STOP_VM);
static TERMINATE_ROUTER: Router = Router::new().post(&API_METHOD_TERMINATE_VM);

static API_METHOD_LIST_VMS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list_vms));
static API_METHOD_CREATE_VM: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&create_vm)).status(202);
static API_METHOD_READ_VM: ApiMethod = ApiMethod::new(&ApiHandler::Async(&read_vm));
static API_METHOD_START_VM: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&start_vm)).status(202);
static API_METHOD_STOP_VM: ApiMethod = ApiMethod::new(&ApiHandler::Async(&stop_vm)).status(202);
static API_METHOD_RESTART_VM: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&restart_vm)).status(202);
static API_METHOD_TERMINATE_VM: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&terminate_vm)).status(202);
static API_METHOD_RESIZE_VM: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&resize_vm)).status(202);
static API_METHOD_VM_STATUS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&vm_status));
static API_METHOD_VM_METRICS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&vm_metrics));
static API_METHOD_SERIAL_CONSOLE: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&serial_console));
static API_METHOD_ATTACH_DISK: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&attach_disk)).status(202);
static API_METHOD_DETACH_DISK: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&detach_disk)).status(202);
static API_METHOD_ATTACH_IP: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&attach_ip)).status(202);
static API_METHOD_DETACH_IP: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&detach_ip)).status(202);

/// Optimistic concurrency: a request may pin the generation it saw.
fn check_generation(vm: &VmRecord, param: &Value) -> Result<(), Error> {
    if let Some(expected) = param.get("generation").and_then(Value::as_u64) {
        if expected != vm.generation {
            return Err(api_err!(
                Conflict,
                "generation mismatch on vm '{}' (expected {expected}, found {})",
                vm.name,
                vm.generation
            ));
        }
    }
    Ok(())
}

fn status_url(id: Ulid) -> String {
    format!("/api/vms/{id}/status")
}

fn list_vms(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let vms: Vec<VmRecord> = state()
            .store
            .list_typed::<VmRecord>(keys::VM_PREFIX)?
            .into_iter()
            .map(|(vm, _)| vm)
            .filter(|vm| !vm.status.is_terminated())
            .collect();
        Ok(json!({ "data": vms, "total": vms.len() }))
    })
}

fn create_vm(param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let request: VmCreateRequest = parse_body(param)?;
        let vpc_name = request.validate()?;

        let (_vpc, _) = app.lookup_vpc(&vpc_name)?;
        let Some((image, _)) = app
            .store
            .get_typed::<Image>(&keys::image(&request.image_id))?
        else {
            return Err(api_err!(NotFound, "no such image '{}'", request.image_id));
        };

        let arch = request.arch.unwrap_or(image.arch);
        if arch != image.arch {
            return Err(api_err!(
                UnsupportedArch,
                "image '{}' is {} but the request wants {arch}",
                image.id,
                image.arch
            ));
        }

        // same client token: same VM, no side effects
        if let Some(token) = &request.client_token {
            for (vm, rev) in app.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
                if vm.client_token.as_deref() == Some(token) && !vm.status.is_terminated() {
                    let task_url = status_url(vm.id);
                    let mut value = resource_response("exists", &vm, rev)?;
                    value["status_url"] = json!(task_url);
                    return Ok(value);
                }
            }
        }

        if app.lookup_vm_by_name(&request.name).is_ok() {
            return Err(api_err!(Conflict, "vm '{}' already exists", request.name));
        }

        let vm = VmRecord {
            id: Ulid::generate(),
            name: request.name.clone(),
            host: None,
            image: image.id.clone(),
            arch,
            vcpus: request.cpu_cores,
            memory_mib: request.memory_mb,
            root_disk_gb: request.disk_size_gb,
            vpc: vpc_name,
            disks: Vec::new(),
            nics: Vec::new(),
            desired_power: if request.start.unwrap_or(true) {
                PowerState::On
            } else {
                PowerState::Off
            },
            observed_power: PowerState::Unknown,
            status: VmStatus::Creating,
            cloud_init: request.cloud_init.clone(),
            ssh_nat_port: None,
            vnc_port: None,
            serial_socket: None,
            floating_ip: None,
            anti_affinity: request.anti_affinity.clone(),
            client_token: request.client_token.clone(),
            generation: 1,
            created_at: epoch_i64(),
            last_error: None,
        };

        let revision = app.store.put(&keys::vm(vm.id), &vm, Expect::Absent)?;
        app.reconciler.kick_vm(vm.id);

        let mut value = resource_response("creating", &vm, revision)?;
        value["status_url"] = json!(status_url(vm.id));
        Ok(value)
    })
}

fn read_vm(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        let (vm, revision) = state().lookup_vm(id)?;
        let mut value = serde_json::to_value(&vm)?;
        value["revision"] = json!(revision);
        Ok(value)
    })
}

/// Shared body of the power verbs: mutate desired state, enqueue, 202.
fn power_transition(
    app: &AppState,
    id: Ulid,
    param: &Value,
    verb: &str,
) -> Result<Value, Error> {
    let (vm, _) = app.lookup_vm(id)?;
    check_generation(&vm, param)?;

    if vm.status.is_terminated() {
        return Err(api_err!(Conflict, "vm '{}' is terminated", vm.name));
    }
    if vm.status == VmStatus::Migrating && verb != "terminate" {
        return Err(api_err!(Conflict, "vm '{}' is migrating", vm.name));
    }

    let (updated, revision) = app.update_vm(id, |vm| {
        // an explicit verb on a parked VM clears the error and re-plans
        vm.last_error = None;
        match verb {
            "start" => {
                vm.desired_power = PowerState::On;
                vm.status = VmStatus::Starting;
            }
            "stop" => {
                vm.desired_power = PowerState::Off;
                vm.status = VmStatus::Stopping;
            }
            "restart" => {
                vm.desired_power = PowerState::On;
                vm.status = VmStatus::Stopping;
            }
            "terminate" => {
                vm.status = VmStatus::Terminating;
            }
            _ => unreachable!("unknown power verb"),
        }
        vm.generation += 1;
        Ok(())
    })?;
    app.reconciler.kick_vm(id);

    let mut value = resource_response(verb, &updated, revision)?;
    value["status_url"] = json!(status_url(id));
    Ok(value)
}

fn start_vm(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        power_transition(state(), id, &param, "start")
    })
}

fn stop_vm(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        power_transition(state(), id, &param, "stop")
    })
}

fn restart_vm(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let (vm, _) = app.lookup_vm(id)?;

        // a healthy running guest gets an ACPI reboot; anything else goes
        // through the full stop/start transition
        if vm.status == VmStatus::Running && vm.observed_power == PowerState::On {
            check_generation(&vm, &param)?;
            let Some(host_id) = vm.host.clone() else {
                return Err(api_err!(Conflict, "vm '{}' has no host", vm.name));
            };
            let vm_name = vm.name.clone();
            let task = WorkerTask::spawn(
                "reboot-vm",
                Some(format!("vm/{id}")),
                move |worker| async move {
                    let app = state();
                    let driver = app.driver(&host_id)?;
                    let (drv, name) = (&driver, vm_name.as_str());
                    crate::reconcile::step(&worker, "reboot_domain", || async move {
                        drv.reboot_domain(&VerbContext::default(), name).await
                    })
                    .await?;
                    app.update_vm(id, |vm| {
                        vm.generation += 1;
                        Ok(())
                    })?;
                    Ok(())
                },
            );
            let (vm, revision) = app.lookup_vm(id)?;
            return task_response("restarting", &vm, revision, task, status_url(id));
        }

        power_transition(app, id, &param, "restart")
    })
}

fn terminate_vm(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        power_transition(state(), id, &param, "terminate")
    })
}

fn resize_vm(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let (vm, _) = app.lookup_vm(id)?;
        check_generation(&vm, &param)?;
        param.as_object_mut().map(|m| m.remove("generation"));
        let request: VmResizeRequest = parse_body(param)?;
        request.validate()?;

        match vm.status {
            VmStatus::Running | VmStatus::Stopped | VmStatus::Error => (),
            other => {
                return Err(api_err!(Conflict, "vm '{}' is {other}", vm.name));
            }
        }

        let vcpus = request.cpu_cores.unwrap_or(vm.vcpus);
        let memory_mib = request.memory_mb.unwrap_or(vm.memory_mib);

        // capacity admission on the current host
        if let Some(host_id) = &vm.host {
            let (host, _) = app.lookup_host(host_id)?;
            let vms: Vec<VmRecord> = app
                .store
                .list_typed::<VmRecord>(keys::VM_PREFIX)?
                .into_iter()
                .map(|(vm, _)| vm)
                .collect();
            let mut used_vcpus = 0u64;
            let mut used_mem = 0u64;
            for other in vms.iter().filter(|v| {
                v.id != id && v.host.as_deref() == Some(host_id.as_str()) && v.is_active()
            }) {
                used_vcpus += u64::from(other.vcpus);
                used_mem += other.memory_mib;
            }
            let vcpu_limit = u64::from(host.capacity.vcpus) * 90 / 100;
            let mem_limit = host.capacity.memory_mib * 90 / 100;
            if used_vcpus + u64::from(vcpus) > vcpu_limit || used_mem + memory_mib > mem_limit {
                return Err(api_err!(
                    Exhausted,
                    "host '{host_id}' cannot fit the resized vm"
                ));
            }
        }

        let (updated, revision) = app.update_vm(id, |vm| {
            vm.vcpus = vcpus;
            vm.memory_mib = memory_mib;
            vm.status = VmStatus::Resizing;
            vm.last_error = None;
            vm.generation += 1;
            Ok(())
        })?;
        app.reconciler.kick_vm(id);

        let mut value = resource_response("resizing", &updated, revision)?;
        value["status_url"] = json!(status_url(id));
        Ok(value)
    })
}

fn vm_status(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let (vm, revision) = app.lookup_vm(id)?;

        let mut network_info = json!({});
        if let Some(nic) = vm.nics.first() {
            network_info["private"] = json!({ "ip": nic.ip, "mac": nic.mac });
        }
        if let Some(floating) = vm.floating_ip {
            network_info["public"] = json!({ "ip": floating });
        }

        let mut value = json!({
            "id": vm.id,
            "name": vm.name,
            "status": vm.status,
            "generation": vm.generation,
            "revision": revision,
            "desired_power": vm.desired_power,
            "observed_power": vm.observed_power,
            "host": vm.host,
            "image": vm.image,
            "arch": vm.arch,
            "cpu_cores": vm.vcpus,
            "memory_mb": vm.memory_mib,
            "disk_size_gb": vm.root_disk_gb,
            "vpc": vm.vpc,
            "network_info": network_info,
            "ssh_port": vm.ssh_nat_port,
            "vnc_port": vm.vnc_port,
            "created_at": vm.created_at,
        });
        if let Some(error) = &vm.last_error {
            value["last_error"] = serde_json::to_value(error)?;
        }
        if let Some(status) = app.cached_status(id) {
            value["driver"] = serde_json::to_value(&status)?;
        }
        Ok(value)
    })
}

fn vm_metrics(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let (vm, _) = app.lookup_vm(id)?;

        // prefer a live reading, fall back to the cache
        if let Some(host) = &vm.host {
            if let Ok(driver) = app.driver(host) {
                if let Ok(metrics) = driver
                    .domain_metrics(&VerbContext::default(), &vm.name)
                    .await
                {
                    app.record_metrics(id, metrics.clone());
                    return Ok(serde_json::to_value(&metrics)?);
                }
            }
        }
        match app.cached_metrics(id) {
            Some(metrics) => Ok(serde_json::to_value(&metrics)?),
            None => Err(api_err!(NotFound, "no metrics known for vm '{}'", vm.name)),
        }
    })
}

fn serial_console(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let (vm, _) = app.lookup_vm(id)?;

        if vm.serial_socket.is_none() {
            return Err(api_err!(
                Conflict,
                "vm '{}' has no serial console yet",
                vm.name
            ));
        }

        let token = app.tickets.mint(id, epoch_i64());
        Ok(json!({
            "url": format!("ws://{}/ws?ticket={token}", app.config.ws_listen),
            "expires_in": vdc_console::TICKET_LIFETIME_SECS,
        }))
    })
}

// ------ disk attachment ------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskRefRequest {
    disk_id: Ulid,
    #[serde(default)]
    generation: Option<u64>,
}

fn attach_disk(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let request: DiskRefRequest = parse_body(param)?;
        let (vm, _) = app.lookup_vm(id)?;
        if let Some(expected) = request.generation {
            if expected != vm.generation {
                return Err(api_err!(Conflict, "generation mismatch on vm '{}'", vm.name));
            }
        }

        match vm.status {
            VmStatus::Running | VmStatus::Stopped => (),
            other => return Err(api_err!(Conflict, "vm '{}' is {other}", vm.name)),
        }
        let Some(host_id) = vm.host.clone() else {
            return Err(api_err!(Conflict, "vm '{}' has no host", vm.name));
        };

        let disk_id = request.disk_id;
        let Some((disk, _)) = app.store.get_typed::<Disk>(&keys::disk(disk_id))? else {
            return Err(api_err!(NotFound, "no such disk '{disk_id}'"));
        };
        if disk.status != DiskStatus::Available {
            return Err(api_err!(Conflict, "disk '{}' is {}", disk.name, disk.status));
        }
        if let Some(disk_host) = &disk.host {
            if *disk_host != host_id {
                return Err(api_err!(
                    Conflict,
                    "disk '{}' lives on host '{disk_host}', vm is on '{host_id}'",
                    disk.name
                ));
            }
        }
        let Some(slot) = vm.free_disk_slot() else {
            return Err(api_err!(Exhausted, "vm '{}' has no free disk slot", vm.name));
        };

        let vm_name = vm.name.clone();
        let size_gb = disk.size_gb;
        let task = WorkerTask::spawn(
            "attach-disk",
            Some(format!("vm/{id}")),
            move |worker| async move {
                let app = state();
                let driver = app.driver(&host_id)?;
                let drv = &driver;
                let ctx = VerbContext::default();
                let ctx = &ctx;

                // make sure the backing file exists on the vm's host
                let path = crate::reconcile::step(&worker, "create_volume", || async move {
                    drv.create_volume(ctx, disk_id, size_gb).await
                })
                .await?;

                let device = VmDiskRef::device_name(slot);
                let (vm_name_ref, path_ref, device_ref) =
                    (vm_name.as_str(), path.as_str(), device.as_str());
                crate::reconcile::step(&worker, "attach_volume", || async move {
                    drv.attach_volume(ctx, vm_name_ref, path_ref, device_ref).await
                })
                .await?;

                // single batch: disk goes in-use, the vm records the slot
                loop {
                    let (mut disk, disk_rev) = app
                        .store
                        .get_typed::<Disk>(&keys::disk(disk_id))?
                        .ok_or_else(|| api_err!(NotFound, "disk vanished during attach"))?;
                    let (mut vm, vm_rev) = app.lookup_vm(id)?;

                    disk.status = DiskStatus::InUse;
                    disk.attachment = Some(vdc_api_types::DiskAttachment { vm: id, slot });
                    disk.host = Some(host_id.clone());
                    disk.path = Some(path.clone());
                    if !vm.disks.iter().any(|d| d.disk == disk_id) {
                        vm.disks.push(VmDiskRef {
                            disk: disk_id,
                            slot,
                        });
                    }
                    vm.generation += 1;

                    match app.store.batch(vec![
                        vdc_store::TxOp::put(keys::disk(disk_id), Expect::Rev(disk_rev), &disk)?,
                        vdc_store::TxOp::put(keys::vm(id), Expect::Rev(vm_rev), &vm)?,
                    ]) {
                        Ok(_) => return Ok(()),
                        Err(err) if error_code(&err) == ErrorCode::Conflict => continue,
                        Err(err) => return Err(err),
                    }
                }
            },
        );

        task_response(
            "attaching",
            &disk,
            app.store.revision(),
            task,
            status_url(id),
        )
    })
}

fn detach_disk(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let request: DiskRefRequest = parse_body(param)?;
        let (vm, _) = app.lookup_vm(id)?;

        let disk_id = request.disk_id;
        let Some(disk_ref) = vm.disks.iter().find(|d| d.disk == disk_id).copied() else {
            return Err(api_err!(
                NotFound,
                "disk '{disk_id}' is not attached to vm '{}'",
                vm.name
            ));
        };
        let Some((disk, _)) = app.store.get_typed::<Disk>(&keys::disk(disk_id))? else {
            return Err(api_err!(NotFound, "no such disk '{disk_id}'"));
        };
        let Some(host_id) = vm.host.clone() else {
            return Err(api_err!(Conflict, "vm '{}' has no host", vm.name));
        };

        let vm_name = vm.name.clone();
        let path = disk.path.clone();
        let task = WorkerTask::spawn(
            "detach-disk",
            Some(format!("vm/{id}")),
            move |worker| async move {
                let app = state();
                let driver = app.driver(&host_id)?;
                let drv = &driver;
                let ctx = VerbContext::default();
                let ctx = &ctx;

                if let Some(path) = &path {
                    let device = VmDiskRef::device_name(disk_ref.slot);
                    let (vm_name_ref, path_ref, device_ref) =
                        (vm_name.as_str(), path.as_str(), device.as_str());
                    crate::reconcile::step(&worker, "detach_volume", || async move {
                        drv.detach_volume(ctx, vm_name_ref, path_ref, device_ref).await
                    })
                    .await?;
                }

                loop {
                    let (mut disk, disk_rev) = match app
                        .store
                        .get_typed::<Disk>(&keys::disk(disk_id))?
                    {
                        Some(found) => found,
                        None => return Ok(()),
                    };
                    let (mut vm, vm_rev) = app.lookup_vm(id)?;

                    disk.status = DiskStatus::Available;
                    disk.attachment = None;
                    vm.disks.retain(|d| d.disk != disk_id);
                    vm.generation += 1;

                    match app.store.batch(vec![
                        vdc_store::TxOp::put(keys::disk(disk_id), Expect::Rev(disk_rev), &disk)?,
                        vdc_store::TxOp::put(keys::vm(id), Expect::Rev(vm_rev), &vm)?,
                    ]) {
                        Ok(_) => return Ok(()),
                        Err(err) if error_code(&err) == ErrorCode::Conflict => continue,
                        Err(err) => return Err(err),
                    }
                }
            },
        );

        task_response(
            "detaching",
            &disk,
            app.store.revision(),
            task,
            status_url(id),
        )
    })
}

// ------ floating ip attachment ------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IpRefRequest {
    #[serde(default)]
    address: Option<std::net::Ipv4Addr>,
}

fn attach_ip(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let request: IpRefRequest = parse_body(param)?;
        let (vm, _) = app.lookup_vm(id)?;

        if vm.floating_ip.is_some() {
            return Err(api_err!(
                Conflict,
                "vm '{}' already has a floating ip",
                vm.name
            ));
        }
        if vm.nics.is_empty() || vm.host.is_none() {
            return Err(api_err!(Conflict, "vm '{}' is not provisioned yet", vm.name));
        }

        let task = super::ips::spawn_attach(app, id, request.address)?;
        task_response(
            "attaching",
            &json!({ "vm": id }),
            app.store.revision(),
            task,
            status_url(id),
        )
    })
}

fn detach_ip(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let _request: IpRefRequest = parse_body(param)?;
        let (vm, _) = app.lookup_vm(id)?;

        let Some(floating) = vm.floating_ip else {
            return Err(api_err!(Conflict, "vm '{}' has no floating ip", vm.name));
        };

        let task = super::ips::spawn_detach(app, id, floating)?;
        task_response(
            "detaching",
            &json!({ "vm": id, "address": floating }),
            app.store.revision(),
            task,
            status_url(id),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vdc_api_types::Arch;

    fn seed_image(id: &str) {
        let app = crate::context::test_state();
        let image = Image {
            id: id.to_string(),
            name: id.to_string(),
            arch: Arch::X86_64,
            sha256: "0".repeat(64),
            paths: Default::default(),
        };
        let _ = app.store.put(&keys::image(id), &image, Expect::Any);
    }

    async fn seed_vpc(name: &str, cidr: &str) {
        let app = crate::context::test_state();
        let cidr: vdc_api_types::Ipv4Cidr = cidr.parse().unwrap();
        let vpc = vdc_api_types::Vpc {
            name: name.to_string(),
            cidr,
            subnets: Vec::new(),
            gateway: cidr.gateway(),
            mtu: 1500,
            chain: vdc_firewall::digest(name)[..8].to_string(),
            created_at: 0,
        };
        let _ = app.store.put(&keys::vpc(name), &vpc, Expect::Any);
    }

    #[tokio::test]
    async fn create_vm_validates_and_enqueues() {
        crate::context::test_state();
        seed_vpc("t-vms-v1", "10.70.0.0/24").await;
        seed_image("t-vms-img");

        // unknown vpc
        let err = create_vm(json!({
            "name": "t-vms-a", "vpc": "missing", "image_id": "t-vms-img",
        }))
        .await
        .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::NotFound);

        // unknown image
        let err = create_vm(json!({
            "name": "t-vms-a", "vpc": "t-vms-v1", "image_id": "missing",
        }))
        .await
        .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::NotFound);

        // arch mismatch against the image
        let err = create_vm(json!({
            "name": "t-vms-a", "vpc": "t-vms-v1", "image_id": "t-vms-img",
            "arch": "aarch64",
        }))
        .await
        .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::UnsupportedArch);

        let created = create_vm(json!({
            "name": "t-vms-a", "vpc": "t-vms-v1", "image_id": "t-vms-img",
            "cpu_cores": 1, "memory_mb": 1024, "disk_size_gb": 10,
        }))
        .await
        .unwrap();
        assert_eq!(created["status"], "creating");
        assert_eq!(created["resource"]["status"], "creating");
        assert_eq!(created["resource"]["generation"], 1);
        assert!(created["status_url"].as_str().unwrap().ends_with("/status"));

        // duplicate name
        let err = create_vm(json!({
            "name": "t-vms-a", "vpc": "t-vms-v1", "image_id": "t-vms-img",
        }))
        .await
        .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn create_vm_client_token_is_idempotent() {
        crate::context::test_state();
        seed_vpc("t-vms-v2", "10.71.0.0/24").await;
        seed_image("t-vms-img2");

        let request = json!({
            "name": "t-vms-tok", "vpc": "t-vms-v2", "image_id": "t-vms-img2",
            "client_token": "tok-123",
        });
        let first = create_vm(request.clone()).await.unwrap();
        let second = create_vm(request).await.unwrap();

        assert_eq!(second["status"], "exists");
        assert_eq!(first["resource"]["id"], second["resource"]["id"]);
    }

    #[tokio::test]
    async fn power_verbs_check_generation_and_state() {
        let app = crate::context::test_state();
        seed_vpc("t-vms-v3", "10.72.0.0/24").await;
        seed_image("t-vms-img3");

        let created = create_vm(json!({
            "name": "t-vms-pw", "vpc": "t-vms-v3", "image_id": "t-vms-img3",
        }))
        .await
        .unwrap();
        let id: Ulid = created["resource"]["id"].as_str().unwrap().parse().unwrap();

        // stale generation
        let err = start_vm(json!({ "id": id.to_string(), "generation": 99 }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);

        // correct generation wins and bumps
        let response = stop_vm(json!({ "id": id.to_string(), "generation": 1 }))
            .await
            .unwrap();
        assert_eq!(response["status"], "stop");
        assert_eq!(response["resource"]["status"], "stopping");
        assert_eq!(response["resource"]["generation"], 2);

        // verbs on a terminated vm are refused
        app.update_vm(id, |vm| {
            vm.status = VmStatus::Terminated;
            Ok(())
        })
        .unwrap();
        let err = start_vm(json!({ "id": id.to_string() })).await.unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn status_reports_network_info() {
        let app = crate::context::test_state();
        seed_vpc("t-vms-v4", "10.73.0.0/24").await;
        seed_image("t-vms-img4");

        let created = create_vm(json!({
            "name": "t-vms-st", "vpc": "t-vms-v4", "image_id": "t-vms-img4",
        }))
        .await
        .unwrap();
        let id: Ulid = created["resource"]["id"].as_str().unwrap().parse().unwrap();

        app.update_vm(id, |vm| {
            vm.nics = vec![vdc_api_types::Nic {
                mac: "52:54:00:00:00:01".to_string(),
                ip: "10.73.0.2".parse().unwrap(),
                subnet: None,
            }];
            vm.status = VmStatus::Running;
            Ok(())
        })
        .unwrap();

        let status = vm_status(json!({ "id": id.to_string() })).await.unwrap();
        assert_eq!(status["status"], "running");
        assert_eq!(status["network_info"]["private"]["ip"], "10.73.0.2");
    }
}
