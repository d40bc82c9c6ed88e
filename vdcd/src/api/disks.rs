//! `/api/disks`: standalone block volumes.

use anyhow::Error;
use serde::Deserialize;
use serde_json::{json, Value};

use vdc_api_types::{
    api_err, keys, time::epoch_i64, Disk, DiskCreateRequest, DiskStatus, Ulid, VmRecord,
    VmStatus,
};
use vdc_driver::VerbContext;
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router, SubdirMap, WorkerTask};
use vdc_store::Expect;

use super::{parse_body, resource_response, take_ulid, task_response};
use crate::context::state;

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_DISKS)
    .post(&API_METHOD_CREATE_DISK)
    .match_all("id", &ITEM_ROUTER);

const ITEM_SUBDIRS: SubdirMap = &[("resize", &RESIZE_ROUTER)];

static ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_READ_DISK)
    .delete(&API_METHOD_DELETE_DISK)
    .subdirs(ITEM_SUBDIRS);

static RESIZE_ROUTER: Router = Router::new().post(&API_METHOD_RESIZE_DISK);

static API_METHOD_LIST_DISKS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list_disks));
static API_METHOD_CREATE_DISK: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&create_disk)).status(201);
static API_METHOD_READ_DISK: ApiMethod = ApiMethod::new(&ApiHandler::Async(&read_disk));
static API_METHOD_DELETE_DISK: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&delete_disk)).status(202);
static API_METHOD_RESIZE_DISK: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&resize_disk)).status(202);

fn list_disks(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let disks: Vec<Disk> = state()
            .store
            .list_typed::<Disk>(keys::DISK_PREFIX)?
            .into_iter()
            .map(|(disk, _)| disk)
            .collect();
        Ok(json!({ "data": disks, "total": disks.len() }))
    })
}

fn create_disk(param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let request: DiskCreateRequest = parse_body(param)?;
        request.validate()?;

        // the backing file is created lazily on the host of the first
        // attach; until then the disk is pure metadata
        let disk = Disk {
            id: Ulid::generate(),
            name: request.name,
            size_gb: request.size_gb,
            path: None,
            host: None,
            status: DiskStatus::Available,
            attachment: None,
            orphaned: false,
            created_at: epoch_i64(),
        };

        let revision = app.store.put(&keys::disk(disk.id), &disk, Expect::Absent)?;
        resource_response("created", &disk, revision)
    })
}

fn read_disk(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        let Some((disk, revision)) = state().store.get_typed::<Disk>(&keys::disk(id))? else {
            return Err(api_err!(NotFound, "no such disk '{id}'"));
        };
        let mut value = serde_json::to_value(&disk)?;
        value["revision"] = json!(revision);
        Ok(value)
    })
}

fn delete_disk(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let Some((disk, _)) = app.store.get_typed::<Disk>(&keys::disk(id))? else {
            return Err(api_err!(NotFound, "no such disk '{id}'"));
        };
        if disk.status != DiskStatus::Available {
            return Err(api_err!(
                Conflict,
                "disk '{}' is {}, only available disks can be deleted",
                disk.name,
                disk.status
            ));
        }

        let task = WorkerTask::spawn(
            "delete-disk",
            Some(format!("disk/{id}")),
            move |worker| async move {
                let app = state();
                let Some((mut disk, rev)) = app.store.get_typed::<Disk>(&keys::disk(id))? else {
                    return Ok(());
                };

                if let (Some(host), Some(path)) = (disk.host.clone(), disk.path.clone()) {
                    let driver = app.driver(&host)?;
                    let (drv, path_ref) = (&driver, path.as_str());
                    let removed = crate::reconcile::step(&worker, "delete_volume", || async move {
                        drv.delete_volume(&VerbContext::default(), path_ref).await
                    })
                    .await;
                    if let Err(err) = removed {
                        // cannot prove the file gone: keep the row, let the
                        // sweeper retry
                        disk.orphaned = true;
                        app.store.put(&keys::disk(id), &disk, Expect::Rev(rev))?;
                        return Err(err);
                    }
                }

                app.store.delete(&keys::disk(id), Expect::Rev(rev))?;
                Ok(())
            },
        );

        task_response(
            "deleting",
            &disk,
            app.store.revision(),
            task,
            format!("/api/tasks/{task}"),
        )
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskResizeRequest {
    size_gb: u64,
}

fn resize_disk(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let id = take_ulid(&mut param, "id")?;
        let request: DiskResizeRequest = parse_body(param)?;
        let Some((disk, _)) = app.store.get_typed::<Disk>(&keys::disk(id))? else {
            return Err(api_err!(NotFound, "no such disk '{id}'"));
        };

        if request.size_gb <= disk.size_gb {
            return Err(api_err!(
                Validation,
                "disks can only grow ({} -> {} GiB requested)",
                disk.size_gb,
                request.size_gb
            ));
        }
        match disk.status {
            DiskStatus::Available => (),
            DiskStatus::InUse => {
                // resize is offline only: the owning VM must be stopped
                let attachment = disk.attachment.as_ref().expect("in-use disk is attached");
                let (vm, _): (VmRecord, u64) = app.lookup_vm(attachment.vm)?;
                if vm.status != VmStatus::Stopped {
                    return Err(api_err!(
                        Conflict,
                        "disk '{}' is attached to vm '{}' which is {}",
                        disk.name,
                        vm.name,
                        vm.status
                    ));
                }
            }
            other => {
                return Err(api_err!(Conflict, "disk '{}' is {other}", disk.name));
            }
        }

        let new_size = request.size_gb;
        let task = WorkerTask::spawn(
            "resize-disk",
            Some(format!("disk/{id}")),
            move |worker| async move {
                let app = state();
                let Some((mut disk, rev)) = app.store.get_typed::<Disk>(&keys::disk(id))? else {
                    return Ok(());
                };
                let previous_status = disk.status;
                disk.status = DiskStatus::Resizing;
                app.store.put(&keys::disk(id), &disk, Expect::Rev(rev))?;

                let grown: Result<(), Error> =
                    if let (Some(host), Some(path)) = (disk.host.clone(), disk.path.clone()) {
                        match app.driver(&host) {
                            Ok(driver) => {
                                let (drv, path_ref) = (&driver, path.as_str());
                                crate::reconcile::step(&worker, "resize_volume", || async move {
                                    drv.resize_volume(&VerbContext::default(), path_ref, new_size)
                                        .await
                                })
                                .await
                            }
                            Err(err) => Err(err),
                        }
                    } else {
                        Ok(())
                    };

                // whatever happened, the disk must leave `resizing` again;
                // only a successful grow updates the recorded size
                loop {
                    let Some((mut disk, rev)) = app.store.get_typed::<Disk>(&keys::disk(id))?
                    else {
                        return grown;
                    };
                    if grown.is_ok() {
                        disk.size_gb = new_size;
                    }
                    disk.status = previous_status;
                    match app.store.put(&keys::disk(id), &disk, Expect::Rev(rev)) {
                        Ok(_) => return grown,
                        Err(err)
                            if vdc_api_types::error_code(&err)
                                == vdc_api_types::ErrorCode::Conflict =>
                        {
                            continue
                        }
                        Err(err) => return Err(err),
                    }
                }
            },
        );

        task_response(
            "resizing",
            &disk,
            app.store.revision(),
            task,
            format!("/api/tasks/{task}"),
        )
    })
}
