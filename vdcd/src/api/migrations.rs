//! `/api/migrations`: live migration lifecycle.

use serde_json::{json, Value};

use vdc_api_types::{
    api_err, error_code, keys, time::epoch_i64, ErrorCode, HostHealth, Migration,
    MigrationCreateRequest, MigrationPhase, Ulid, VmStatus,
};
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router, SubdirMap};
use vdc_store::{Expect, TxOp};

use super::{parse_body, resource_response, take_param, task_response};
use crate::context::state;

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_MIGRATIONS)
    .post(&API_METHOD_CREATE_MIGRATION)
    .match_all("vm", &ITEM_ROUTER);

const ITEM_SUBDIRS: SubdirMap = &[("status", &STATUS_ROUTER)];

static ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_READ_MIGRATION)
    .delete(&API_METHOD_ABORT_MIGRATION)
    .subdirs(ITEM_SUBDIRS);

static STATUS_ROUTER: Router = Router::new().get(&API_METHOD_READ_MIGRATION);

static API_METHOD_LIST_MIGRATIONS: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&list_migrations));
static API_METHOD_CREATE_MIGRATION: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&create_migration)).status(202);
static API_METHOD_READ_MIGRATION: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&read_migration));
static API_METHOD_ABORT_MIGRATION: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&abort_migration)).status(202);

fn list_migrations(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let migrations: Vec<Migration> = state()
            .store
            .list_typed::<Migration>(keys::MIGRATION_PREFIX)?
            .into_iter()
            .map(|(migration, _)| migration)
            .collect();
        Ok(json!({ "data": migrations, "total": migrations.len() }))
    })
}

fn create_migration(param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let request: MigrationCreateRequest = parse_body(param)?;
        request.validate()?;

        let (vm, vm_rev) = app.lookup_vm_by_name(&request.vm_name)?;
        if vm.status != VmStatus::Running {
            return Err(api_err!(
                Conflict,
                "vm '{}' is {}, only running vms can be live-migrated",
                vm.name,
                vm.status
            ));
        }
        let Some(source) = vm.host.clone() else {
            return Err(api_err!(Conflict, "vm '{}' has no owner host", vm.name));
        };
        if source == request.destination {
            return Err(api_err!(
                Validation,
                "vm '{}' is already on host '{source}'",
                vm.name
            ));
        }
        let (dest, _) = app.lookup_host(&request.destination)?;
        if dest.health != HostHealth::Ready {
            return Err(api_err!(
                Conflict,
                "destination host '{}' is {}",
                dest.id,
                dest.health
            ));
        }
        if dest.arch != vm.arch {
            return Err(api_err!(
                UnsupportedArch,
                "destination host '{}' is {}, vm is {}",
                dest.id,
                dest.arch,
                vm.arch
            ));
        }

        // one migration per VM: the row is keyed by VM id
        let key = keys::migration(vm.id);
        let expect = match app.store.get_typed::<Migration>(&key)? {
            Some((previous, rev)) => {
                if !previous.is_finished() {
                    return Err(api_err!(
                        Conflict,
                        "vm '{}' is already migrating to '{}'",
                        vm.name,
                        previous.destination
                    ));
                }
                Expect::Rev(rev)
            }
            None => Expect::Absent,
        };

        let migration = Migration {
            id: Ulid::generate(),
            vm: vm.id,
            source,
            destination: request.destination.clone(),
            phase: MigrationPhase::Prepare,
            bandwidth_bps: request.bandwidth_bps,
            max_downtime_ms: request.max_downtime_ms,
            compressed: request.compressed,
            progress: 0.0,
            abort_requested: false,
            started_at: epoch_i64(),
            finished_at: None,
            error: None,
        };

        let mut updated_vm = vm.clone();
        updated_vm.status = VmStatus::Migrating;
        updated_vm.generation += 1;

        let revision = app
            .store
            .batch(vec![
                TxOp::put(key, expect, &migration)?,
                TxOp::put(keys::vm(vm.id), Expect::Rev(vm_rev), &updated_vm)?,
            ])
            .map_err(|err| {
                if error_code(&err) == ErrorCode::Conflict {
                    api_err!(Conflict, "vm '{}' changed, retry the migration", vm.name)
                } else {
                    err
                }
            })?;

        let task = crate::migrate::spawn_coordinator(app, vm.id);

        task_response(
            "migrating",
            &migration,
            revision,
            task,
            format!("/api/migrations/{}/status", vm.name),
        )
    })
}

/// Accepts the VM name or id in the path.
fn resolve_vm(raw: &str) -> Result<Ulid, anyhow::Error> {
    if let Ok(id) = raw.parse::<Ulid>() {
        return Ok(id);
    }
    let (vm, _) = state().lookup_vm_by_name(raw)?;
    Ok(vm.id)
}

fn read_migration(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let raw = take_param(&mut param, "vm")?;
        let vm_id = resolve_vm(&raw)?;
        let Some((migration, revision)) = state()
            .store
            .get_typed::<Migration>(&keys::migration(vm_id))?
        else {
            return Err(api_err!(NotFound, "no migration for vm '{raw}'"));
        };
        let mut value = serde_json::to_value(&migration)?;
        value["revision"] = json!(revision);
        Ok(value)
    })
}

fn abort_migration(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let raw = take_param(&mut param, "vm")?;
        let vm_id = resolve_vm(&raw)?;

        let Some((mut migration, rev)) = app
            .store
            .get_typed::<Migration>(&keys::migration(vm_id))?
        else {
            return Err(api_err!(NotFound, "no migration for vm '{raw}'"));
        };
        if migration.is_finished() {
            return Err(api_err!(
                Conflict,
                "migration for vm '{raw}' already finished"
            ));
        }

        // the coordinator polls this flag, so the abort also works after a
        // daemon restart
        migration.abort_requested = true;
        let revision = app
            .store
            .put(&keys::migration(vm_id), &migration, Expect::Rev(rev))?;

        resource_response("aborting", &migration, revision)
    })
}
