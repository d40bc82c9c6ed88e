//! `/api/ips`: the floating IP pool, plus the attach/detach workers used
//! by the VM endpoints.

use anyhow::Error;
use serde::Deserialize;
use serde_json::{json, Value};

use vdc_api_types::{
    api_err, error_code, keys, time::epoch_i64, AllocScope, ErrorCode, FloatingIp,
    FloatingIpStatus, Ulid,
};
use vdc_driver::VerbContext;
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router, WorkerTask};
use vdc_store::{Expect, TxOp};

use super::{parse_body, resource_response, take_param};
use crate::context::{state, AppState};

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_IPS)
    .post(&API_METHOD_REGISTER_IP)
    .match_all("addr", &ITEM_ROUTER);

static ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_READ_IP)
    .delete(&API_METHOD_REMOVE_IP);

static API_METHOD_LIST_IPS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list_ips));
static API_METHOD_REGISTER_IP: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&register_ip)).status(201);
static API_METHOD_READ_IP: ApiMethod = ApiMethod::new(&ApiHandler::Async(&read_ip));
static API_METHOD_REMOVE_IP: ApiMethod = ApiMethod::new(&ApiHandler::Async(&remove_ip));

fn list_ips(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let fips: Vec<FloatingIp> = state()
            .store
            .list_typed::<FloatingIp>(keys::FIP_PREFIX)?
            .into_iter()
            .map(|(fip, _)| fip)
            .collect();
        Ok(json!({ "data": fips, "total": fips.len() }))
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterIpRequest {
    address: std::net::Ipv4Addr,
}

fn register_ip(param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let request: RegisterIpRequest = parse_body(param)?;
        let address = request.address;

        if !app
            .config
            .public_ip_pool
            .iter()
            .any(|cidr| cidr.contains_address(&address))
        {
            return Err(api_err!(
                Validation,
                "address {address} is outside the configured public pool"
            ));
        }

        let fip = FloatingIp {
            address,
            status: FloatingIpStatus::Available,
            vm: None,
            last_rebind_time: None,
            created_at: epoch_i64(),
        };
        let revision = app
            .store
            .put(&keys::floating_ip(address), &fip, Expect::Absent)
            .map_err(|err| {
                if error_code(&err) == ErrorCode::Conflict {
                    api_err!(Conflict, "address {address} is already registered")
                } else {
                    err
                }
            })?;

        resource_response("created", &fip, revision)
    })
}

fn parse_addr(raw: &str) -> Result<std::net::Ipv4Addr, Error> {
    raw.parse()
        .map_err(|_| api_err!(Validation, "'{raw}' is not an IPv4 address"))
}

fn read_ip(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let address = parse_addr(&take_param(&mut param, "addr")?)?;
        let Some((fip, revision)) = state()
            .store
            .get_typed::<FloatingIp>(&keys::floating_ip(address))?
        else {
            return Err(api_err!(NotFound, "no such floating ip {address}"));
        };
        let mut value = serde_json::to_value(&fip)?;
        value["revision"] = json!(revision);
        Ok(value)
    })
}

fn remove_ip(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let app = state();
        let address = parse_addr(&take_param(&mut param, "addr")?)?;
        let Some((fip, rev)) = app
            .store
            .get_typed::<FloatingIp>(&keys::floating_ip(address))?
        else {
            return Err(api_err!(NotFound, "no such floating ip {address}"));
        };
        if fip.status == FloatingIpStatus::Bound {
            return Err(api_err!(Conflict, "floating ip {address} is bound to a vm"));
        }
        let revision = app.store.delete(&keys::floating_ip(address), Expect::Rev(rev))?;
        resource_response("deleted", &fip, revision)
    })
}

// ------ attach/detach workers ------

fn pick_available(app: &AppState) -> Result<FloatingIp, Error> {
    app.store
        .list_typed::<FloatingIp>(keys::FIP_PREFIX)?
        .into_iter()
        .map(|(fip, _)| fip)
        .find(|fip| fip.status == FloatingIpStatus::Available)
        .ok_or_else(|| api_err!(Exhausted, "no available floating ip in the pool"))
}

pub(crate) fn spawn_attach(
    app: &'static AppState,
    vm_id: Ulid,
    address: Option<std::net::Ipv4Addr>,
) -> Result<Ulid, Error> {
    // resolve the address up front so validation errors surface on the
    // request, not in the task log
    let fip = match address {
        Some(address) => {
            let Some((fip, _)) = app
                .store
                .get_typed::<FloatingIp>(&keys::floating_ip(address))?
            else {
                return Err(api_err!(NotFound, "no such floating ip {address}"));
            };
            if fip.status == FloatingIpStatus::Bound && fip.vm != Some(vm_id) {
                return Err(api_err!(Conflict, "floating ip {address} is already bound"));
            }
            fip
        }
        None => pick_available(app)?,
    };
    let address = fip.address;

    Ok(WorkerTask::spawn(
        "attach-ip",
        Some(format!("vm/{vm_id}")),
        move |worker| async move {
            let now = epoch_i64();
            let (vm, vm_rev) = app.lookup_vm(vm_id)?;
            let Some(nic) = vm.nics.first().cloned() else {
                anyhow::bail!("vm has no private address");
            };
            let host_id = vm
                .host
                .clone()
                .ok_or_else(|| api_err!(Conflict, "vm has no host"))?;

            // bind pool row + allocation + vm in one batch
            let (mut fip, fip_rev) = app
                .store
                .get_typed::<FloatingIp>(&keys::floating_ip(address))?
                .ok_or_else(|| api_err!(NotFound, "floating ip vanished"))?;
            if fip.status == FloatingIpStatus::Bound && fip.vm != Some(vm_id) {
                anyhow::bail!("floating ip {address} was bound concurrently");
            }
            fip.status = FloatingIpStatus::Bound;
            fip.vm = Some(vm_id);
            fip.last_rebind_time = Some(now);

            let mut updated_vm = vm.clone();
            updated_vm.floating_ip = Some(address);
            updated_vm.generation += 1;

            let mut ops = vec![
                TxOp::put(keys::floating_ip(address), Expect::Rev(fip_rev), &fip)?,
                TxOp::put(keys::vm(vm_id), Expect::Rev(vm_rev), &updated_vm)?,
            ];
            // an allocation row may already exist when this is a retry
            let alloc_key = keys::alloc(&AllocScope::Public, address);
            let already_ours = matches!(
                app.store.get_typed::<vdc_api_types::IpAllocation>(&alloc_key)?,
                Some((alloc, _))
                    if alloc.status != vdc_api_types::AllocStatus::Released
                        && alloc.owner == Some(vm_id)
            );
            if !already_ours {
                let pool = [vdc_api_types::Ipv4Cidr::from(address)];
                let reservation =
                    vdc_ipam::reserve_public(&app.store, &pool, Some(vm_id), Some(address), now)?;
                ops.push(reservation.op);
            }
            app.store.batch(ops)?;

            let bind = vdc_ipam::bind(&app.store, &AllocScope::Public, address, vm_id, now)?;
            app.store.batch(vec![bind])?;

            // the DNAT/SNAT pair on the owner host
            let driver = app.driver(&host_id)?;
            let (drv, ip) = (&driver, nic.ip);
            crate::reconcile::step(&worker, "floating_nat", || async move {
                drv.ensure_floating_nat(&VerbContext::default(), address, ip)
                    .await
            })
            .await?;
            Ok(())
        },
    ))
}

pub(crate) fn spawn_detach(
    app: &'static AppState,
    vm_id: Ulid,
    address: std::net::Ipv4Addr,
) -> Result<Ulid, Error> {
    Ok(WorkerTask::spawn(
        "detach-ip",
        Some(format!("vm/{vm_id}")),
        move |worker| async move {
            let now = epoch_i64();
            let (vm, _) = app.lookup_vm(vm_id)?;

            if let (Some(host_id), Some(nic)) = (vm.host.clone(), vm.nics.first()) {
                let driver = app.driver(&host_id)?;
                let (drv, ip) = (&driver, nic.ip);
                crate::reconcile::step(&worker, "floating_nat", || async move {
                    drv.drop_floating_nat(&VerbContext::default(), address, ip)
                        .await
                })
                .await?;
            }

            unbind_floating(app, address, vm_id, now)?;
            app.update_vm(vm_id, |vm| {
                vm.floating_ip = None;
                vm.generation += 1;
                Ok(())
            })?;
            Ok(())
        },
    ))
}

/// Return a floating IP to the pool and release its allocation. Idempotent;
/// also used by VM termination.
pub(crate) fn unbind_floating(
    app: &AppState,
    address: std::net::Ipv4Addr,
    vm_id: Ulid,
    now: i64,
) -> Result<(), Error> {
    if let Some((mut fip, rev)) = app
        .store
        .get_typed::<FloatingIp>(&keys::floating_ip(address))?
    {
        if fip.vm == Some(vm_id) {
            fip.status = FloatingIpStatus::Available;
            fip.vm = None;
            fip.last_rebind_time = Some(now);
            app.store
                .put(&keys::floating_ip(address), &fip, Expect::Rev(rev))?;
        }
    }

    if let Some(op) = vdc_ipam::release(&app.store, &AllocScope::Public, address, Some(vm_id), now)?
    {
        app.store.batch(vec![op])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdc_api_types::ErrorCode;

    #[tokio::test]
    async fn pool_registration_lifecycle() {
        crate::context::test_state();

        // outside the configured pool
        let err = register_ip(json!({ "address": "198.51.100.1" }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Validation);

        let created = register_ip(json!({ "address": "203.0.113.9" }))
            .await
            .unwrap();
        assert_eq!(created["status"], "created");
        assert_eq!(created["resource"]["status"], "available");

        let err = register_ip(json!({ "address": "203.0.113.9" }))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);

        let read = read_ip(json!({ "addr": "203.0.113.9" })).await.unwrap();
        assert_eq!(read["address"], "203.0.113.9");

        let removed = remove_ip(json!({ "addr": "203.0.113.9" })).await.unwrap();
        assert_eq!(removed["status"], "deleted");
        let err = read_ip(json!({ "addr": "203.0.113.9" })).await.unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn bound_addresses_cannot_be_removed() {
        let app = crate::context::test_state();

        register_ip(json!({ "address": "203.0.113.10" })).await.unwrap();
        let (mut fip, rev) = app
            .store
            .get_typed::<FloatingIp>(&keys::floating_ip("203.0.113.10".parse().unwrap()))
            .unwrap()
            .unwrap();
        fip.status = FloatingIpStatus::Bound;
        fip.vm = Some(Ulid::generate());
        app.store
            .put(
                &keys::floating_ip(fip.address),
                &fip,
                Expect::Rev(rev),
            )
            .unwrap();

        let err = remove_ip(json!({ "addr": "203.0.113.10" })).await.unwrap_err();
        assert_eq!(error_code(&err), ErrorCode::Conflict);
    }
}
