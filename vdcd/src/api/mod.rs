//! The HTTP API tree, mounted under `/api`.

use anyhow::Error;
use serde_json::{json, Value};

use vdc_api_types::{api_err, keys, Host, HostHealth, Ulid};
use vdc_rest_server::{ApiFuture, ApiHandler, ApiMethod, Router, SubdirMap};

use crate::context::state;

pub mod disks;
pub mod images;
pub mod ips;
pub mod migrations;
pub mod tasks;
pub mod vms;
pub mod vpcs;

const SUBDIRS: SubdirMap = &[
    ("disks", &disks::ROUTER),
    ("health", &HEALTH_ROUTER),
    ("images", &images::ROUTER),
    ("ips", &ips::ROUTER),
    ("migrations", &migrations::ROUTER),
    ("tasks", &tasks::ROUTER),
    ("vms", &vms::ROUTER),
    ("vpcs", &vpcs::ROUTER),
];

static API_ROUTER: Router = Router::new().subdirs(SUBDIRS);

const ROOT_SUBDIRS: SubdirMap = &[("api", &API_ROUTER)];

/// The full tree served on the API listener.
pub static ROOT_ROUTER: Router = Router::new().subdirs(ROOT_SUBDIRS);

// ------ shared handler helpers ------

/// The uniform mutation response: `{status, resource, revision}`.
pub(crate) fn resource_response<T: serde::Serialize>(
    status: &str,
    resource: &T,
    revision: u64,
) -> Result<Value, Error> {
    Ok(json!({
        "status": status,
        "resource": serde_json::to_value(resource)?,
        "revision": revision,
    }))
}

/// Like [`resource_response`], plus the task id and follow-up URL of a
/// long-running operation.
pub(crate) fn task_response<T: serde::Serialize>(
    status: &str,
    resource: &T,
    revision: u64,
    task: Ulid,
    status_url: String,
) -> Result<Value, Error> {
    let mut value = resource_response(status, resource, revision)?;
    value["task"] = json!(task.to_string());
    value["status_url"] = json!(status_url);
    Ok(value)
}

/// Remove and return a path/query parameter injected by the router, so the
/// remaining object can be deserialized with `deny_unknown_fields`.
pub(crate) fn take_param(params: &mut Value, field: &str) -> Result<String, Error> {
    match params
        .as_object_mut()
        .and_then(|map| map.remove(field))
    {
        Some(Value::String(value)) => Ok(value),
        _ => Err(api_err!(Validation, "missing parameter '{field}'")),
    }
}

pub(crate) fn take_ulid(params: &mut Value, field: &str) -> Result<Ulid, Error> {
    let raw = take_param(params, field)?;
    raw.parse()
        .map_err(|_| api_err!(Validation, "'{raw}' is not a valid id"))
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, Error> {
    serde_json::from_value(params).map_err(|err| api_err!(Validation, "invalid request: {err}"))
}

// ------ GET /api/health ------

static HEALTH_ROUTER: Router = Router::new().get(&API_METHOD_HEALTH);
static API_METHOD_HEALTH: ApiMethod = ApiMethod::new(&ApiHandler::Async(&health));

fn health(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let state = state();

        let store_ok = !state.store.is_degraded();

        let hosts = state.store.list_typed::<Host>(keys::HOST_PREFIX)?;
        let total = hosts.len();
        let ready = hosts
            .iter()
            .filter(|(host, _)| host.health == HostHealth::Ready)
            .count();
        let drivers_ok = total == 0 || ready > 0;

        let healthy = store_ok && drivers_ok;
        Ok(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "components": {
                "store": if store_ok { "ok" } else { "degraded" },
                "drivers": { "ready": ready, "total": total },
                "scheduler": "ok",
            },
        }))
    })
}
