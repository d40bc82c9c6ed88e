//! `/api/tasks`: worker task list, status and abort.

use serde_json::{json, Value};

use vdc_api_types::api_err;
use vdc_rest_server::{abort_task, list_tasks, lookup_task, ApiFuture, ApiHandler, ApiMethod, Router};

use super::take_ulid;

pub static ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_TASKS)
    .match_all("id", &ITEM_ROUTER);

static ITEM_ROUTER: Router = Router::new()
    .get(&API_METHOD_READ_TASK)
    .delete(&API_METHOD_ABORT_TASK);

static API_METHOD_LIST_TASKS: ApiMethod = ApiMethod::new(&ApiHandler::Async(&list));
static API_METHOD_READ_TASK: ApiMethod = ApiMethod::new(&ApiHandler::Async(&read));
static API_METHOD_ABORT_TASK: ApiMethod =
    ApiMethod::new(&ApiHandler::Async(&abort)).status(202);

fn list(_param: Value) -> ApiFuture {
    Box::pin(async move {
        let tasks = list_tasks();
        Ok(json!({ "data": tasks, "total": tasks.len() }))
    })
}

fn read(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        lookup_task(id).ok_or_else(|| api_err!(NotFound, "no such task '{id}'"))
    })
}

fn abort(mut param: Value) -> ApiFuture {
    Box::pin(async move {
        let id = take_ulid(&mut param, "id")?;
        if !abort_task(id) {
            return Err(api_err!(NotFound, "task '{id}' is not running"));
        }
        Ok(json!({ "status": "aborting", "task": id.to_string() }))
    })
}
