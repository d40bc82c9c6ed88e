//! REST server building blocks: routing tables, the hyper service glue,
//! response formatting, worker-task tracking and process shutdown state.

/// Response body type used throughout the server.
pub type Body = http_body_util::Full<bytes::Bytes>;

pub mod formatter;

mod rest;
pub use rest::{serve, ApiService};

mod router;
pub use router::{
    ApiFuture, ApiHandler, ApiHandlerFn, ApiMethod, ApiRawHandlerFn, ApiResponseFuture, Router,
    SubRoute, SubdirMap,
};

mod state;
pub use state::{
    catch_shutdown_signals, fail_on_shutdown, is_shutdown_requested, request_shutdown,
    shutdown_future,
};

mod worker_task;
pub use worker_task::{
    abort_task, check_workers_on_shutdown, last_worker_future, list_tasks, lookup_task, TaskState,
    WorkerTask,
};
