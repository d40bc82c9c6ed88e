//! Tracked long-running tasks.
//!
//! Every long-running operation (VM transition, migration, sweep) runs as a
//! worker task: it has a task id, progress, an abort flag with listeners,
//! and a final state kept for the task-list API. The daemon's graceful
//! shutdown waits for [`last_worker_future`] once a shutdown was requested.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

use anyhow::{bail, Error};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use vdc_api_types::{time::epoch_i64, Ulid};

static WORKER_TASK_LIST: LazyLock<Mutex<HashMap<Ulid, Arc<WorkerTask>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static FINISHED_TASKS: LazyLock<Mutex<VecDeque<Value>>> =
    LazyLock::new(|| Mutex::new(VecDeque::new()));
static LAST_WORKER_LISTENERS: OnceLock<watch::Sender<bool>> = OnceLock::new();
static WORKER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Finished tasks kept for the task-list API.
const FINISHED_BACKLOG: usize = 256;

fn last_worker_listeners() -> &'static watch::Sender<bool> {
    LAST_WORKER_LISTENERS.get_or_init(|| watch::channel(false).0)
}

/// Finishes once a shutdown is requested and no more workers run.
pub async fn last_worker_future() {
    let _ = last_worker_listeners().subscribe().wait_for(|&v| v).await;
}

fn check_last_worker() {
    if crate::is_shutdown_requested() && WORKER_COUNT.load(Ordering::Acquire) == 0 {
        let _ = last_worker_listeners().send(true);
    }
}

/// Trigger the last-worker check when shutdown gets requested while no
/// worker is running at all.
pub fn check_workers_on_shutdown() {
    tokio::spawn(async {
        crate::shutdown_future().await;
        check_last_worker();
    });
}

/// Final state of a finished task.
#[derive(Clone, Debug)]
pub enum TaskState {
    Ok { endtime: i64 },
    Error { message: String, endtime: i64 },
}

impl TaskState {
    fn to_json(&self) -> Value {
        match self {
            TaskState::Ok { endtime } => json!({ "status": "ok", "endtime": endtime }),
            TaskState::Error { message, endtime } => {
                json!({ "status": "error", "message": message, "endtime": endtime })
            }
        }
    }
}

struct WorkerTaskData {
    progress: f64, // 0..1
    abort_listeners: Vec<oneshot::Sender<()>>,
}

/// A running worker task.
pub struct WorkerTask {
    id: Ulid,
    kind: &'static str,
    entity: Option<String>,
    started_at: i64,
    abort_requested: AtomicBool,
    data: Mutex<WorkerTaskData>,
}

impl WorkerTask {
    /// Spawn a tokio task tracked as a worker.
    pub fn spawn<F, T>(kind: &'static str, entity: Option<String>, f: F) -> Ulid
    where
        F: Send + 'static + FnOnce(Arc<WorkerTask>) -> T,
        T: Send + 'static + Future<Output = Result<(), Error>>,
    {
        let worker = Arc::new(WorkerTask {
            id: Ulid::generate(),
            kind,
            entity,
            started_at: epoch_i64(),
            abort_requested: AtomicBool::new(false),
            data: Mutex::new(WorkerTaskData {
                progress: 0.0,
                abort_listeners: Vec::new(),
            }),
        });

        let id = worker.id;
        {
            let mut list = WORKER_TASK_LIST.lock().unwrap();
            list.insert(id, worker.clone());
            WORKER_COUNT.store(list.len(), Ordering::Release);
        }

        let future = f(worker.clone());
        tokio::spawn(async move {
            let result = future.await;
            worker.log_result(&result);
        });

        id
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Set progress (0..=1).
    pub fn progress(&self, progress: f64) {
        if (0.0..=1.0).contains(&progress) {
            self.data.lock().unwrap().progress = progress;
        }
    }

    /// Request abort; all listeners fire once.
    pub fn request_abort(&self) {
        let prev = self.abort_requested.swap(true, Ordering::SeqCst);
        if !prev {
            info!(task = %self.id, "received abort request");
        }
        let mut data = self.data.lock().unwrap();
        while let Some(tx) = data.abort_listeners.pop() {
            let _ = tx.send(());
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Fail with a reasonable message if the task should stop.
    pub fn check_abort(&self) -> Result<(), Error> {
        if self.abort_requested() {
            bail!("abort requested - aborting task");
        }
        crate::fail_on_shutdown()
    }

    /// A future resolving when abort is requested.
    pub fn abort_future(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut data = self.data.lock().unwrap();
        if self.abort_requested() {
            let _ = tx.send(());
        } else {
            data.abort_listeners.push(tx);
        }
        rx
    }

    fn describe(&self, state: Option<&TaskState>) -> Value {
        let mut value = json!({
            "id": self.id.to_string(),
            "type": self.kind,
            "started_at": self.started_at,
            "progress": self.data.lock().unwrap().progress,
        });
        if let Some(entity) = &self.entity {
            value["entity"] = json!(entity);
        }
        if let Some(state) = state {
            value["state"] = state.to_json();
        }
        value
    }

    fn log_result(&self, result: &Result<(), Error>) {
        let endtime = epoch_i64();
        let state = match result {
            Ok(()) => TaskState::Ok { endtime },
            Err(err) => {
                error!(task = %self.id, kind = self.kind, "task failed: {err:#}");
                TaskState::Error {
                    message: err.to_string(),
                    endtime,
                }
            }
        };

        {
            let mut finished = FINISHED_TASKS.lock().unwrap();
            finished.push_back(self.describe(Some(&state)));
            if finished.len() > FINISHED_BACKLOG {
                finished.pop_front();
            }
        }

        let mut list = WORKER_TASK_LIST.lock().unwrap();
        list.remove(&self.id);
        WORKER_COUNT.store(list.len(), Ordering::Release);
        drop(list);
        check_last_worker();
    }
}

/// Describe all running tasks, then the finished backlog (newest last).
pub fn list_tasks() -> Vec<Value> {
    let mut out: Vec<Value> = WORKER_TASK_LIST
        .lock()
        .unwrap()
        .values()
        .map(|task| task.describe(None))
        .collect();
    out.sort_by_key(|v| v["started_at"].as_i64().unwrap_or(0));
    out.extend(FINISHED_TASKS.lock().unwrap().iter().cloned());
    out
}

/// Describe one task, running or finished.
pub fn lookup_task(id: Ulid) -> Option<Value> {
    if let Some(task) = WORKER_TASK_LIST.lock().unwrap().get(&id) {
        return Some(task.describe(None));
    }
    let id = id.to_string();
    FINISHED_TASKS
        .lock()
        .unwrap()
        .iter()
        .find(|v| v["id"].as_str() == Some(id.as_str()))
        .cloned()
}

/// Abort a running task; `false` when it is not running.
pub fn abort_task(id: Ulid) -> bool {
    match WORKER_TASK_LIST.lock().unwrap().get(&id) {
        Some(task) => {
            task.request_abort();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_lifecycle() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let id = WorkerTask::spawn("test", Some("vm-1".to_string()), move |task| async move {
            task.progress(0.5);
            let _ = release_rx.await;
            Ok(())
        });

        let described = lookup_task(id).expect("task is listed");
        assert_eq!(described["type"], "test");
        assert_eq!(described["entity"], "vm-1");

        release_tx.send(()).unwrap();
        // wait for the task to drain into the finished backlog
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if lookup_task(id).map(|v| v["state"].is_object()) == Some(true) {
                break;
            }
        }
        let finished = lookup_task(id).expect("finished task is kept");
        assert_eq!(finished["state"]["status"], "ok");
    }

    #[tokio::test]
    async fn abort_fires_listeners() {
        let id = WorkerTask::spawn("abort-test", None, move |task| async move {
            let abort = task.abort_future();
            let _ = abort.await;
            anyhow::bail!("aborted")
        });

        for _ in 0..100 {
            if abort_task(id) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Some(v) = lookup_task(id) {
                if v["state"]["status"] == "error" {
                    return;
                }
            }
        }
        panic!("task never recorded the abort");
    }
}
