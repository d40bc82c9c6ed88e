//! Reconciliation dispatch.
//!
//! One logical task per entity: requests for the same entity serialize (a
//! run in flight absorbs later requests into a single re-run), requests for
//! different entities run concurrently up to the worker bound. Each run is
//! a tracked worker task, so it shows up in the task list and participates
//! in graceful shutdown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use vdc_api_types::Ulid;
use vdc_rest_server::WorkerTask;

use crate::context::AppState;

mod retry;
pub(crate) use retry::step;

pub mod vm;
pub mod vpc;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Entity {
    Vm(Ulid),
    Vpc(String),
}

impl Entity {
    fn describe(&self) -> String {
        match self {
            Entity::Vm(id) => format!("vm/{id}"),
            Entity::Vpc(name) => format!("vpc/{name}"),
        }
    }
}

#[derive(Clone)]
pub struct ReconcileQueue {
    tx: mpsc::UnboundedSender<Entity>,
}

impl ReconcileQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Entity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Request reconciliation of an entity; cheap and non-blocking.
    pub fn kick(&self, entity: Entity) {
        let _ = self.tx.send(entity);
    }

    pub fn kick_vm(&self, id: Ulid) {
        self.kick(Entity::Vm(id));
    }

    pub fn kick_vpc(&self, name: &str) {
        self.kick(Entity::Vpc(name.to_string()));
    }
}

struct DispatchState {
    running: HashSet<Entity>,
    pending: HashSet<Entity>,
}

/// Run the dispatcher until the queue closes (daemon shutdown).
pub async fn run_dispatcher(
    state: &'static AppState,
    mut rx: mpsc::UnboundedReceiver<Entity>,
    workers: usize,
) {
    let limit = Arc::new(Semaphore::new(workers));
    let dispatch = Arc::new(Mutex::new(DispatchState {
        running: HashSet::new(),
        pending: HashSet::new(),
    }));

    while let Some(entity) = rx.recv().await {
        if vdc_rest_server::is_shutdown_requested() {
            continue;
        }

        {
            let mut dispatch = dispatch.lock().unwrap();
            if dispatch.running.contains(&entity) {
                // absorbed: the running task re-runs once it finishes
                dispatch.pending.insert(entity);
                continue;
            }
            dispatch.running.insert(entity.clone());
        }

        let limit = limit.clone();
        let dispatch = dispatch.clone();
        let queue = state.reconciler.clone();
        spawn_entity_task(state, entity.clone(), limit, move |result| {
            let rerun = {
                let mut dispatch = dispatch.lock().unwrap();
                dispatch.running.remove(&entity);
                dispatch.pending.remove(&entity)
            };
            if let Err(err) = result {
                error!("reconciliation of {} failed: {err:#}", entity.describe());
            }
            if rerun {
                debug!("re-running reconciliation of {}", entity.describe());
                queue.kick(entity);
            }
        });
    }
}

fn spawn_entity_task<F>(state: &'static AppState, entity: Entity, limit: Arc<Semaphore>, on_done: F)
where
    F: FnOnce(&Result<(), anyhow::Error>) + Send + 'static,
{
    let kind = match entity {
        Entity::Vm(_) => "reconcile-vm",
        Entity::Vpc(_) => "reconcile-vpc",
    };
    WorkerTask::spawn(kind, Some(entity.describe()), move |worker| async move {
        // worker bound: wait for a slot before doing anything
        let _permit = limit.acquire_owned().await?;
        let result = match &entity {
            Entity::Vm(id) => vm::reconcile(state, &worker, *id).await,
            Entity::Vpc(name) => vpc::reconcile(state, &worker, name).await,
        };
        on_done(&result);
        result
    });
}

/// Follow the Store's VM change stream and kick reconciliation for every
/// committed change. Explicit kicks from the API are still sent (they are
/// cheaper than waiting for the broadcast), but this loop guarantees no
/// desired-state write is ever lost, including writes replayed after a
/// resync.
pub async fn watch_vm_changes(state: &'static AppState) {
    use vdc_api_types::keys;
    use vdc_store::WatchError;

    loop {
        let mut watcher = state.store.watch(keys::VM_PREFIX, state.store.revision());
        loop {
            tokio::select! {
                _ = vdc_rest_server::shutdown_future() => return,
                event = watcher.next() => match event {
                    Ok(event) => {
                        let raw = event.key.trim_start_matches(keys::VM_PREFIX);
                        if let Ok(id) = raw.parse::<Ulid>() {
                            state.reconciler.kick_vm(id);
                        }
                    }
                    Err(WatchError::Resync) => {
                        // catch up from a fresh snapshot
                        if let Err(err) = enqueue_all(state) {
                            error!("vm watch resync failed: {err:#}");
                        }
                        break;
                    }
                    Err(WatchError::Closed) => return,
                },
            }
        }
    }
}

/// Queue every entity that might have pending work; called at startup so
/// interrupted transitions resume from Store state.
pub fn enqueue_all(state: &AppState) -> Result<(), anyhow::Error> {
    use vdc_api_types::{keys, VmRecord, VmStatus, Vpc};

    for (vm, _) in state.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
        match vm.status {
            VmStatus::Terminated | VmStatus::Error => (),
            _ => state.reconciler.kick_vm(vm.id),
        }
    }
    for (vpc, _) in state.store.list_typed::<Vpc>(keys::VPC_PREFIX)? {
        state.reconciler.kick_vpc(&vpc.name);
    }
    Ok(())
}
