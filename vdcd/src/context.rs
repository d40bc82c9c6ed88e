//! Process-wide state.
//!
//! Initialized once at startup; handlers and background tasks reach it
//! through [`state()`]. Everything mutable in here is either the Store or a
//! small runtime cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Error;

use vdc_api_types::{api_err, keys, Host, Ulid, VmRecord};
use vdc_console::{ConsoleHub, TicketRegistry};
use vdc_driver::{DomainMetrics, DomainStatus, Driver, ExecTransport, LocalExec, SshExec};
use vdc_store::Store;

use crate::config::Config;
use crate::reconcile::ReconcileQueue;

pub type HostDriver = Arc<Driver<ExecTransport>>;

pub struct AppState {
    pub config: Config,
    pub store: Store,
    drivers: Mutex<HashMap<String, HostDriver>>,
    pub hub: ConsoleHub,
    pub tickets: TicketRegistry,
    pub reconciler: ReconcileQueue,
    /// Last driver-reported status/metrics per VM, timestamped.
    pub status_cache: Mutex<HashMap<Ulid, DomainStatus>>,
    pub metrics_cache: Mutex<HashMap<Ulid, DomainMetrics>>,
}

static STATE: OnceLock<AppState> = OnceLock::new();

pub fn init(state: AppState) {
    if STATE.set(state).is_err() {
        panic!("application state initialized twice");
    }
}

pub fn state() -> &'static AppState {
    STATE.get().expect("application state is not initialized")
}

impl AppState {
    pub fn new(config: Config, store: Store, reconciler: ReconcileQueue) -> Self {
        Self {
            config,
            store,
            drivers: Mutex::new(HashMap::new()),
            hub: ConsoleHub::new(),
            tickets: TicketRegistry::new(),
            reconciler,
            status_cache: Mutex::new(HashMap::new()),
            metrics_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Driver for a registered host; created on first use, then shared.
    pub fn driver(&self, host_id: &str) -> Result<HostDriver, Error> {
        if let Some(driver) = self.drivers.lock().unwrap().get(host_id) {
            return Ok(driver.clone());
        }

        let Some((host, _)) = self.store.get_typed::<Host>(&keys::host(host_id))? else {
            return Err(api_err!(NotFound, "no such host '{host_id}'"));
        };
        let transport = self.transport_for(&host);
        let driver = Arc::new(Driver::new(
            host,
            transport,
            self.config.host_verb_concurrency,
        ));
        let mut drivers = self.drivers.lock().unwrap();
        Ok(drivers
            .entry(host_id.to_string())
            .or_insert(driver)
            .clone())
    }

    fn transport_for(&self, host: &Host) -> ExecTransport {
        // the hosts file marks the control plane's own hypervisor with
        // address "local"
        if host.address == "local" {
            ExecTransport::Local(LocalExec)
        } else {
            ExecTransport::Ssh(SshExec {
                user: host.ssh_user.clone(),
                address: host.address.clone(),
                port: host.ssh_port,
                identity: self.config.ssh_identity.clone(),
                control_dir: self.config.ssh_control_dir.clone(),
            })
        }
    }

    /// Forget a cached driver (host re-registered with new settings).
    pub fn drop_driver(&self, host_id: &str) {
        self.drivers.lock().unwrap().remove(host_id);
    }

    pub fn record_status(&self, vm: Ulid, status: DomainStatus) {
        self.status_cache.lock().unwrap().insert(vm, status);
    }

    pub fn cached_status(&self, vm: Ulid) -> Option<DomainStatus> {
        self.status_cache.lock().unwrap().get(&vm).cloned()
    }

    pub fn record_metrics(&self, vm: Ulid, metrics: DomainMetrics) {
        self.metrics_cache.lock().unwrap().insert(vm, metrics);
    }

    pub fn cached_metrics(&self, vm: Ulid) -> Option<DomainMetrics> {
        self.metrics_cache.lock().unwrap().get(&vm).cloned()
    }

    pub fn forget_vm(&self, vm: Ulid) {
        self.status_cache.lock().unwrap().remove(&vm);
        self.metrics_cache.lock().unwrap().remove(&vm);
    }

    // ------ store lookups shared across handlers and reconciler ------

    pub fn lookup_vm(&self, id: Ulid) -> Result<(VmRecord, u64), Error> {
        self.store
            .get_typed::<VmRecord>(&keys::vm(id))?
            .ok_or_else(|| api_err!(NotFound, "no such vm '{id}'"))
    }

    pub fn lookup_vm_by_name(&self, name: &str) -> Result<(VmRecord, u64), Error> {
        for (vm, rev) in self.store.list_typed::<VmRecord>(keys::VM_PREFIX)? {
            if vm.name == name && !vm.status.is_terminated() {
                return Ok((vm, rev));
            }
        }
        Err(api_err!(NotFound, "no such vm '{name}'"))
    }

    pub fn lookup_host(&self, id: &str) -> Result<(Host, u64), Error> {
        self.store
            .get_typed::<Host>(&keys::host(id))?
            .ok_or_else(|| api_err!(NotFound, "no such host '{id}'"))
    }

    pub fn lookup_vpc(&self, name: &str) -> Result<(vdc_api_types::Vpc, u64), Error> {
        self.store
            .get_typed::<vdc_api_types::Vpc>(&keys::vpc(name))?
            .ok_or_else(|| api_err!(NotFound, "no such vpc '{name}'"))
    }

    /// Mutate a VM row with a CAS retry loop. The closure may fail; a
    /// `conflict` from the commit retries with a fresh snapshot.
    pub fn update_vm<F>(&self, id: Ulid, mut mutate: F) -> Result<(VmRecord, u64), Error>
    where
        F: FnMut(&mut VmRecord) -> Result<(), Error>,
    {
        loop {
            let (mut vm, rev) = self.lookup_vm(id)?;
            mutate(&mut vm)?;
            match self
                .store
                .put(&keys::vm(id), &vm, vdc_store::Expect::Rev(rev))
            {
                Ok(new_rev) => return Ok((vm, new_rev)),
                Err(err) if vdc_api_types::error_code(&err) == vdc_api_types::ErrorCode::Conflict => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Shared in-memory state for handler tests. Initialized once per test
/// process; tests must use distinct entity names.
#[cfg(test)]
pub(crate) fn test_state() -> &'static AppState {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let config = Config {
            store_path: std::path::PathBuf::from("/nonexistent"),
            hosts_config: std::path::PathBuf::from("/nonexistent"),
            api_listen: "127.0.0.1:0".to_string(),
            ws_listen: "127.0.0.1:0".to_string(),
            public_ip_pool: vec!["203.0.113.0/28".parse().unwrap()],
            default_vpc_cidr: "10.0.0.0/24".parse().unwrap(),
            reconcile_workers: 2,
            host_verb_concurrency: 2,
            ssh_identity: None,
            ssh_control_dir: std::path::PathBuf::from("/nonexistent"),
        };
        let (queue, _rx) = ReconcileQueue::new();
        init(AppState::new(config, Store::in_memory(), queue));
    });
    state()
}
