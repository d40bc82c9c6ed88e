//! Host driver: the uniform verb set the control plane speaks to a
//! hypervisor host.
//!
//! A [`Driver`] is bound to one host and drives its libvirt/qemu stack by
//! running `virsh`, `qemu-img`, `ip`, `iptables` and `genisoimage` through a
//! [`Transport`] (local exec or SSH). Every verb is idempotent: it probes
//! the current host state first and succeeds without action when the goal
//! state already holds, so the reconciler can re-issue any step after a
//! crash or retry. Verb failures are classified into retryable
//! (`driver_unavailable`, `driver_timeout`) and terminal errors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Error};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vdc_api_types::{api_err, Host, Image, Ulid, Vpc};

mod cloudinit;
pub use cloudinit::{render_meta_data, render_user_data};

mod domain;
pub use domain::{build_xml, mac_for, uuid_for, DomainDisk, DomainSpec};

pub mod paths;

mod transport;
pub use transport::{
    shell_quote, CommandOutput, ConsoleStream, ExecTransport, LocalExec, SshExec, Transport,
};

/// Default per-verb timeout.
pub const VERB_TIMEOUT: Duration = Duration::from_secs(30);

/// Cancellation and deadline for one driver verb.
#[derive(Clone)]
pub struct VerbContext {
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

impl Default for VerbContext {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout: VERB_TIMEOUT,
        }
    }
}

impl VerbContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: VERB_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Libvirt domain power state, reduced to what the reconciler acts on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Running,
    ShutOff,
    Paused,
    Crashed,
    Other,
}

/// Result of the `status` verb for one domain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainStatus {
    pub state: DomainState,
    pub vcpus: Option<u32>,
    pub max_memory_kib: Option<u64>,
    pub timestamp: i64,
}

/// Last-known guest counters as reported by `virsh domstats`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DomainMetrics {
    pub cpu_time_ns: Option<u64>,
    pub memory_kib: Option<u64>,
    pub disk_rd_bytes: Option<u64>,
    pub disk_wr_bytes: Option<u64>,
    pub net_rx_bytes: Option<u64>,
    pub net_tx_bytes: Option<u64>,
    pub timestamp: i64,
}

/// Progress of a live migration as seen from the source host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum MigrationProgress {
    /// Migration process launched, no job visible yet.
    Starting,
    Running {
        percent: f64,
    },
    Completed,
    Failed {
        reason: String,
    },
}

/// Static facts about a host, probed once per driver lifetime.
#[derive(Clone, Debug)]
pub struct HostFacts {
    pub libvirt_version: String,
    pub hostname: String,
}

/// Driver instance bound to one host.
pub struct Driver<T> {
    host: Host,
    transport: T,
    /// Bounds concurrent verbs per host to what libvirt tolerates.
    verbs: Arc<Semaphore>,
    facts: tokio::sync::Mutex<Option<HostFacts>>,
}

/// Classify a failed command into the stable error-code space.
fn classify(what: &str, out: &CommandOutput) -> Error {
    let stderr = out.stderr.trim();

    // ssh itself failed (network, auth, host down)
    if out.exit_code == 255 {
        return api_err!(DriverUnavailable, "{what}: host unreachable: {stderr}");
    }

    let lowered = stderr.to_lowercase();
    if lowered.contains("failed to get domain")
        || lowered.contains("domain not found")
        || lowered.contains("no such file or directory")
        || lowered.contains("cannot find")
    {
        return api_err!(NotFound, "{what}: {stderr}");
    }
    if lowered.contains("failed to connect to the hypervisor")
        || lowered.contains("connection refused")
        || lowered.contains("no route to host")
    {
        return api_err!(DriverUnavailable, "{what}: {stderr}");
    }

    api_err!(DriverTerminal, "{what} failed (exit {}): {stderr}", out.exit_code)
}

impl<T: Transport> Driver<T> {
    pub fn new(host: Host, transport: T, verb_concurrency: usize) -> Self {
        Self {
            host,
            transport,
            verbs: Arc::new(Semaphore::new(verb_concurrency.max(1))),
            facts: tokio::sync::Mutex::new(None),
        }
    }

    /// Static connection/layout info of the bound host. Dynamic host state
    /// (health, allocations) lives in the Store, not here.
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn host_id(&self) -> &str {
        &self.host.id
    }

    /// Run a command under the per-host verb semaphore; command failure is
    /// returned as classified error.
    async fn run_ok(
        &self,
        ctx: &VerbContext,
        what: &str,
        command: String,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Error> {
        let out = self.run_raw(ctx, what, command, stdin).await?;
        if !out.success() {
            return Err(classify(what, &out));
        }
        Ok(out)
    }

    /// Like [`run_ok`](Self::run_ok) but hands back non-zero exits for the
    /// caller to interpret (state probes).
    async fn run_raw(
        &self,
        ctx: &VerbContext,
        what: &str,
        command: String,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Error> {
        let _permit = self
            .verbs
            .acquire()
            .await
            .context("verb semaphore closed")?;
        debug!(host = %self.host.id, %command, "driver verb {what}");
        self.transport.run(ctx, &command, stdin).await
    }

    /// Liveness probe: does the libvirt daemon answer?
    pub async fn ping(&self, ctx: &VerbContext) -> Result<(), Error> {
        self.run_ok(ctx, "ping", "virsh version --daemon".to_string(), None)
            .await?;
        Ok(())
    }

    /// Probe (and cache) static host facts.
    pub async fn facts(&self, ctx: &VerbContext) -> Result<HostFacts, Error> {
        let mut cached = self.facts.lock().await;
        if let Some(facts) = cached.as_ref() {
            return Ok(facts.clone());
        }
        let out = self
            .run_ok(ctx, "facts", "virsh version --daemon; hostname".to_string(), None)
            .await?;
        let mut libvirt_version = String::new();
        let mut hostname = String::new();
        for line in out.stdout.lines() {
            if let Some(rest) = line.strip_prefix("Running against library: libvirt ") {
                libvirt_version = rest.trim().to_string();
            }
        }
        if let Some(last) = out.stdout.lines().last() {
            hostname = last.trim().to_string();
        }
        let facts = HostFacts {
            libvirt_version,
            hostname,
        };
        *cached = Some(facts.clone());
        Ok(facts)
    }

    /// Create the per-host workspace directories.
    pub async fn ensure_workspace(&self, ctx: &VerbContext) -> Result<(), Error> {
        let root = shell_quote(&self.host.vm_root);
        let command = format!(
            "mkdir -p {root}/images {root}/disks {root}/volumes {root}/consoles {root}/nvram {root}/run"
        );
        self.run_ok(ctx, "ensure_workspace", command, None).await?;
        Ok(())
    }

    /// Check that an image is present on this host. Fetching images is out
    /// of scope, so absence is a terminal error.
    pub async fn ensure_image(&self, ctx: &VerbContext, image: &Image) -> Result<String, Error> {
        let path = image.path_on(&self.host.id).ok_or_else(|| {
            api_err!(
                NotFound,
                "image '{}' is not declared for host {}",
                image.id,
                self.host.id
            )
        })?;
        let command = format!("test -f {}", shell_quote(path));
        let out = self.run_raw(ctx, "ensure_image", command, None).await?;
        if !out.success() {
            return Err(api_err!(
                NotFound,
                "image '{}' missing on host {} at {}",
                image.id,
                self.host.id,
                path
            ));
        }
        Ok(path.to_string())
    }

    // ------ network ------

    /// Create the per-VPC bridge and NAT plumbing on this host.
    pub async fn define_network(&self, ctx: &VerbContext, vpc: &Vpc) -> Result<(), Error> {
        let bridge = vpc.bridge_name();
        let gateway = vpc.gateway;
        let mask = vpc.cidr.mask();
        let uplink = shell_quote(&self.host.uplink);
        let cidr = vpc.cidr;

        let command = format!(
            "ip link show {bridge} >/dev/null 2>&1 || ip link add name {bridge} type bridge"
        );
        self.run_ok(ctx, "define_network", command, None).await?;
        let command = format!(
            "ip addr replace {gateway}/{mask} dev {bridge} && ip link set {bridge} up mtu {}",
            vpc.mtu
        );
        self.run_ok(ctx, "define_network", command, None).await?;

        let masq = format!("POSTROUTING -s {cidr} ! -d {cidr} -o {uplink} -j MASQUERADE");
        let command = format!("iptables -t nat -C {masq} 2>/dev/null || iptables -t nat -A {masq}");
        self.run_ok(ctx, "define_network", command, None).await?;

        self.ensure_chains(ctx, vpc).await?;

        info!(host = %self.host.id, vpc = %vpc.name, %bridge, "network defined");
        Ok(())
    }

    /// Create the VPC chains (empty, default-accept until the first firewall
    /// push) and the FORWARD jumps for traffic crossing the bridge.
    async fn ensure_chains(&self, ctx: &VerbContext, vpc: &Vpc) -> Result<(), Error> {
        let bridge = vpc.bridge_name();
        let (chain_in, chain_out) = vdc_firewall::chain_names(vpc);
        for chain in [&chain_in, &chain_out] {
            let command =
                format!("iptables -n -L {chain} >/dev/null 2>&1 || iptables -N {chain}");
            self.run_ok(ctx, "ensure_chains", command, None).await?;
        }
        let jump_in = format!("FORWARD -o {bridge} -j {chain_in}");
        let jump_out = format!("FORWARD -i {bridge} -j {chain_out}");
        for jump in [&jump_in, &jump_out] {
            let command = format!("iptables -C {jump} 2>/dev/null || iptables -I {jump}");
            self.run_ok(ctx, "ensure_chains", command, None).await?;
        }
        Ok(())
    }

    /// Tear down bridge, chains and NAT of a VPC. Best effort and
    /// idempotent: already-absent pieces are fine.
    pub async fn destroy_network(&self, ctx: &VerbContext, vpc: &Vpc) -> Result<(), Error> {
        let bridge = vpc.bridge_name();
        let (chain_in, chain_out) = vdc_firewall::chain_names(vpc);
        let cidr = vpc.cidr;
        let uplink = shell_quote(&self.host.uplink);

        let steps = [
            format!("iptables -D FORWARD -o {bridge} -j {chain_in} 2>/dev/null || true"),
            format!("iptables -D FORWARD -i {bridge} -j {chain_out} 2>/dev/null || true"),
            format!("iptables -F {chain_in} 2>/dev/null; iptables -X {chain_in} 2>/dev/null || true"),
            format!("iptables -F {chain_out} 2>/dev/null; iptables -X {chain_out} 2>/dev/null || true"),
            format!(
                "iptables -t nat -D POSTROUTING -s {cidr} ! -d {cidr} -o {uplink} -j MASQUERADE 2>/dev/null || true"
            ),
            format!("ip link del {bridge} 2>/dev/null || true"),
        ];
        for command in steps {
            self.run_ok(ctx, "destroy_network", command, None).await?;
        }
        info!(host = %self.host.id, vpc = %vpc.name, "network destroyed");
        Ok(())
    }

    /// Push a compiled firewall script (an `iptables-restore --noflush`
    /// payload). The caller is expected to skip the call when the digest
    /// matches the last applied one.
    pub async fn apply_firewall(
        &self,
        ctx: &VerbContext,
        vpc: &Vpc,
        script: &str,
    ) -> Result<(), Error> {
        self.ensure_chains(ctx, vpc).await?;
        self.run_ok(
            ctx,
            "apply_firewall",
            "iptables-restore --noflush".to_string(),
            Some(script.as_bytes()),
        )
        .await?;
        info!(host = %self.host.id, vpc = %vpc.name, "firewall applied");
        Ok(())
    }

    // ------ volumes ------

    /// Create the root disk as a copy-on-write overlay of the base image.
    pub async fn create_root_disk(
        &self,
        ctx: &VerbContext,
        vm_id: Ulid,
        image_path: &str,
        size_gb: u64,
    ) -> Result<String, Error> {
        let path = paths::root_disk(&self.host.vm_root, vm_id);
        let quoted = shell_quote(&path);
        let command = format!(
            "test -f {quoted} || qemu-img create -f qcow2 -b {} -F qcow2 {quoted} {size_gb}G",
            shell_quote(image_path)
        );
        self.run_ok(ctx, "create_root_disk", command, None).await?;
        Ok(path)
    }

    /// Create a standalone data volume.
    pub async fn create_volume(
        &self,
        ctx: &VerbContext,
        disk_id: Ulid,
        size_gb: u64,
    ) -> Result<String, Error> {
        let path = paths::volume(&self.host.vm_root, disk_id);
        let quoted = shell_quote(&path);
        let command = format!("test -f {quoted} || qemu-img create -f qcow2 {quoted} {size_gb}G");
        self.run_ok(ctx, "create_volume", command, None).await?;
        Ok(path)
    }

    /// Grow a volume in place.
    pub async fn resize_volume(
        &self,
        ctx: &VerbContext,
        path: &str,
        size_gb: u64,
    ) -> Result<(), Error> {
        let command = format!("qemu-img resize {} {size_gb}G", shell_quote(path));
        self.run_ok(ctx, "resize_volume", command, None).await?;
        Ok(())
    }

    /// Remove a volume file. Succeeds if it is already gone.
    pub async fn delete_volume(&self, ctx: &VerbContext, path: &str) -> Result<(), Error> {
        let command = format!("rm -f {}", shell_quote(path));
        self.run_ok(ctx, "delete_volume", command, None).await?;
        Ok(())
    }

    // ------ cloud-init ------

    /// Write the seed files and pack the cidata ISO on the host.
    pub async fn build_cloudinit_iso(
        &self,
        ctx: &VerbContext,
        vm_id: Ulid,
        user_data: &str,
        meta_data: &str,
    ) -> Result<String, Error> {
        let iso = paths::cloudinit_iso(&self.host.vm_root, vm_id);
        let seed_dir = format!("{}/run/seed-{vm_id}", self.host.vm_root);
        let seed = shell_quote(&seed_dir);

        self.run_ok(
            ctx,
            "build_cloudinit_iso",
            format!("mkdir -p {seed} && cat > {seed}/user-data"),
            Some(user_data.as_bytes()),
        )
        .await?;
        self.run_ok(
            ctx,
            "build_cloudinit_iso",
            format!("cat > {seed}/meta-data"),
            Some(meta_data.as_bytes()),
        )
        .await?;
        self.run_ok(
            ctx,
            "build_cloudinit_iso",
            format!(
                "genisoimage -quiet -output {} -volid cidata -joliet -rock {seed}/user-data {seed}/meta-data && rm -rf {seed}",
                shell_quote(&iso)
            ),
            None,
        )
        .await?;
        Ok(iso)
    }

    // ------ domains ------

    /// Define (or redefine) a domain from generated XML.
    pub async fn define_domain(&self, ctx: &VerbContext, spec: &DomainSpec) -> Result<(), Error> {
        let xml = build_xml(spec);
        self.run_ok(
            ctx,
            "define_domain",
            "virsh define /dev/stdin".to_string(),
            Some(xml.as_bytes()),
        )
        .await?;
        info!(host = %self.host.id, domain = %spec.name, "domain defined");
        Ok(())
    }

    /// Remove a domain definition; fine if it never existed.
    pub async fn undefine_domain(&self, ctx: &VerbContext, name: &str) -> Result<(), Error> {
        if self.domain_status(ctx, name).await?.is_none() {
            return Ok(());
        }
        let command = format!("virsh undefine {} --nvram", shell_quote(name));
        self.run_ok(ctx, "undefine_domain", command, None).await?;
        Ok(())
    }

    pub async fn start_domain(&self, ctx: &VerbContext, name: &str) -> Result<(), Error> {
        if let Some(status) = self.domain_status(ctx, name).await? {
            if status.state == DomainState::Running {
                return Ok(());
            }
        }
        let command = format!("virsh start {}", shell_quote(name));
        self.run_ok(ctx, "start_domain", command, None).await?;
        Ok(())
    }

    /// Gracefully stop a domain via ACPI; hard-destroy when it is still up
    /// after `force_after`.
    pub async fn stop_domain(
        &self,
        ctx: &VerbContext,
        name: &str,
        force_after: Duration,
    ) -> Result<(), Error> {
        match self.domain_status(ctx, name).await? {
            None => return Ok(()),
            Some(status) if status.state == DomainState::ShutOff => return Ok(()),
            Some(_) => (),
        }

        let command = format!("virsh shutdown {}", shell_quote(name));
        // a domain racing into shut-off state makes shutdown fail; probe again
        if let Err(err) = self.run_ok(ctx, "stop_domain", command, None).await {
            match self.domain_status(ctx, name).await? {
                Some(status) if status.state == DomainState::ShutOff => return Ok(()),
                None => return Ok(()),
                _ => return Err(err),
            }
        }

        let deadline = tokio::time::Instant::now() + force_after;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match self.domain_status(ctx, name).await? {
                None => return Ok(()),
                Some(status) if status.state == DomainState::ShutOff => return Ok(()),
                Some(_) => (),
            }
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("stop_domain cancelled");
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(host = %self.host.id, domain = name, "graceful shutdown timed out, destroying");
                let command = format!("virsh destroy {}", shell_quote(name));
                self.run_ok(ctx, "stop_domain", command, None).await?;
                return Ok(());
            }
        }
    }

    pub async fn reboot_domain(&self, ctx: &VerbContext, name: &str) -> Result<(), Error> {
        let command = format!("virsh reboot {}", shell_quote(name));
        self.run_ok(ctx, "reboot_domain", command, None).await?;
        Ok(())
    }

    /// `None` means the domain is not defined on this host.
    pub async fn domain_status(
        &self,
        ctx: &VerbContext,
        name: &str,
    ) -> Result<Option<DomainStatus>, Error> {
        let command = format!("virsh dominfo {}", shell_quote(name));
        let out = self.run_raw(ctx, "domain_status", command, None).await?;
        if !out.success() {
            let lowered = out.stderr.to_lowercase();
            if lowered.contains("failed to get domain") || lowered.contains("domain not found") {
                return Ok(None);
            }
            return Err(classify("domain_status", &out));
        }
        Ok(Some(parse_dominfo(&out.stdout)))
    }

    /// Last-known counters; values missing from `domstats` stay `None`.
    pub async fn domain_metrics(
        &self,
        ctx: &VerbContext,
        name: &str,
    ) -> Result<DomainMetrics, Error> {
        let command = format!("virsh domstats {}", shell_quote(name));
        let out = self.run_ok(ctx, "domain_metrics", command, None).await?;
        Ok(parse_domstats(&out.stdout))
    }

    /// Attach a volume at a device slot, persistently.
    pub async fn attach_volume(
        &self,
        ctx: &VerbContext,
        name: &str,
        path: &str,
        device: &str,
    ) -> Result<(), Error> {
        if self.domain_has_block(ctx, name, path).await? {
            return Ok(());
        }
        let command = format!(
            "virsh attach-disk {} {} {device} --driver qemu --subdriver qcow2 --targetbus virtio --persistent",
            shell_quote(name),
            shell_quote(path),
        );
        self.run_ok(ctx, "attach_volume", command, None).await?;
        Ok(())
    }

    /// Detach the volume at a device slot; fine if it is already gone.
    pub async fn detach_volume(
        &self,
        ctx: &VerbContext,
        name: &str,
        path: &str,
        device: &str,
    ) -> Result<(), Error> {
        if !self.domain_has_block(ctx, name, path).await? {
            return Ok(());
        }
        let command = format!(
            "virsh detach-disk {} {device} --persistent",
            shell_quote(name)
        );
        self.run_ok(ctx, "detach_volume", command, None).await?;
        Ok(())
    }

    async fn domain_has_block(
        &self,
        ctx: &VerbContext,
        name: &str,
        path: &str,
    ) -> Result<bool, Error> {
        let command = format!("virsh domblklist {}", shell_quote(name));
        let out = self.run_ok(ctx, "domain_has_block", command, None).await?;
        Ok(out.stdout.lines().any(|line| line.contains(path)))
    }

    /// Offline cpu/memory resize; the caller guarantees the domain is shut
    /// off.
    pub async fn resize_domain(
        &self,
        ctx: &VerbContext,
        name: &str,
        vcpus: u32,
        memory_mib: u64,
    ) -> Result<(), Error> {
        let quoted = shell_quote(name);
        let kib = memory_mib * 1024;
        let steps = [
            format!("virsh setmaxmem {quoted} {kib} --config"),
            format!("virsh setmem {quoted} {kib} --config"),
            format!("virsh setvcpus {quoted} {vcpus} --config --maximum"),
            format!("virsh setvcpus {quoted} {vcpus} --config"),
        ];
        for command in steps {
            self.run_ok(ctx, "resize_domain", command, None).await?;
        }
        Ok(())
    }

    // ------ NAT ------

    /// DNAT from a host port to the VM's SSH port.
    pub async fn ensure_ssh_nat(
        &self,
        ctx: &VerbContext,
        port: u16,
        private_ip: std::net::Ipv4Addr,
    ) -> Result<(), Error> {
        let rule = format!("PREROUTING -p tcp --dport {port} -j DNAT --to-destination {private_ip}:22");
        let command = format!("iptables -t nat -C {rule} 2>/dev/null || iptables -t nat -A {rule}");
        self.run_ok(ctx, "ensure_ssh_nat", command, None).await?;
        Ok(())
    }

    pub async fn drop_ssh_nat(
        &self,
        ctx: &VerbContext,
        port: u16,
        private_ip: std::net::Ipv4Addr,
    ) -> Result<(), Error> {
        let rule = format!("PREROUTING -p tcp --dport {port} -j DNAT --to-destination {private_ip}:22");
        let command = format!("iptables -t nat -D {rule} 2>/dev/null || true");
        self.run_ok(ctx, "drop_ssh_nat", command, None).await?;
        Ok(())
    }

    /// Expose a floating IP: DNAT inbound, SNAT replies.
    pub async fn ensure_floating_nat(
        &self,
        ctx: &VerbContext,
        floating: std::net::Ipv4Addr,
        private_ip: std::net::Ipv4Addr,
    ) -> Result<(), Error> {
        let dnat = format!("PREROUTING -d {floating} -j DNAT --to-destination {private_ip}");
        let snat = format!("POSTROUTING -s {private_ip} -j SNAT --to-source {floating}");
        for rule in [dnat, snat] {
            let command =
                format!("iptables -t nat -C {rule} 2>/dev/null || iptables -t nat -A {rule}");
            self.run_ok(ctx, "ensure_floating_nat", command, None).await?;
        }
        Ok(())
    }

    pub async fn drop_floating_nat(
        &self,
        ctx: &VerbContext,
        floating: std::net::Ipv4Addr,
        private_ip: std::net::Ipv4Addr,
    ) -> Result<(), Error> {
        let dnat = format!("PREROUTING -d {floating} -j DNAT --to-destination {private_ip}");
        let snat = format!("POSTROUTING -s {private_ip} -j SNAT --to-source {floating}");
        for rule in [dnat, snat] {
            let command = format!("iptables -t nat -D {rule} 2>/dev/null || true");
            self.run_ok(ctx, "drop_floating_nat", command, None).await?;
        }
        Ok(())
    }

    // ------ migration ------

    /// Launch a live migration in the background on the source host. The
    /// migration's exit code lands in a result file polled by
    /// [`query_migration`](Self::query_migration).
    pub async fn begin_migration(
        &self,
        ctx: &VerbContext,
        name: &str,
        destination: &Host,
        bandwidth_bps: Option<u64>,
        max_downtime_ms: Option<u64>,
        compressed: bool,
        copy_storage: bool,
    ) -> Result<(), Error> {
        let quoted = shell_quote(name);
        let rc_file = shell_quote(&paths::migration_rc(&self.host.vm_root, name));
        let log_file = shell_quote(&paths::migration_log(&self.host.vm_root, name));
        let uri = format!(
            "qemu+ssh://{}@{}:{}/system",
            destination.ssh_user, destination.address, destination.ssh_port
        );

        // the stale source domain is left defined; the migration
        // coordinator undefines it after the owner-host flip
        let mut migrate = format!(
            "virsh migrate {quoted} --live --persistent --verbose {}",
            shell_quote(&uri)
        );
        if let Some(bps) = bandwidth_bps {
            // virsh takes MiB/s
            let mibps = (bps / (1024 * 1024)).max(1);
            migrate.push_str(&format!(" --bandwidth {mibps}"));
        }
        if compressed {
            migrate.push_str(" --compressed");
        }
        if copy_storage {
            // local qcow2 files; the destination holds pre-created twins
            migrate.push_str(" --copy-storage-all");
        }

        let command = format!(
            "rm -f {rc_file}; nohup sh -c '{migrate}; echo $? > {rc_file}' > {log_file} 2>&1 &"
        );
        self.run_ok(ctx, "begin_migration", command, None).await?;

        if let Some(downtime) = max_downtime_ms {
            // only settable while the migration job runs; tolerate a miss
            let command = format!(
                "virsh migrate-setmaxdowntime {quoted} {downtime} 2>/dev/null || true"
            );
            self.run_ok(ctx, "begin_migration", command, None).await?;
        }

        info!(host = %self.host.id, domain = name, %uri, "migration started");
        Ok(())
    }

    /// Poll migration progress on the source host.
    pub async fn query_migration(
        &self,
        ctx: &VerbContext,
        name: &str,
    ) -> Result<MigrationProgress, Error> {
        let rc_file = paths::migration_rc(&self.host.vm_root, name);
        let log_file = paths::migration_log(&self.host.vm_root, name);
        let command = format!("cat {} 2>/dev/null", shell_quote(&rc_file));
        let out = self.run_raw(ctx, "query_migration", command, None).await?;
        if out.success() {
            let rc: i32 = out.stdout.trim().parse().unwrap_or(-1);
            if rc == 0 {
                return Ok(MigrationProgress::Completed);
            }
            let command = format!("tail -n 3 {} 2>/dev/null", shell_quote(&log_file));
            let tail = self.run_raw(ctx, "query_migration", command, None).await?;
            return Ok(MigrationProgress::Failed {
                reason: tail.stdout.trim().to_string(),
            });
        }

        let command = format!("virsh domjobinfo {}", shell_quote(name));
        let out = self.run_raw(ctx, "query_migration", command, None).await?;
        if !out.success() {
            return Ok(MigrationProgress::Starting);
        }
        match parse_domjobinfo(&out.stdout) {
            Some(percent) => Ok(MigrationProgress::Running { percent }),
            None => Ok(MigrationProgress::Starting),
        }
    }

    /// Abort an in-flight migration; fine if none is running.
    pub async fn cancel_migration(&self, ctx: &VerbContext, name: &str) -> Result<(), Error> {
        let command = format!("virsh domjobabort {} 2>/dev/null || true", shell_quote(name));
        self.run_ok(ctx, "cancel_migration", command, None).await?;
        let command = format!(
            "rm -f {}",
            shell_quote(&paths::migration_rc(&self.host.vm_root, name))
        );
        self.run_ok(ctx, "cancel_migration", command, None).await?;
        Ok(())
    }

    // ------ console ------

    /// Open the serial console socket of a domain as a byte stream.
    pub async fn open_serial_console(&self, socket_path: &str) -> Result<ConsoleStream, Error> {
        let command = format!("socat - UNIX-CONNECT:{}", shell_quote(socket_path));
        self.transport.open_stream(&command).await
    }
}

fn parse_dominfo(stdout: &str) -> DomainStatus {
    let mut state = DomainState::Other;
    let mut vcpus = None;
    let mut max_memory_kib = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "State" => {
                state = match value {
                    "running" => DomainState::Running,
                    "shut off" => DomainState::ShutOff,
                    "paused" => DomainState::Paused,
                    "crashed" => DomainState::Crashed,
                    _ => DomainState::Other,
                };
            }
            "CPU(s)" => vcpus = value.parse().ok(),
            "Max memory" => {
                max_memory_kib = value
                    .strip_suffix(" KiB")
                    .unwrap_or(value)
                    .trim()
                    .parse()
                    .ok();
            }
            _ => (),
        }
    }

    DomainStatus {
        state,
        vcpus,
        max_memory_kib,
        timestamp: vdc_api_types::time::epoch_i64(),
    }
}

fn parse_domstats(stdout: &str) -> DomainMetrics {
    let mut metrics = DomainMetrics {
        timestamp: vdc_api_types::time::epoch_i64(),
        ..Default::default()
    };
    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value: Option<u64> = value.trim().parse().ok();
        match key.trim() {
            "cpu.time" => metrics.cpu_time_ns = value,
            "balloon.current" => metrics.memory_kib = value,
            "block.0.rd.bytes" => metrics.disk_rd_bytes = value,
            "block.0.wr.bytes" => metrics.disk_wr_bytes = value,
            "net.0.rx.bytes" => metrics.net_rx_bytes = value,
            "net.0.tx.bytes" => metrics.net_tx_bytes = value,
            _ => (),
        }
    }
    metrics
}

/// Percent of migration data processed, from `virsh domjobinfo` output.
fn parse_domjobinfo(stdout: &str) -> Option<f64> {
    let mut total: Option<f64> = None;
    let mut processed: Option<f64> = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let parse = |v: &str| -> Option<f64> {
            let (num, unit) = v.split_once(' ')?;
            let num: f64 = num.parse().ok()?;
            let factor = match unit {
                "B" => 1.0,
                "KiB" => 1024.0,
                "MiB" => 1024.0 * 1024.0,
                "GiB" => 1024.0 * 1024.0 * 1024.0,
                "TiB" => 1024.0f64.powi(4),
                _ => return None,
            };
            Some(num * factor)
        };
        match key.trim() {
            "Data total" => total = parse(value),
            "Data processed" => processed = parse(value),
            _ => (),
        }
    }
    match (processed, total) {
        (Some(p), Some(t)) if t > 0.0 => Some((p / t * 100.0).min(100.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
