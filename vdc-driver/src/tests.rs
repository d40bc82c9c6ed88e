use std::sync::Mutex;

use vdc_api_types::{error_code, Arch, ErrorCode, HostCapacity, HostHealth, PortRange};

use super::*;

/// Scripted transport: commands matching a pattern get the canned output,
/// everything else succeeds silently. All executed commands are recorded.
struct FakeExec {
    rules: Vec<(&'static str, CommandOutput)>,
    log: Mutex<Vec<String>>,
}

impl FakeExec {
    fn new(rules: Vec<(&'static str, CommandOutput)>) -> Self {
        Self {
            rules,
            log: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl Transport for &'static FakeExec {
    async fn run(
        &self,
        _ctx: &VerbContext,
        command: &str,
        _stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, Error> {
        self.log.lock().unwrap().push(command.to_string());
        for (pattern, out) in &self.rules {
            if command.contains(pattern) {
                return Ok(out.clone());
            }
        }
        Ok(ok(""))
    }

    async fn open_stream(&self, _command: &str) -> Result<ConsoleStream, Error> {
        anyhow::bail!("not supported by the fake transport");
    }
}

fn test_host() -> Host {
    Host {
        id: "h1".to_string(),
        address: "h1.example".to_string(),
        arch: Arch::X86_64,
        ssh_user: "root".to_string(),
        ssh_port: 22,
        capacity: HostCapacity {
            vcpus: 16,
            memory_mib: 32768,
            disk_bytes: 1 << 40,
        },
        allocated: HostCapacity::default(),
        health: HostHealth::Ready,
        last_heartbeat: 0,
        vm_root: "/var/lib/vdc".to_string(),
        uplink: "eth0".to_string(),
        vnc_ports: PortRange {
            start: 5900,
            end: 5999,
        },
        nat_ports: PortRange {
            start: 40000,
            end: 40999,
        },
        images: vec!["ubuntu-20.04".to_string()],
        fw_digests: Default::default(),
    }
}

fn driver(fake: &'static FakeExec) -> Driver<&'static FakeExec> {
    Driver::new(test_host(), fake, 4)
}

fn leak(fake: FakeExec) -> &'static FakeExec {
    Box::leak(Box::new(fake))
}

fn test_image() -> Image {
    Image {
        id: "ubuntu-20.04".to_string(),
        name: "Ubuntu 20.04".to_string(),
        arch: Arch::X86_64,
        sha256: "0".repeat(64),
        paths: [(
            "h1".to_string(),
            "/var/lib/vdc/images/ubuntu-20.04.qcow2".to_string(),
        )]
        .into_iter()
        .collect(),
    }
}

const DOMINFO_RUNNING: &str = "Id:             7
Name:           web-1
State:          running
CPU(s):         2
Max memory:     2097152 KiB
Used memory:    2097152 KiB
";

const DOMINFO_OFF: &str = "Name:           web-1
State:          shut off
CPU(s):         2
Max memory:     2097152 KiB
";

#[tokio::test]
async fn image_presence_is_probed() {
    let fake = leak(FakeExec::new(vec![("test -f", ok(""))]));
    let path = driver(fake)
        .ensure_image(&VerbContext::default(), &test_image())
        .await
        .unwrap();
    assert_eq!(path, "/var/lib/vdc/images/ubuntu-20.04.qcow2");

    let fake = leak(FakeExec::new(vec![("test -f", fail(1, ""))]));
    let err = driver(fake)
        .ensure_image(&VerbContext::default(), &test_image())
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::NotFound);

    // undeclared image never touches the host
    let fake = leak(FakeExec::new(vec![]));
    let mut image = test_image();
    image.paths.clear();
    let err = driver(fake)
        .ensure_image(&VerbContext::default(), &image)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::NotFound);
    assert!(fake.commands().is_empty());
}

#[tokio::test]
async fn domain_status_parses_dominfo() {
    let fake = leak(FakeExec::new(vec![("virsh dominfo", ok(DOMINFO_RUNNING))]));
    let status = driver(fake)
        .domain_status(&VerbContext::default(), "web-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, DomainState::Running);
    assert_eq!(status.vcpus, Some(2));
    assert_eq!(status.max_memory_kib, Some(2097152));

    let fake = leak(FakeExec::new(vec![(
        "virsh dominfo",
        fail(1, "error: failed to get domain 'web-1'"),
    )]));
    let status = driver(fake)
        .domain_status(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    assert!(status.is_none());
}

#[tokio::test]
async fn start_is_idempotent() {
    let fake = leak(FakeExec::new(vec![("virsh dominfo", ok(DOMINFO_RUNNING))]));
    driver(fake)
        .start_domain(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    assert!(!fake.ran("virsh start"));

    let fake = leak(FakeExec::new(vec![("virsh dominfo", ok(DOMINFO_OFF))]));
    driver(fake)
        .start_domain(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    assert!(fake.ran("virsh start web-1"));
}

#[tokio::test]
async fn stop_of_stopped_domain_is_a_noop() {
    let fake = leak(FakeExec::new(vec![("virsh dominfo", ok(DOMINFO_OFF))]));
    driver(fake)
        .stop_domain(
            &VerbContext::default(),
            "web-1",
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert!(!fake.ran("virsh shutdown"));
}

#[tokio::test]
async fn undefine_of_missing_domain_is_a_noop() {
    let fake = leak(FakeExec::new(vec![(
        "virsh dominfo",
        fail(1, "error: failed to get domain"),
    )]));
    driver(fake)
        .undefine_domain(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    assert!(!fake.ran("virsh undefine"));
}

#[tokio::test]
async fn attach_skips_present_volumes() {
    let fake = leak(FakeExec::new(vec![(
        "virsh domblklist",
        ok("Target Source\n----\nvda /var/lib/vdc/disks/x.qcow2\nvdc /var/lib/vdc/volumes/d1.qcow2\n"),
    )]));
    driver(fake)
        .attach_volume(
            &VerbContext::default(),
            "web-1",
            "/var/lib/vdc/volumes/d1.qcow2",
            "vdc",
        )
        .await
        .unwrap();
    assert!(!fake.ran("attach-disk"));

    driver(fake)
        .detach_volume(
            &VerbContext::default(),
            "web-1",
            "/var/lib/vdc/volumes/d1.qcow2",
            "vdc",
        )
        .await
        .unwrap();
    assert!(fake.ran("detach-disk"));
}

#[tokio::test]
async fn unreachable_hosts_classify_retryable() {
    let fake = leak(FakeExec::new(vec![(
        "virsh",
        fail(255, "ssh: connect to host h1.example port 22: No route to host"),
    )]));
    let err = driver(fake)
        .ping(&VerbContext::default())
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::DriverUnavailable);
    assert!(error_code(&err).is_retryable());
}

#[tokio::test]
async fn terminal_errors_classify_terminal() {
    let fake = leak(FakeExec::new(vec![(
        "virsh define",
        fail(1, "error: XML document failed to validate"),
    )]));
    let spec = DomainSpec {
        name: "web-1".to_string(),
        vm_id: Ulid::generate(),
        arch: Arch::X86_64,
        vcpus: 1,
        memory_mib: 1024,
        disks: Vec::new(),
        bridge: "vdcbr-ab12cd34".to_string(),
        mtu: 1500,
        mac: "52:54:00:00:00:01".to_string(),
        serial_socket: "/tmp/x.sock".to_string(),
        vnc_port: 5900,
        nvram_path: String::new(),
    };
    let err = driver(fake)
        .define_domain(&VerbContext::default(), &spec)
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::DriverTerminal);
    assert!(!error_code(&err).is_retryable());
}

#[tokio::test]
async fn cloudinit_iso_assembly() {
    let fake = leak(FakeExec::new(vec![]));
    let vm_id = Ulid::generate();
    let iso = driver(fake)
        .build_cloudinit_iso(&VerbContext::default(), vm_id, "#cloud-config\n{}", "instance-id: x\n")
        .await
        .unwrap();
    assert_eq!(iso, format!("/var/lib/vdc/disks/{vm_id}-cidata.iso"));
    assert!(fake.ran("genisoimage"));
    assert!(fake.ran("-volid cidata"));
    assert!(fake.ran("user-data"));
}

#[tokio::test]
async fn network_define_is_probe_first() {
    let fake = leak(FakeExec::new(vec![]));
    let cidr: vdc_api_types::Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
    let vpc = Vpc {
        name: "v1".to_string(),
        cidr,
        subnets: Vec::new(),
        gateway: cidr.gateway(),
        mtu: 1500,
        chain: "ab12cd34".to_string(),
        created_at: 0,
    };
    driver(fake)
        .define_network(&VerbContext::default(), &vpc)
        .await
        .unwrap();

    let commands = fake.commands().join("\n");
    assert!(commands.contains("ip link show vdcbr-ab12cd34"));
    assert!(commands.contains("ip addr replace 10.0.0.1/24 dev vdcbr-ab12cd34"));
    assert!(commands.contains("-j MASQUERADE"));
    assert!(commands.contains("iptables -N vdc-ab12cd34-in"));
    assert!(commands.contains("FORWARD -o vdcbr-ab12cd34 -j vdc-ab12cd34-in"));
}

#[tokio::test]
async fn migration_query_states() {
    // no rc file, no job yet
    let fake = leak(FakeExec::new(vec![
        ("cat /var/lib/vdc/run/migrate-web-1.rc", fail(1, "")),
        ("virsh domjobinfo", fail(1, "error: Operation not supported")),
    ]));
    let progress = driver(fake)
        .query_migration(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    assert_eq!(progress, MigrationProgress::Starting);

    // running job reports percent
    let fake = leak(FakeExec::new(vec![
        ("cat /var/lib/vdc/run/migrate-web-1.rc", fail(1, "")),
        (
            "virsh domjobinfo",
            ok("Job type:         Unbounded\nData processed:   512.000 MiB\nData total:       1.000 GiB\n"),
        ),
    ]));
    let progress = driver(fake)
        .query_migration(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    match progress {
        MigrationProgress::Running { percent } => assert!((percent - 50.0).abs() < 0.01),
        other => panic!("expected running, got {other:?}"),
    }

    // rc file decides the outcome
    let fake = leak(FakeExec::new(vec![(
        "cat /var/lib/vdc/run/migrate-web-1.rc",
        ok("0\n"),
    )]));
    let progress = driver(fake)
        .query_migration(&VerbContext::default(), "web-1")
        .await
        .unwrap();
    assert_eq!(progress, MigrationProgress::Completed);
}

#[test]
fn domstats_parsing() {
    let stats = "Domain: 'web-1'
  state.state=1
  cpu.time=905400000000
  balloon.current=2097152
  block.count=2
  block.0.rd.bytes=123456
  block.0.wr.bytes=654321
  net.count=1
  net.0.rx.bytes=111
  net.0.tx.bytes=222
";
    let metrics = parse_domstats(stats);
    assert_eq!(metrics.cpu_time_ns, Some(905400000000));
    assert_eq!(metrics.memory_kib, Some(2097152));
    assert_eq!(metrics.disk_rd_bytes, Some(123456));
    assert_eq!(metrics.net_tx_bytes, Some(222));
}
