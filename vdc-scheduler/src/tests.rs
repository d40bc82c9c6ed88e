use super::*;

use vdc_api_types::{error_code, ErrorCode, HostCapacity, PortRange, PowerState, VmStatus};

fn host(id: &str, vcpus: u32, memory_mib: u64) -> Host {
    Host {
        id: id.to_string(),
        address: format!("{id}.example"),
        arch: Arch::X86_64,
        ssh_user: "root".to_string(),
        ssh_port: 22,
        capacity: HostCapacity {
            vcpus,
            memory_mib,
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

fn vm(name: &str, host: &str, vcpus: u32, memory_mib: u64, tag: Option<&str>) -> VmRecord {
    VmRecord {
        id: Ulid::generate(),
        name: name.to_string(),
        host: Some(host.to_string()),
        image: "ubuntu-20.04".to_string(),
        arch: Arch::X86_64,
        vcpus,
        memory_mib,
        root_disk_gb: 10,
        vpc: "v1".to_string(),
        disks: Vec::new(),
        nics: Vec::new(),
        desired_power: PowerState::On,
        observed_power: PowerState::On,
        status: VmStatus::Running,
        cloud_init: None,
        ssh_nat_port: None,
        vnc_port: None,
        serial_socket: None,
        floating_ip: None,
        anti_affinity: tag.map(str::to_string),
        client_token: None,
        generation: 1,
        created_at: 0,
        last_error: None,
    }
}

fn requirements() -> VmRequirements {
    VmRequirements {
        arch: Arch::X86_64,
        vcpus: 2,
        memory_mib: 2048,
        disk_bytes: 10 << 30,
        image: "ubuntu-20.04".to_string(),
        anti_affinity: None,
        vm_id: None,
    }
}

#[test]
fn prefers_the_emptier_host() {
    let hosts = [host("h1", 16, 32768), host("h2", 16, 32768)];
    let vms = [vm("busy", "h1", 8, 16384, None)];

    let chosen = schedule(&hosts, &vms, &requirements()).unwrap();
    assert_eq!(chosen, "h2");
}

#[test]
fn ties_break_on_vm_count_then_id() {
    let hosts = [host("h2", 16, 32768), host("h1", 16, 32768)];

    // equal usage, equal count: lexicographic id
    let chosen = schedule(&hosts, &[], &requirements()).unwrap();
    assert_eq!(chosen, "h1");

    // equal free ratios but one stopped VM on h1 (still allocated):
    // identical score, h2 has fewer active VMs
    let vms = [
        vm("a", "h1", 2, 2048, None),
        vm("b", "h1", 2, 2048, None),
        vm("c", "h2", 4, 4096, None),
    ];
    let chosen = schedule(&hosts, &vms, &requirements()).unwrap();
    assert_eq!(chosen, "h2");
}

#[test]
fn filters_arch_and_image() {
    let mut arm = host("arm1", 16, 32768);
    arm.arch = Arch::Aarch64;
    let mut bare = host("bare1", 16, 32768);
    bare.images.clear();
    let hosts = [arm, bare];

    let err = schedule(&hosts, &[], &requirements()).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Exhausted);
    assert!(err.to_string().starts_with("unschedulable"));
}

#[test]
fn respects_capacity_headroom() {
    // 10 vcpus with 10% headroom leaves 9 schedulable
    let hosts = [host("h1", 10, 102400)];
    let vms = [vm("big", "h1", 8, 8192, None)];

    let mut req = requirements();
    req.vcpus = 2;
    let err = schedule(&hosts, &vms, &req).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Exhausted);

    req.vcpus = 1;
    assert_eq!(schedule(&hosts, &vms, &req).unwrap(), "h1");
}

#[test]
fn unhealthy_hosts_are_skipped() {
    let mut down = host("h1", 16, 32768);
    down.health = HostHealth::Unreachable;
    let hosts = [down, host("h2", 16, 32768)];

    assert_eq!(schedule(&hosts, &[], &requirements()).unwrap(), "h2");
}

#[test]
fn terminated_vms_free_their_capacity() {
    let hosts = [host("h1", 4, 4096)];
    let mut gone = vm("gone", "h1", 4, 4096, None);
    gone.status = VmStatus::Terminated;

    assert_eq!(schedule(&hosts, &[gone], &requirements()).unwrap(), "h1");
}

#[test]
fn anti_affinity_is_strict() {
    let hosts = [host("h1", 16, 32768), host("h2", 16, 32768)];
    let vms = [
        vm("a", "h1", 1, 1024, Some("web")),
        vm("b", "h2", 1, 1024, Some("web")),
    ];

    let mut req = requirements();
    req.anti_affinity = Some("web".to_string());
    let err = schedule(&hosts, &vms, &req).unwrap_err();
    assert_eq!(error_code(&err), ErrorCode::Exhausted);
    assert!(err.to_string().starts_with("insufficient_capacity"));

    // a different tag is not blocked
    req.anti_affinity = Some("db".to_string());
    schedule(&hosts, &vms, &req).unwrap();

    // one tag-free host exists: it is the only candidate
    let vms = [vm("a", "h1", 1, 1024, Some("web"))];
    req.anti_affinity = Some("web".to_string());
    assert_eq!(schedule(&hosts, &vms, &req).unwrap(), "h2");
}

#[test]
fn rescheduling_skips_own_usage() {
    let hosts = [host("h1", 4, 4096)];
    let existing = vm("self", "h1", 3, 3072, None);

    let mut req = requirements();
    req.vcpus = 3;
    req.memory_mib = 3072;
    req.vm_id = Some(existing.id);
    assert_eq!(schedule(&hosts, &[existing], &req).unwrap(), "h1");
}
