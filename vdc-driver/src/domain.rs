//! Libvirt domain XML generation.
//!
//! The XML is assembled by hand: the layout is fixed and small, and keeping
//! it in one place makes the arch differences (SeaBIOS machine `q35` for
//! x86_64, UEFI/AAVMF `virt` for aarch64) easy to audit. All values derive
//! deterministically from the VM record, so re-generating the XML for an
//! unchanged VM yields identical bytes and `virsh define` stays idempotent.

use std::fmt::Write;

use vdc_api_types::{Arch, Ulid};

const AAVMF_CODE: &str = "/usr/share/AAVMF/AAVMF_CODE.fd";

/// One disk of a domain, in slot order.
pub struct DomainDisk {
    pub path: String,
    /// `vda`, `vdb`, ...
    pub device: String,
    /// qcow2 for volumes, raw for the cloud-init ISO.
    pub format: &'static str,
    pub read_only: bool,
}

/// Everything the XML builder needs; assembled by the reconciler from the
/// VM record, its VPC and the owner host.
pub struct DomainSpec {
    pub name: String,
    pub vm_id: Ulid,
    pub arch: Arch,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disks: Vec<DomainDisk>,
    pub bridge: String,
    pub mtu: u32,
    pub mac: String,
    pub serial_socket: String,
    pub vnc_port: u16,
    pub nvram_path: String,
}

/// Deterministic MAC for a VM NIC: the QEMU OUI plus three entropy bytes of
/// the VM id.
pub fn mac_for(id: &Ulid) -> String {
    let bytes = id.as_bytes();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[6], bytes[7], bytes[8]
    )
}

/// Stable libvirt UUID derived from the VM id bytes.
pub fn uuid_for(id: &Ulid) -> String {
    let b = id.as_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
        b[14], b[15]
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Render the full domain XML.
pub fn build_xml(spec: &DomainSpec) -> String {
    let mut xml = String::with_capacity(4096);

    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", xml_escape(&spec.name));
    let _ = writeln!(xml, "  <uuid>{}</uuid>", uuid_for(&spec.vm_id));
    let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", spec.memory_mib);
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus);

    match spec.arch {
        Arch::X86_64 => {
            // SeaBIOS is the q35 default, no loader element needed
            let _ = writeln!(xml, "  <os>");
            let _ = writeln!(xml, "    <type arch='x86_64' machine='q35'>hvm</type>");
            let _ = writeln!(xml, "    <boot dev='hd'/>");
            let _ = writeln!(xml, "  </os>");
            let _ = writeln!(xml, "  <features>");
            let _ = writeln!(xml, "    <acpi/>");
            let _ = writeln!(xml, "    <apic/>");
            let _ = writeln!(xml, "  </features>");
        }
        Arch::Aarch64 => {
            let _ = writeln!(xml, "  <os>");
            let _ = writeln!(xml, "    <type arch='aarch64' machine='virt'>hvm</type>");
            let _ = writeln!(
                xml,
                "    <loader readonly='yes' type='pflash'>{AAVMF_CODE}</loader>"
            );
            let _ = writeln!(
                xml,
                "    <nvram>{}</nvram>",
                xml_escape(&spec.nvram_path)
            );
            let _ = writeln!(xml, "    <boot dev='hd'/>");
            let _ = writeln!(xml, "  </os>");
            let _ = writeln!(xml, "  <features>");
            let _ = writeln!(xml, "    <acpi/>");
            let _ = writeln!(xml, "    <gic version='3'/>");
            let _ = writeln!(xml, "  </features>");
        }
    }

    let _ = writeln!(xml, "  <cpu mode='host-passthrough'/>");
    let _ = writeln!(xml, "  <clock offset='utc'/>");
    let _ = writeln!(xml, "  <on_poweroff>destroy</on_poweroff>");
    let _ = writeln!(xml, "  <on_reboot>restart</on_reboot>");
    let _ = writeln!(xml, "  <on_crash>destroy</on_crash>");
    let _ = writeln!(xml, "  <devices>");

    let emulator = match spec.arch {
        Arch::X86_64 => "/usr/bin/qemu-system-x86_64",
        Arch::Aarch64 => "/usr/bin/qemu-system-aarch64",
    };
    let _ = writeln!(xml, "    <emulator>{emulator}</emulator>");

    for disk in &spec.disks {
        let _ = writeln!(xml, "    <disk type='file' device='disk'>");
        let _ = writeln!(
            xml,
            "      <driver name='qemu' type='{}'/>",
            disk.format
        );
        let _ = writeln!(xml, "      <source file='{}'/>", xml_escape(&disk.path));
        let _ = writeln!(
            xml,
            "      <target dev='{}' bus='virtio'/>",
            disk.device
        );
        if disk.read_only {
            let _ = writeln!(xml, "      <readonly/>");
        }
        let _ = writeln!(xml, "    </disk>");
    }

    let _ = writeln!(xml, "    <interface type='bridge'>");
    let _ = writeln!(xml, "      <source bridge='{}'/>", xml_escape(&spec.bridge));
    let _ = writeln!(xml, "      <mac address='{}'/>", spec.mac);
    let _ = writeln!(xml, "      <model type='virtio'/>");
    let _ = writeln!(xml, "      <mtu size='{}'/>", spec.mtu);
    let _ = writeln!(xml, "    </interface>");

    let _ = writeln!(xml, "    <serial type='unix'>");
    let _ = writeln!(
        xml,
        "      <source mode='bind' path='{}'/>",
        xml_escape(&spec.serial_socket)
    );
    let _ = writeln!(xml, "      <target port='0'/>");
    let _ = writeln!(xml, "    </serial>");
    let _ = writeln!(xml, "    <console type='unix'>");
    let _ = writeln!(
        xml,
        "      <source mode='bind' path='{}'/>",
        xml_escape(&spec.serial_socket)
    );
    let _ = writeln!(xml, "      <target type='serial' port='0'/>");
    let _ = writeln!(xml, "    </console>");

    let _ = writeln!(
        xml,
        "    <graphics type='vnc' port='{}' autoport='no' listen='127.0.0.1'/>",
        spec.vnc_port
    );

    let _ = writeln!(xml, "    <memballoon model='virtio'/>");
    let _ = writeln!(xml, "    <rng model='virtio'>");
    let _ = writeln!(xml, "      <backend model='random'>/dev/urandom</backend>");
    let _ = writeln!(xml, "    </rng>");
    let _ = writeln!(xml, "  </devices>");
    let _ = writeln!(xml, "</domain>");

    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(arch: Arch) -> DomainSpec {
        DomainSpec {
            name: "web-1".to_string(),
            vm_id: Ulid::from(*b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10"),
            arch,
            vcpus: 2,
            memory_mib: 2048,
            disks: vec![
                DomainDisk {
                    path: "/var/lib/vdc/disks/root.qcow2".to_string(),
                    device: "vda".to_string(),
                    format: "qcow2",
                    read_only: false,
                },
                DomainDisk {
                    path: "/var/lib/vdc/disks/cidata.iso".to_string(),
                    device: "vdb".to_string(),
                    format: "raw",
                    read_only: true,
                },
            ],
            bridge: "vdcbr-ab12cd34".to_string(),
            mtu: 1500,
            mac: mac_for(&Ulid::from(
                *b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10",
            )),
            serial_socket: "/var/lib/vdc/consoles/web-1.sock".to_string(),
            vnc_port: 5901,
            nvram_path: "/var/lib/vdc/nvram/web-1.fd".to_string(),
        }
    }

    #[test]
    fn deterministic_mac_and_uuid() {
        let id = Ulid::generate();
        assert_eq!(mac_for(&id), mac_for(&id));
        assert!(mac_for(&id).starts_with("52:54:00:"));
        assert_eq!(uuid_for(&id).len(), 36);
    }

    #[test]
    fn x86_64_uses_seabios_q35() {
        let xml = build_xml(&spec(Arch::X86_64));
        assert!(xml.contains("<type arch='x86_64' machine='q35'>hvm</type>"));
        assert!(!xml.contains("<loader"));
        assert!(xml.contains("/usr/bin/qemu-system-x86_64"));
    }

    #[test]
    fn aarch64_uses_uefi_virt() {
        let xml = build_xml(&spec(Arch::Aarch64));
        assert!(xml.contains("<type arch='aarch64' machine='virt'>hvm</type>"));
        assert!(xml.contains(AAVMF_CODE));
        assert!(xml.contains("<nvram>/var/lib/vdc/nvram/web-1.fd</nvram>"));
    }

    #[test]
    fn devices_are_wired() {
        let xml = build_xml(&spec(Arch::X86_64));
        assert!(xml.contains("<source bridge='vdcbr-ab12cd34'/>"));
        assert!(xml.contains("<mac address='52:54:00:07:08:09'/>"));
        assert!(xml.contains("<source mode='bind' path='/var/lib/vdc/consoles/web-1.sock'/>"));
        assert!(xml.contains("<graphics type='vnc' port='5901'"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let one = build_xml(&spec(Arch::X86_64));
        let two = build_xml(&spec(Arch::X86_64));
        assert_eq!(one, two);
    }
}
