//! VMM create-VM payload synthesis.
//!
//! Pure data + a builder function; no I/O.

use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct Payload {
    pub kernel: PathBuf,
    pub cmdline: String,
    pub initramfs: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct Disk {
    pub path: PathBuf,
    pub readonly: bool,
    pub num_queues: u32,
}

#[derive(Debug, Serialize)]
pub struct Cpus {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
}

#[derive(Debug, Serialize)]
pub struct Memory {
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct Serial {
    pub mode: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Console {
    pub mode: &'static str,
}

#[derive(Debug, Serialize)]
pub struct NetDevice {
    pub tap: String,
    pub num_queues: u32,
    pub queue_size: u32,
    pub id: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Vsock {
    pub cid: u32,
    pub socket: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct CreateVmRequest {
    pub payload: Payload,
    pub disks: Vec<Disk>,
    pub cpus: Cpus,
    pub memory: Memory,
    pub serial: Serial,
    pub console: Console,
    pub net: Vec<NetDevice>,
    pub vsock: Vsock,
}

/// Inputs needed to synthesize a [`CreateVmRequest`]. Everything here is
/// already-resolved, host-absolute data — no allocation happens in this
/// module, that's the supervisor's job.
pub struct VmConfigInputs<'a> {
    pub name: &'a str,
    pub kernel: &'a Path,
    pub initramfs: Option<&'a Path>,
    pub rootfs: &'a Path,
    pub stateful_disk: &'a Path,
    pub bridge_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_prefix_len: u8,
    pub tap_name: &'a str,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub cid: u32,
    pub vsock_socket: &'a Path,
}

pub fn build_create_vm_request(inputs: &VmConfigInputs<'_>) -> CreateVmRequest {
    let cmdline = format!(
        "console=ttyS0 gateway_ip=\"{}\" guest_ip=\"{}/{}\" vm_name=\"{}\"",
        inputs.bridge_ip, inputs.guest_ip, inputs.guest_prefix_len, inputs.name
    );

    CreateVmRequest {
        payload: Payload {
            kernel: inputs.kernel.to_path_buf(),
            cmdline,
            initramfs: inputs.initramfs.map(Path::to_path_buf),
        },
        disks: vec![
            Disk {
                path: inputs.rootfs.to_path_buf(),
                readonly: true,
                num_queues: inputs.vcpus,
            },
            Disk {
                path: inputs.stateful_disk.to_path_buf(),
                readonly: false,
                num_queues: inputs.vcpus,
            },
        ],
        cpus: Cpus {
            boot_vcpus: inputs.vcpus,
            max_vcpus: inputs.vcpus,
        },
        memory: Memory {
            size: inputs.memory_bytes,
        },
        serial: Serial { mode: "Tty" },
        console: Console { mode: "Off" },
        net: vec![NetDevice {
            tap: inputs.tap_name.to_string(),
            num_queues: 2,
            queue_size: 256,
            id: "_net0",
        }],
        vsock: Vsock {
            cid: inputs.cid,
            socket: inputs.vsock_socket.to_path_buf(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_carries_gateway_guest_and_name() {
        let inputs = VmConfigInputs {
            name: "demo",
            kernel: Path::new("/k"),
            initramfs: None,
            rootfs: Path::new("/r"),
            stateful_disk: Path::new("/s"),
            bridge_ip: "10.20.1.1".parse().unwrap(),
            guest_ip: "10.20.1.2".parse().unwrap(),
            guest_prefix_len: 24,
            tap_name: "mtap0",
            vcpus: 2,
            memory_bytes: 1 << 30,
            cid: 3,
            vsock_socket: Path::new("/v"),
        };
        let req = build_create_vm_request(&inputs);
        assert_eq!(
            req.payload.cmdline,
            "console=ttyS0 gateway_ip=\"10.20.1.1\" guest_ip=\"10.20.1.2/24\" vm_name=\"demo\""
        );
        assert_eq!(req.disks.len(), 2);
        assert!(req.disks[0].readonly);
        assert!(!req.disks[1].readonly);
        assert_eq!(req.cpus.boot_vcpus, req.cpus.max_vcpus);
        assert_eq!(req.net[0].id, "_net0");
        assert_eq!(req.vsock.cid, 3);
    }
}
