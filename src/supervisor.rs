//! VM Supervisor: owns one VM's state, lifecycle transitions, and the
//! ordered acquisition/cleanup of its resources.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{CleanupGuard, OrchestratorError, Result};
use crate::net::{AllocatedIp, CidAllocator, HostNetplane, IpAllocator, TapFactory, TapRecord};
use crate::subprocess::{run_cmd, run_cmd_best_effort};
use crate::vmm::{build_create_vm_request, VmConfigInputs, VmmClient};

const VMM_READY_DEADLINE: Duration = Duration::from_secs(10);
const PROCESS_REAP_TIMEOUT: Duration = Duration::from_secs(20);
const GIB: u64 = 1 << 30;
const MIN_GUEST_MEMORY_BYTES: u64 = GIB;
const MAX_GUEST_MEMORY_BYTES: u64 = 32 * GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Created => write!(f, "CREATED"),
            VmState::Running => write!(f, "RUNNING"),
            VmState::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmDescriptor {
    pub name: String,
    pub state_dir: PathBuf,
    pub vmm_socket_path: PathBuf,
    pub ip: AllocatedIp,
    pub tap: TapRecord,
    pub cid: u32,
    pub vsock_socket_path: PathBuf,
    pub stateful_disk_path: PathBuf,
    pub state: VmState,
}

/// Resources shared across every supervisor, handed in by the facade.
#[derive(Clone)]
pub struct SharedResources {
    pub config: Arc<Config>,
    pub ip_allocator: Arc<Mutex<IpAllocator>>,
    pub cid_allocator: Arc<Mutex<CidAllocator>>,
    pub tap_factory: Arc<TapFactory>,
}

struct Inner {
    descriptor: VmDescriptor,
    vmm: VmmClient,
    pid: u32,
    process: tokio::process::Child,
}

pub struct VmSupervisor {
    config: Arc<Config>,
    inner: RwLock<Inner>,
}

pub struct CreateRequest<'a> {
    pub name: &'a str,
    pub kernel: Option<&'a std::path::Path>,
    pub initramfs: Option<&'a std::path::Path>,
    pub rootfs: Option<&'a std::path::Path>,
}

impl VmSupervisor {
    /// Computes the state dir, spawns the VMM, allocates TAP/IP/CID,
    /// creates+formats the stateful disk, synthesizes and POSTs the VM
    /// config. Every acquisition is paired with a compensating release
    /// that runs, in reverse order, if any later step fails.
    #[instrument(skip(shared), fields(vm_name = req.name))]
    pub async fn create(req: CreateRequest<'_>, shared: &SharedResources) -> Result<Self> {
        if req.name.is_empty() {
            return Err(OrchestratorError::InvalidConfig("vm name must not be empty".into()));
        }

        let config = shared.config.clone();
        let kernel = req.kernel.unwrap_or(&config.kernel_path).to_path_buf();
        let initramfs = req
            .initramfs
            .map(std::path::Path::to_path_buf)
            .or_else(|| config.initramfs_path.clone());
        let rootfs = req.rootfs.unwrap_or(&config.rootfs_path).to_path_buf();

        let mut cleanup = CleanupGuard::new();

        let state_dir = config.vm_state_dir(req.name);
        fs::create_dir_all(&state_dir)
            .await
            .map_err(OrchestratorError::Io)?;
        {
            let dir = state_dir.clone();
            cleanup.push(move || async move {
                let _ = fs::remove_dir_all(&dir).await;
            });
        }

        let vmm_socket_path = state_dir.join(format!("{}.sock", req.name));
        let log_path = state_dir.join("log");
        let log_file = std::fs::File::create(&log_path).map_err(OrchestratorError::Io)?;
        let stderr_file = log_file.try_clone().map_err(OrchestratorError::Io)?;

        let mut command = Command::new(&config.vmm_binary_path);
        command
            .arg("--api-socket")
            .arg(&vmm_socket_path)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .process_group(0);

        let mut process = command.spawn().map_err(OrchestratorError::Io)?;
        let pid = process
            .id()
            .ok_or_else(|| OrchestratorError::Other("vmm process exited immediately".into()))?;
        cleanup.push(move || async move {
            kill_pid(pid);
        });

        let vmm = VmmClient::new(&vmm_socket_path);
        let cancel = tokio_util::sync::CancellationToken::new();
        if let Err(e) = vmm.wait_for_server(VMM_READY_DEADLINE, &cancel).await {
            cleanup.run().await;
            let _ = process.kill().await;
            return Err(e);
        }

        let tap = match shared.tap_factory.create(None).await {
            Ok(tap) => tap,
            Err(e) => {
                cleanup.run().await;
                return Err(e);
            }
        };
        {
            let factory = shared.tap_factory.clone();
            let record = tap.clone();
            cleanup.push(move || async move {
                run_cmd_best_effort(
                    "ip",
                    ["link", "delete", &record.name, "type", "tuntap"],
                )
                .await;
                let _ = factory;
            });
        }

        let ip = {
            let mut alloc = shared.ip_allocator.lock().await;
            match alloc.allocate() {
                Ok(ip) => ip,
                Err(e) => {
                    cleanup.run().await;
                    return Err(e);
                }
            }
        };
        {
            let allocator = shared.ip_allocator.clone();
            let addr = ip.addr;
            cleanup.push(move || async move {
                let _ = allocator.lock().await.free(addr);
            });
        }

        let cid = {
            let mut alloc = shared.cid_allocator.lock().await;
            match alloc.allocate() {
                Ok(cid) => cid,
                Err(e) => {
                    cleanup.run().await;
                    return Err(e);
                }
            }
        };
        {
            let allocator = shared.cid_allocator.clone();
            cleanup.push(move || async move {
                let _ = allocator.lock().await.free(cid);
            });
        }

        let stateful_disk_path = state_dir.join("stateful.img");
        if let Err(e) = create_stateful_disk(&stateful_disk_path, config.stateful_disk_mib).await {
            cleanup.run().await;
            return Err(e);
        }

        let vsock_socket_path = state_dir.join("vsock.sock");
        let vcpus = compute_vcpu_count();
        let memory_bytes = compute_guest_memory_bytes(config.effective_memory_percentage());

        let inputs = VmConfigInputs {
            name: req.name,
            kernel: &kernel,
            initramfs: initramfs.as_deref(),
            rootfs: &rootfs,
            stateful_disk: &stateful_disk_path,
            bridge_ip: config.bridge_ip,
            guest_ip: ip.addr,
            guest_prefix_len: ip.prefix_len,
            tap_name: &tap.name,
            vcpus,
            memory_bytes,
            cid,
            vsock_socket: &vsock_socket_path,
        };
        let create_request = build_create_vm_request(&inputs);

        if let Err(e) = vmm.create_vm(&create_request).await {
            cleanup.run().await;
            return Err(e);
        }

        // Success: discard the compensations, nothing to release.
        drop(cleanup);

        let descriptor = VmDescriptor {
            name: req.name.to_string(),
            state_dir,
            vmm_socket_path,
            ip,
            tap,
            cid,
            vsock_socket_path,
            stateful_disk_path,
            state: VmState::Created,
        };

        info!(vm_name = %descriptor.name, ip = %descriptor.ip, cid, "vm created");

        Ok(Self {
            config,
            inner: RwLock::new(Inner {
                descriptor,
                vmm,
                pid,
                process,
            }),
        })
    }

    /// Transitions CREATED -> RUNNING. Holds the per-VM write lock for the
    /// duration.
    #[instrument(skip(self))]
    pub async fn boot(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.vmm.boot_vm().await?;
        inner.descriptor.state = VmState::Running;
        Ok(())
    }

    /// Best-effort ShutdownVM (warn on failure), fatal DeleteVM/ShutdownVMM,
    /// process reap with a 20s wait then SIGKILL, iptables rule reap for
    /// the guest IP, state-dir removal. TAP/IP/CID release is the facade's
    /// job, performed only once this returns successfully.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.write().await;

        if let Err(e) = inner.vmm.shutdown_vm().await {
            warn!(vm_name = %inner.descriptor.name, error = %e, "shutdown_vm failed, continuing");
        }

        inner.vmm.delete_vm().await?;
        inner.vmm.shutdown_vmm().await?;

        reap_process(&mut inner.process, inner.pid).await;

        let prefix = inner.descriptor.ip.addr.to_string();
        if let Err(e) = HostNetplane::reap_rules_for_prefix(&prefix).await {
            warn!(vm_name = %inner.descriptor.name, error = %e, "iptables reap failed, continuing");
        }

        if let Err(e) = fs::remove_dir_all(&inner.descriptor.state_dir).await {
            warn!(vm_name = %inner.descriptor.name, error = %e, "state dir removal failed, continuing");
        }

        inner.descriptor.state = VmState::Stopped;
        Ok(())
    }

    pub async fn descriptor(&self) -> VmDescriptor {
        self.inner.read().await.descriptor.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

async fn create_stateful_disk(path: &std::path::Path, size_mib: u64) -> Result<()> {
    let size = format!("{}M", size_mib);
    run_cmd("truncate", ["-s", &size, &path.to_string_lossy()]).await?;
    run_cmd("mkfs.ext4", ["-F", &path.to_string_lossy()]).await?;
    Ok(())
}

/// `clamp(host_cpus / 2, 1, 8)`.
fn compute_vcpu_count() -> u32 {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu();
    let host_cpus = sys.cpus().len().max(1) as u32;
    (host_cpus / 2).clamp(1, 8)
}

/// `clamp(total_host_memory_kB * pct / 100, 1GiB, 32GiB)`.
fn compute_guest_memory_bytes(pct: u32) -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let total_kb = sys.total_memory();
    let bytes = total_kb.saturating_mul(1024).saturating_mul(pct as u64) / 100;
    bytes.clamp(MIN_GUEST_MEMORY_BYTES, MAX_GUEST_MEMORY_BYTES)
}

async fn reap_process(process: &mut tokio::process::Child, pid: u32) {
    kill_pid_graceful(pid);
    match tokio::time::timeout(PROCESS_REAP_TIMEOUT, process.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "vmm process did not exit in time, sending SIGKILL");
            let _ = process.kill().await;
            let _ = process.wait().await;
        }
    }
}

fn kill_pid_graceful(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

fn kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(test)]
impl VmSupervisor {
    /// Builds a supervisor around a real, short-lived inert child process
    /// and a `VmmClient` pointed at a socket nothing listens on. Used by
    /// registry tests that only need `Arc<VmSupervisor>` identities and
    /// never call `boot`/`destroy`, so spawning the real VMM binary would be
    /// pure overhead.
    pub async fn new_for_registry_test(descriptor: VmDescriptor) -> Self {
        let process = Command::new("sleep")
            .arg("300")
            .spawn()
            .expect("spawn placeholder process for test");
        let pid = process.id().expect("pid of freshly spawned process");
        Self {
            config: Arc::new(test_config()),
            inner: RwLock::new(Inner {
                descriptor,
                vmm: VmmClient::new("/tmp/microvmd-test-nonexistent.sock"),
                pid,
                process,
            }),
        }
    }
}

#[cfg(test)]
fn test_config() -> Config {
    toml::from_str(
        r#"
            bridge_ip = "10.20.1.1"
            bridge_subnet = "10.20.1.0/24"
            vmm_binary_path = "/usr/bin/cloud-hypervisor"
            kernel_path = "/var/lib/microvmd/vmlinux"
            rootfs_path = "/var/lib/microvmd/rootfs.img"
        "#,
    )
    .expect("valid test config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_count_is_clamped_between_one_and_eight() {
        let v = compute_vcpu_count();
        assert!((1..=8).contains(&v));
    }

    #[test]
    fn guest_memory_is_clamped_between_one_and_thirtytwo_gib() {
        let m = compute_guest_memory_bytes(50);
        assert!(m >= MIN_GUEST_MEMORY_BYTES);
        assert!(m <= MAX_GUEST_MEMORY_BYTES);
    }

    #[test]
    fn guest_memory_at_one_hundred_percent_is_still_capped() {
        let m = compute_guest_memory_bytes(100);
        assert!(m <= MAX_GUEST_MEMORY_BYTES);
    }
}
