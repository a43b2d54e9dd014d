//! Server Facade: coordinates the Registry, Netplane, allocators, and
//! Session Manager to serve Start/DestroyOne/DestroyAll/ListAll/ListOne/
//! Exec/RouteCallback — the one surface the HTTP layer talks to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::guest_client::GuestClient;
use crate::net::{CidAllocator, HostNetplane, IpAllocator, TapFactory};
use crate::registry::VmRegistry;
use crate::session::SessionManager;
use crate::supervisor::{CreateRequest, SharedResources, VmState, VmSupervisor};

#[derive(Debug, Clone, Serialize)]
pub struct VmView {
    #[serde(rename = "vmName")]
    pub name: String,
    pub ip: String,
    pub status: String,
    #[serde(rename = "tapDeviceName")]
    pub tap_device_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub output: String,
    pub error: String,
}

/// Parameters for [`ServerFacade::start`]. Unset path fields fall back to
/// `Config`'s own kernel/initramfs/rootfs.
pub struct StartRequest {
    pub name: String,
    pub kernel: Option<PathBuf>,
    pub initramfs: Option<PathBuf>,
    pub rootfs: Option<PathBuf>,
    pub callback_url: Option<String>,
}

pub struct ServerFacade {
    config: Arc<Config>,
    registry: VmRegistry,
    sessions: SessionManager,
    guest_client: GuestClient,
    ip_allocator: Arc<Mutex<IpAllocator>>,
    cid_allocator: Arc<Mutex<CidAllocator>>,
    tap_factory: Arc<TapFactory>,
}

impl ServerFacade {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let ip_allocator = IpAllocator::new(&config.bridge_subnet, config.bridge_ip)?;
        let cid_allocator = CidAllocator::new(config.cid_low, config.cid_high)?;
        let tap_factory = TapFactory::new(config.bridge_name.clone(), config.tap_prefix.clone());

        Ok(Self {
            config,
            registry: VmRegistry::new(),
            sessions: SessionManager::new(),
            guest_client: GuestClient::new(),
            ip_allocator: Arc::new(Mutex::new(ip_allocator)),
            cid_allocator: Arc::new(Mutex::new(cid_allocator)),
            tap_factory: Arc::new(tap_factory),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Since VM state is never persisted across restarts, a cold start
    /// instead tears down every TAP interface and the bridge, reaps iptables
    /// rules for the configured IP prefix, and only then runs one-shot
    /// netplane preparation — making a restart equivalent to a clean host.
    pub async fn prepare_host_network(&self, backup_path: &Path) -> Result<()> {
        self.tap_factory.cleanup_all().await;
        HostNetplane::cleanup_bridge(&self.config.bridge_name).await?;
        HostNetplane::reap_rules_for_prefix(&ip_prefix_of(&self.config.bridge_subnet)).await?;
        HostNetplane::prepare(
            backup_path,
            &self.config.bridge_name,
            self.config.bridge_ip,
            &self.config.bridge_subnet,
        )
        .await
    }

    fn shared(&self) -> SharedResources {
        SharedResources {
            config: self.config.clone(),
            ip_allocator: self.ip_allocator.clone(),
            cid_allocator: self.cid_allocator.clone(),
            tap_factory: self.tap_factory.clone(),
        }
    }

    /// If a descriptor already exists for `req.name`, just boots it.
    /// Otherwise creates then boots. A boot failure after a *fresh create*
    /// runs a shutdown cleanup so the VM isn't left half-registered; a boot
    /// failure against an already-registered VM (e.g. a re-`Start` racing a
    /// running guest) is surfaced as-is without tearing down a VM this call
    /// didn't create. After boot, polls the guest command server for
    /// readiness (non-fatal).
    #[instrument(skip(self, req), fields(vm_name = %req.name))]
    pub async fn start(&self, req: StartRequest) -> Result<VmView> {
        if req.name.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "vm name must not be empty".to_string(),
            ));
        }

        let (supervisor, freshly_created) = if let Some(existing) =
            self.registry.get(&req.name).await
        {
            (existing, false)
        } else {
            let create_req = CreateRequest {
                name: &req.name,
                kernel: req.kernel.as_deref(),
                initramfs: req.initramfs.as_deref(),
                rootfs: req.rootfs.as_deref(),
            };
            let supervisor = VmSupervisor::create(create_req, &self.shared()).await?;
            let descriptor = supervisor.descriptor().await;
            let supervisor = Arc::new(supervisor);
            self.registry
                .insert(descriptor.name.clone(), descriptor.cid, supervisor.clone())
                .await;
            (supervisor, true)
        };

        if let Err(e) = supervisor.boot().await {
            if freshly_created {
                warn!(vm_name = %req.name, error = %e, "boot failed after create, rolling back");
                if let Some(sup) = self.registry.remove(&req.name).await {
                    let _ = sup.destroy().await;
                    self.release_resources(&sup).await;
                }
            } else {
                warn!(vm_name = %req.name, error = %e, "boot failed against an already-registered vm, leaving it in place");
            }
            return Err(e);
        }

        if let Some(url) = req.callback_url {
            self.sessions.register(&req.name, url).await;
        }

        let descriptor = supervisor.descriptor().await;
        if !self.guest_client.wait_until_ready(descriptor.ip.addr).await {
            warn!(vm_name = %req.name, "guest command server never became ready");
        }

        info!(vm_name = %req.name, ip = %descriptor.ip, "vm started");
        Ok(view_of(&descriptor))
    }

    /// Destroys and unregisters a single VM, then frees its TAP/IP/CID in
    /// that order. A `destroy()` failure leaves the descriptor registered
    /// so the operator can retry.
    #[instrument(skip(self))]
    pub async fn destroy_one(&self, name: &str) -> Result<()> {
        let supervisor = self.registry.require(name).await?;
        supervisor.destroy().await?;
        self.registry.remove(name).await;
        self.release_resources(&supervisor).await;
        self.sessions.remove(name).await;
        Ok(())
    }

    /// Snapshots the set of names under a read lock, destroys each, and
    /// joins any errors. Successfully-destroyed VMs are removed from the
    /// registry; VMs whose destroy failed remain for a future retry.
    #[instrument(skip(self))]
    pub async fn destroy_all(&self) -> Result<()> {
        let names = self.registry.names().await;
        let mut errors = Vec::new();
        for name in names {
            if let Err(e) = self.destroy_one(&name).await {
                warn!(vm_name = %name, error = %e, "destroy failed, vm remains registered");
                errors.push(format!("{name}: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Other(errors.join("; ")))
        }
    }

    async fn release_resources(&self, supervisor: &VmSupervisor) {
        let descriptor = supervisor.descriptor().await;
        let _ = self.tap_factory.destroy(&descriptor.tap).await;
        let _ = self.ip_allocator.lock().await.free(descriptor.ip.addr);
        let _ = self.cid_allocator.lock().await.free(descriptor.cid);
    }

    pub async fn list_all(&self) -> Vec<VmView> {
        let mut views = Vec::new();
        for name in self.registry.names().await {
            if let Some(supervisor) = self.registry.get(&name).await {
                views.push(view_of(&supervisor.descriptor().await));
            }
        }
        views
    }

    pub async fn list_one(&self, name: &str) -> Result<VmView> {
        let supervisor = self.registry.require(name).await?;
        Ok(view_of(&supervisor.descriptor().await))
    }

    #[instrument(skip(self))]
    pub async fn exec(&self, name: &str, cmd: &str, blocking: bool) -> Result<ExecOutcome> {
        let supervisor = self.registry.require(name).await?;
        let descriptor = supervisor.descriptor().await;
        let resp = self
            .guest_client
            .exec(descriptor.ip.addr, cmd, blocking)
            .await?;
        Ok(ExecOutcome {
            output: resp.output,
            error: resp.error,
        })
    }

    /// Delegates to the Session Manager.
    pub async fn route_callback(&self, vm_name: &str, method: &str, params: Value) -> Result<Value> {
        self.sessions.route(vm_name, method, params).await
    }

    /// Registers a callback session directly, bypassing `start()`. Used by
    /// HTTP-layer tests that exercise callback routing without spinning up
    /// a real VMM.
    #[cfg(test)]
    pub async fn start_test_session(&self, vm_name: &str, url: String) {
        self.sessions.register(vm_name, url).await;
    }
}

fn view_of(descriptor: &crate::supervisor::VmDescriptor) -> VmView {
    let status = match descriptor.state {
        VmState::Created => "CREATED",
        VmState::Running => "RUNNING",
        VmState::Stopped => "STOPPED",
    };
    VmView {
        name: descriptor.name.clone(),
        ip: descriptor.ip.addr.to_string(),
        status: status.to_string(),
        tap_device_name: descriptor.tap.name.clone(),
    }
}

fn ip_prefix_of(bridge_subnet: &str) -> String {
    bridge_subnet
        .split('/')
        .next()
        .unwrap_or(bridge_subnet)
        .rsplit_once('.')
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_else(|| bridge_subnet.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_prefix_of_strips_mask_and_last_octet() {
        assert_eq!(ip_prefix_of("10.20.1.0/24"), "10.20.1");
    }
}
