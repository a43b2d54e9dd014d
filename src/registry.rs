//! VM Registry: process-wide mapping from VM name to supervisor, plus a
//! reverse CID -> name index.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};
use crate::supervisor::VmSupervisor;

#[derive(Default)]
pub struct VmRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Arc<VmSupervisor>>,
    name_by_cid: HashMap<u32, String>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a supervisor under `name`. Only ever called after the VM
    /// has been successfully created (and, from the facade's perspective,
    /// after boot) so listing only ever reflects successfully-created VMs.
    pub async fn insert(&self, name: String, cid: u32, supervisor: Arc<VmSupervisor>) {
        let mut inner = self.inner.write().await;
        inner.by_name.insert(name.clone(), supervisor);
        inner.name_by_cid.insert(cid, name);
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<VmSupervisor>> {
        let mut inner = self.inner.write().await;
        let supervisor = inner.by_name.remove(name)?;
        inner.name_by_cid.retain(|_, n| n != name);
        Some(supervisor)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<VmSupervisor>> {
        self.inner.read().await.by_name.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.by_name.contains_key(name)
    }

    pub async fn name_for_cid(&self, cid: u32) -> Option<String> {
        self.inner.read().await.name_by_cid.get(&cid).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner.read().await.by_name.keys().cloned().collect()
    }

    pub async fn require(&self, name: &str) -> Result<Arc<VmSupervisor>> {
        self.get(name)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{AllocatedIp, TapRecord};
    use crate::supervisor::{VmDescriptor, VmState};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn descriptor_sample(name: &str, cid: u32) -> VmDescriptor {
        VmDescriptor {
            name: name.to_string(),
            state_dir: PathBuf::from("/tmp/x"),
            vmm_socket_path: PathBuf::from("/tmp/x.sock"),
            ip: AllocatedIp {
                addr: Ipv4Addr::new(10, 20, 1, 2),
                prefix_len: 24,
            },
            tap: TapRecord {
                name: "mtap0".to_string(),
                mac: "00:00:00:00:00:00".to_string(),
            },
            cid,
            vsock_socket_path: PathBuf::from("/tmp/vsock.sock"),
            stateful_disk_path: PathBuf::from("/tmp/stateful.img"),
            state: VmState::Running,
        }
    }

    #[tokio::test]
    async fn start_then_destroy_round_trips_through_list() {
        let registry = VmRegistry::new();
        let descriptor = descriptor_sample("a", 3);
        let supervisor = Arc::new(VmSupervisor::new_for_registry_test(descriptor).await);

        registry.insert("a".to_string(), 3, supervisor).await;
        assert_eq!(registry.names().await, vec!["a".to_string()]);
        assert!(registry.contains("a").await);
        assert_eq!(registry.name_for_cid(3).await.as_deref(), Some("a"));

        registry.remove("a").await;
        assert!(registry.names().await.is_empty());
        assert!(!registry.contains("a").await);
        assert_eq!(registry.name_for_cid(3).await, None);
    }

    #[tokio::test]
    async fn require_fails_with_not_found_for_unknown_name() {
        let registry = VmRegistry::new();
        let err = registry.require("ghost").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn cid_reverse_index_tracks_only_the_current_occupant() {
        let registry = VmRegistry::new();
        let a = Arc::new(VmSupervisor::new_for_registry_test(descriptor_sample("a", 5)).await);
        registry.insert("a".to_string(), 5, a).await;
        registry.remove("a").await;

        let b = Arc::new(VmSupervisor::new_for_registry_test(descriptor_sample("b", 5)).await);
        registry.insert("b".to_string(), 5, b).await;
        assert_eq!(registry.name_for_cid(5).await.as_deref(), Some("b"));
    }
}
