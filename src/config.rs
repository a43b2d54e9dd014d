//! Configuration snapshot loaded once at startup from a TOML file.
//!
//! The lifecycle core (supervisor, facade, netplane) only ever sees a
//! `&Config`; it never touches the filesystem or CLI itself.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/microvmd")
}

fn default_bridge_name() -> String {
    "microvmbr0".to_string()
}

fn default_tap_prefix() -> String {
    "mtap".to_string()
}

fn default_stateful_disk_mib() -> u64 {
    1024
}

fn default_memory_percentage() -> u32 {
    50
}

fn default_cid_low() -> u32 {
    3
}

fn default_cid_high() -> u32 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,
    pub bridge_ip: Ipv4Addr,
    pub bridge_subnet: String,
    #[serde(default = "default_tap_prefix")]
    pub tap_prefix: String,

    pub vmm_binary_path: PathBuf,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub initramfs_path: Option<PathBuf>,

    #[serde(default = "default_stateful_disk_mib")]
    pub stateful_disk_mib: u64,

    /// Percentage of host memory to give each guest, 1-100. Out-of-range
    /// values collapse to 50.
    #[serde(default = "default_memory_percentage")]
    pub memory_percentage: i64,

    #[serde(default = "default_cid_low")]
    pub cid_low: u32,
    #[serde(default = "default_cid_high")]
    pub cid_high: u32,

    #[serde(default)]
    pub firewall_backup_path: Option<PathBuf>,
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "reading configuration file");
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(OrchestratorError::Io)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bridge_subnet.parse::<ipnet::Ipv4Net>().is_err() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "bridge_subnet `{}` is not a valid CIDR",
                self.bridge_subnet
            )));
        }
        if self.cid_low > self.cid_high {
            return Err(OrchestratorError::InvalidConfig(
                "cid_low must be <= cid_high".to_string(),
            ));
        }
        Ok(())
    }

    /// Memory percentage clamped to a valid (0, 100] range, defaulting to
    /// 50 when out of range.
    pub fn effective_memory_percentage(&self) -> u32 {
        if self.memory_percentage > 0 && self.memory_percentage <= 100 {
            self.memory_percentage as u32
        } else {
            default_memory_percentage()
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn vm_state_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
            bridge_ip = "10.20.1.1"
            bridge_subnet = "10.20.1.0/24"
            vmm_binary_path = "/usr/bin/cloud-hypervisor"
            kernel_path = "/var/lib/microvmd/vmlinux"
            rootfs_path = "/var/lib/microvmd/rootfs.img"
        "#
    }

    #[test]
    fn defaults_fill_in_missing_fields() {
        let config: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.bridge_name, "microvmbr0");
        assert_eq!(config.stateful_disk_mib, 1024);
        assert_eq!(config.cid_low, 3);
        assert_eq!(config.cid_high, 1000);
    }

    #[test]
    fn memory_percentage_out_of_range_collapses_to_50() {
        let mut config: Config = toml::from_str(sample_toml()).unwrap();
        for bad in [0, 101, -1] {
            config.memory_percentage = bad;
            assert_eq!(config.effective_memory_percentage(), 50);
        }
        config.memory_percentage = 75;
        assert_eq!(config.effective_memory_percentage(), 75);
    }

    #[test]
    fn invalid_bridge_subnet_is_rejected() {
        let mut config: Config = toml::from_str(sample_toml()).unwrap();
        config.bridge_subnet = "not-a-cidr".to_string();
        assert!(config.validate().is_err());
    }
}
