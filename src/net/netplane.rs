//! Host network preparation and iptables reaping.
//!
//! One-shot bridge/NAT/forwarding setup plus a targeted rule reaper keyed
//! by destination-IP prefix.

use std::net::Ipv4Addr;
use std::path::Path;

use tokio::fs;
use tracing::{info, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::subprocess::run_cmd;

pub struct HostNetplane;

impl HostNetplane {
    /// Saves current firewall state to `backup_path`, discovers the
    /// default egress interface, and if the bridge does not already exist,
    /// creates it with NAT/forwarding wired up. A no-op (and success) when
    /// the bridge already exists.
    #[instrument(skip(backup_path))]
    pub async fn prepare(
        backup_path: &Path,
        bridge_name: &str,
        bridge_ip: Ipv4Addr,
        bridge_subnet: &str,
    ) -> Result<()> {
        Self::backup_rules(backup_path).await?;

        if Self::bridge_exists(bridge_name).await {
            info!(bridge_name, "bridge already present, netplane prepare is a no-op");
            return Ok(());
        }

        let egress_iface = Self::default_egress_interface().await?;

        run_cmd("ip", ["link", "add", "name", bridge_name, "type", "bridge"]).await?;
        run_cmd(
            "ip",
            [
                "addr",
                "add",
                &format!("{bridge_ip}/{}", prefix_len(bridge_subnet)?),
                "dev",
                bridge_name,
            ],
        )
        .await?;
        run_cmd("ip", ["link", "set", bridge_name, "up"]).await?;

        Self::enable_forwarding(&egress_iface).await?;
        Self::enable_forwarding(bridge_name).await?;

        run_cmd(
            "iptables",
            [
                "-t", "nat", "-A", "POSTROUTING",
                "-s", bridge_subnet,
                "-o", &egress_iface,
                "-j", "MASQUERADE",
            ],
        )
        .await?;
        run_cmd(
            "iptables",
            [
                "-A", "FORWARD",
                "-i", bridge_name,
                "-o", &egress_iface,
                "-j", "ACCEPT",
            ],
        )
        .await?;
        run_cmd(
            "iptables",
            [
                "-A", "FORWARD",
                "-i", &egress_iface,
                "-o", bridge_name,
                "-m", "state",
                "--state", "RELATED,ESTABLISHED",
                "-j", "ACCEPT",
            ],
        )
        .await?;

        Ok(())
    }

    /// Enumerates PREROUTING NAT rules and deletes every rule whose
    /// redirect target begins with `ip_prefix:` — i.e. that IP, any port.
    /// Deletions happen in descending rule-number order so earlier indices
    /// stay valid across the loop. Partial failure continues and joins the
    /// errors it hit.
    #[instrument]
    pub async fn reap_rules_for_prefix(ip_prefix: &str) -> Result<()> {
        let listing = run_cmd(
            "iptables",
            ["-t", "nat", "-L", "PREROUTING", "-n", "--line-numbers"],
        )
        .await?;

        let needle = format!("{ip_prefix}:");
        let mut line_numbers: Vec<u32> = listing
            .lines()
            .filter(|line| line.contains(&needle))
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|n| n.parse().ok())
            .collect();
        line_numbers.sort_unstable_by(|a, b| b.cmp(a));

        let mut errors = Vec::new();
        for num in line_numbers {
            if let Err(e) = run_cmd(
                "iptables",
                ["-t", "nat", "-D", "PREROUTING", &num.to_string()],
            )
            .await
            {
                warn!(rule = num, error = %e, "failed to delete iptables rule, continuing");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Other(format!(
                "{} of the matching iptables rules failed to delete",
                errors.len()
            )))
        }
    }

    /// Removes the bridge if present. Absence is success.
    pub async fn cleanup_bridge(bridge_name: &str) -> Result<()> {
        if Self::bridge_exists(bridge_name).await {
            run_cmd("ip", ["link", "delete", bridge_name, "type", "bridge"]).await?;
        }
        Ok(())
    }

    async fn bridge_exists(bridge_name: &str) -> bool {
        run_cmd("ip", ["link", "show", bridge_name]).await.is_ok()
    }

    async fn enable_forwarding(iface: &str) -> Result<()> {
        run_cmd(
            "sysctl",
            ["-w", &format!("net.ipv4.conf.{iface}.forwarding=1")],
        )
        .await?;
        Ok(())
    }

    async fn default_egress_interface() -> Result<String> {
        let route = run_cmd("ip", ["route", "show", "default"]).await?;
        route
            .split_whitespace()
            .skip_while(|&w| w != "dev")
            .nth(1)
            .map(|s| s.to_string())
            .ok_or_else(|| {
                OrchestratorError::Other("could not determine default egress interface".into())
            })
    }

    async fn backup_rules(backup_path: &Path) -> Result<()> {
        let rules = run_cmd("iptables-save", std::iter::empty::<&str>())
            .await
            .unwrap_or_default();
        fs::write(backup_path, rules)
            .await
            .map_err(OrchestratorError::Io)
    }
}

fn prefix_len(subnet_cidr: &str) -> Result<u8> {
    subnet_cidr
        .split('/')
        .nth(1)
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| OrchestratorError::InvalidConfig(format!("bad subnet CIDR `{subnet_cidr}`")))
}
