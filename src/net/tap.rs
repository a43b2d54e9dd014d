//! TAP device factory.
//!
//! Bound to a single bridge. Raw L2 endpoints only — TAPs carry no IP
//! assignment of their own, that's the `IpAllocator`'s job.

use rand::Rng;

use crate::error::Result;
use crate::subprocess::{run_cmd, run_cmd_best_effort};

#[derive(Debug, Clone)]
pub struct TapRecord {
    pub name: String,
    pub mac: String,
}

pub struct TapFactory {
    bridge_name: String,
    prefix: String,
}

impl TapFactory {
    pub fn new(bridge_name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            prefix: prefix.into(),
        }
    }

    /// Creates a TAP interface, attaches it to the configured bridge, and
    /// brings it up. Returns the final interface name and its link-layer
    /// address.
    pub async fn create(&self, name: Option<String>) -> Result<TapRecord> {
        let name = name.unwrap_or_else(|| self.generate_name());

        run_cmd("ip", ["tuntap", "add", &name, "mode", "tap"]).await?;
        run_cmd("ip", ["link", "set", &name, "master", &self.bridge_name]).await?;
        run_cmd("ip", ["link", "set", &name, "up"]).await?;

        let mac = self.read_mac(&name).await?;
        Ok(TapRecord { name, mac })
    }

    /// Removes a previously created TAP device. Absence is not an error:
    /// destroy paths must be idempotent across retries.
    pub async fn destroy(&self, record: &TapRecord) -> Result<()> {
        if run_cmd("ip", ["link", "show", &record.name]).await.is_ok() {
            run_cmd(
                "ip",
                ["link", "delete", &record.name, "type", "tuntap"],
            )
            .await?;
        }
        Ok(())
    }

    /// Deletes every host interface whose name begins with the configured
    /// TAP prefix. Invoked once at startup so a fresh process start is
    /// idempotent after a crash.
    pub async fn cleanup_all(&self) {
        let Ok(listing) = run_cmd("ip", ["-o", "link", "show"]).await else {
            return;
        };
        for line in listing.lines() {
            // Typical line: "3: mtap7@if2: <flags> ..."
            let Some(rest) = line.split(':').nth(1) else {
                continue;
            };
            let name = rest.trim().split('@').next().unwrap_or("").trim();
            if name.starts_with(&self.prefix) {
                run_cmd_best_effort("ip", ["link", "delete", name, "type", "tuntap"]).await;
            }
        }
    }

    fn generate_name(&self) -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        format!("{}{}", self.prefix, suffix)
    }

    async fn read_mac(&self, name: &str) -> Result<String> {
        let raw = run_cmd("ip", ["-o", "link", "show", name]).await?;
        Ok(raw
            .split("link/ether")
            .nth(1)
            .and_then(|s| s.split_whitespace().next())
            .unwrap_or("00:00:00:00:00:00")
            .to_string())
    }
}
