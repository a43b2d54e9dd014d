//! Guest command-server client: a thin `reqwest` wrapper pointed at the
//! in-guest agent's HTTP port.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::error::{OrchestratorError, Result};

const GUEST_COMMAND_PORT: u16 = 4031;
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READINESS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
pub struct ExecRequest {
    pub cmd: String,
    pub blocking: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExecResponse {
    pub output: String,
    pub error: String,
}

pub struct GuestClient {
    http: reqwest::Client,
}

impl GuestClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn base_url(ip: Ipv4Addr) -> String {
        format!("http://{ip}:{GUEST_COMMAND_PORT}")
    }

    /// POSTs `{cmd, blocking}` to the guest's `/cmd` endpoint. `blocking`
    /// is passed through without reinterpretation — the guest endpoint
    /// alone decides whether `output` is populated.
    pub async fn exec(&self, ip: Ipv4Addr, cmd: &str, blocking: bool) -> Result<ExecResponse> {
        let url = format!("{}/cmd", Self::base_url(ip));
        let resp = self
            .http
            .post(&url)
            .timeout(EXEC_TIMEOUT)
            .json(&ExecRequest {
                cmd: cmd.to_string(),
                blocking,
            })
            .send()
            .await
            .map_err(|e| OrchestratorError::GuestUnreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(OrchestratorError::GuestUnreachable(format!(
                "guest command server returned {}",
                resp.status()
            )));
        }

        resp.json::<ExecResponse>()
            .await
            .map_err(|e| OrchestratorError::GuestUnreachable(e.to_string()))
    }

    /// Polls `GET /` on the guest command server every 10ms up to a 1
    /// minute soft deadline. Never fails the caller — a guest that never
    /// comes up is logged as a warning, not a start failure.
    pub async fn wait_until_ready(&self, ip: Ipv4Addr) -> bool {
        let started = std::time::Instant::now();
        loop {
            if self.http.get(Self::base_url(ip)).send().await.is_ok() {
                return true;
            }
            if started.elapsed() >= READINESS_TIMEOUT {
                tracing::warn!(%ip, "guest command server did not become ready in time");
                return false;
            }
            sleep(READINESS_POLL_INTERVAL).await;
        }
    }
}

impl Default for GuestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_targets_the_fixed_guest_command_port() {
        let ip: Ipv4Addr = "10.20.1.2".parse().unwrap();
        assert_eq!(GuestClient::base_url(ip), "http://10.20.1.2:4031");
    }

    #[test]
    fn exec_request_serializes_blocking_flag_verbatim() {
        let req = ExecRequest {
            cmd: "echo hi".to_string(),
            blocking: false,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["cmd"], "echo hi");
        assert_eq!(value["blocking"], false);
    }

    #[test]
    fn exec_response_deserializes_output_and_error_fields() {
        let raw = r#"{"output":"hi\n","error":""}"#;
        let resp: ExecResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.output, "hi\n");
        assert_eq!(resp.error, "");
    }
}
