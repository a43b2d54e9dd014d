//! Callback Session Manager: per-VM subscriber URL registry and outbound
//! JSON-over-HTTP dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::error::{OrchestratorError, Result};

const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One outbound subscriber binding. At most one session exists per VM
/// name; registering a new one closes the old.
struct Session {
    url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CallbackRequest<'a> {
    id: String,
    #[serde(rename = "vmName")]
    vm_name: &'a str,
    method: &'a str,
    params: Value,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct CallbackResponse {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<CallbackErrorBody>,
}

#[derive(Debug, Deserialize)]
struct CallbackErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the session for `vm_name`. An existing session for that name
    /// is dropped (and with it its idle connections) before the new one is
    /// installed.
    #[instrument(skip(self))]
    pub async fn register(&self, vm_name: &str, url: String) {
        let session = Arc::new(Session {
            url,
            client: reqwest::Client::new(),
        });
        let mut sessions = self.sessions.write().await;
        if sessions.insert(vm_name.to_string(), session).is_some() {
            info!(vm_name, "replaced existing callback session");
        }
    }

    /// Removes and closes the session for `vm_name`, if any.
    pub async fn remove(&self, vm_name: &str) {
        self.sessions.write().await.remove(vm_name);
    }

    pub async fn has(&self, vm_name: &str) -> bool {
        self.sessions.read().await.contains_key(vm_name)
    }

    pub async fn get_url(&self, vm_name: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(vm_name)
            .map(|s| s.url.clone())
    }

    /// Builds and POSTs `{id, vmName, method, params, timestamp}` to the
    /// registered subscriber URL, applying a default 30s timeout. A
    /// non-2xx response fails with `VmmTransport`-shaped `Transport` info;
    /// a parseable `{error}` body fails with `CallbackError`; anything else
    /// (parseable `{result}`, or a body that isn't the expected envelope at
    /// all) is returned as the raw result, tolerant of subscribers that
    /// just echo plain JSON back.
    #[instrument(skip(self, params))]
    pub async fn route(&self, vm_name: &str, method: &str, params: Value) -> Result<Value> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(vm_name)
                .cloned()
                .ok_or_else(|| OrchestratorError::NoSession(vm_name.to_string()))?
        };

        let id = format!("{vm_name}-{}", monotonic_nanos());
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let body = CallbackRequest {
            id,
            vm_name,
            method,
            params,
            timestamp,
        };

        let resp = session
            .client
            .post(&session.url)
            .timeout(DEFAULT_CALLBACK_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::Other(format!("callback dispatch failed: {e}")))?;

        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| OrchestratorError::Other(format!("reading callback body failed: {e}")))?;

        if status.as_u16() >= 400 {
            return Err(OrchestratorError::VmmTransport {
                status: status.as_u16(),
                body: raw,
            });
        }

        match serde_json::from_str::<CallbackResponse>(&raw) {
            Ok(parsed) => {
                if let Some(err) = parsed.error {
                    Err(OrchestratorError::CallbackError {
                        code: err.code,
                        message: err.message,
                    })
                } else {
                    Ok(parsed.result.unwrap_or(Value::Null))
                }
            }
            // Not the `{id, result?, error?}` envelope: tolerate callers
            // that just return plain JSON by handing the raw body back.
            Err(_) => Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
        }
    }
}

/// A process-monotonic nanosecond counter used only to make callback
/// session IDs unique within this process's lifetime.
fn monotonic_nanos() -> u128 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    now + seq as u128
}
