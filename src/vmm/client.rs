//! Typed HTTP-over-Unix-socket client for the per-VM VMM: a hyper client
//! bound to a `UnixConnector`, a `hyperlocal::Uri` per request, and a thin
//! `request`/`parse_response` pair underneath the typed methods.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::error::{OrchestratorError, Result};
use crate::vmm::config::CreateVmRequest;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct VmmClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn send(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<(StatusCode, String)> {
        let uri: Uri = UnixUri::new(&self.socket_path, path).into();
        let body = Full::new(Bytes::from(body.unwrap_or_default()));

        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| OrchestratorError::Other(e.to_string()))?;

        let resp = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(req))
            .await
            .map_err(|_| OrchestratorError::VmmTimeout)?
            .map_err(|e| OrchestratorError::Other(e.to_string()))?;

        let status = resp.status();
        let body_bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| OrchestratorError::Other(e.to_string()))?
            .to_bytes();
        let body_text = String::from_utf8_lossy(&body_bytes).to_string();
        Ok((status, body_text))
    }

    /// Every operation treats HTTP status in [200, 300) as success.
    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<String> {
        let (status, body) = self.send(method, path, body).await?;
        if (200..300).contains(&status.as_u16()) {
            Ok(body)
        } else {
            Err(OrchestratorError::VmmTransport {
                status: status.as_u16(),
                body,
            })
        }
    }

    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        self.call(Method::GET, "/ping", None).await.map(|_| ())
    }

    #[instrument(skip(self, config))]
    pub async fn create_vm(&self, config: &CreateVmRequest) -> Result<()> {
        let body = serde_json::to_vec(config)?;
        self.call(Method::PUT, "/vm.create", Some(body))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn boot_vm(&self) -> Result<()> {
        self.call(Method::PUT, "/vm.boot", None).await.map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn shutdown_vm(&self) -> Result<()> {
        self.call(Method::PUT, "/vm.shutdown", None)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn delete_vm(&self) -> Result<()> {
        self.call(Method::PUT, "/vm.delete", None).await.map(|_| ())
    }

    #[instrument(skip(self))]
    pub async fn shutdown_vmm(&self) -> Result<()> {
        self.call(Method::PUT, "/vmm.shutdown", None)
            .await
            .map(|_| ())
    }

    /// Polls [`Self::ping`] at 10ms intervals until it succeeds or
    /// `deadline` passes. `cancel` is checked every iteration so the loop
    /// can be interrupted promptly.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_server(
        &self,
        deadline: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Other("readiness wait cancelled".into()));
            }
            if self.ping().await.is_ok() {
                debug!(elapsed = ?started.elapsed(), "vmm became ready");
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(OrchestratorError::VmmTimeout);
            }
            sleep(READINESS_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Accepts one connection, reads the request, and writes back a fixed
    /// HTTP response. Good enough to exercise the Unix-socket dialing path
    /// without a real VMM binary.
    async fn serve_once(listener: UnixListener, response: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ping_succeeds_against_a_real_unix_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("vmm.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n",
        ));

        let client = VmmClient::new(&socket_path);
        client.ping().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_2xx_status_is_surfaced_as_vmm_transport_error() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("vmm.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\n\r\nboom",
        ));

        let client = VmmClient::new(&socket_path);
        let err = client.ping().await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::VmmTransport { status: 500, .. }
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_server_times_out_when_nothing_is_listening() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("nobody-home.sock");
        let client = VmmClient::new(&socket_path);
        let cancel = tokio_util::sync::CancellationToken::new();
        let err = client
            .wait_for_server(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::VmmTimeout));
    }

    #[tokio::test]
    async fn wait_for_server_is_interrupted_by_cancellation() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("nobody-home.sock");
        let client = VmmClient::new(&socket_path);
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        let err = client
            .wait_for_server(Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Other(_)));
    }
}
