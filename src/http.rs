//! External HTTP control plane and the internal callback adapter: a thin
//! axum router mapping REST endpoints onto [`ServerFacade`] operations,
//! with a single error type rendered centrally through `IntoResponse`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::error::OrchestratorError;
use crate::facade::{ServerFacade, StartRequest, VmView};

pub type AppState = Arc<ServerFacade>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/vms", post(create_vm).get(list_vms).delete(destroy_all))
        .route("/v1/vms/:name", get(get_vm).delete(destroy_one))
        .route("/v1/vms/:name/exec", post(exec))
        .route("/v1/internal/callback", post(callback))
        .with_state(state)
}

/// Wraps [`OrchestratorError`] so it renders as an `{error:{message}}`
/// body with the status `OrchestratorError::status_code` names.
struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({"error": {"message": self.0.to_string()}}))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct CreateVmBody {
    #[serde(rename = "vmName")]
    vm_name: String,
    kernel: Option<PathBuf>,
    rootfs: Option<PathBuf>,
    initramfs: Option<PathBuf>,
    #[serde(rename = "callbackUrl")]
    callback_url: Option<String>,
}

async fn create_vm(
    State(state): State<AppState>,
    Json(body): Json<CreateVmBody>,
) -> Result<Json<VmView>, ApiError> {
    if body.vm_name.is_empty() {
        return Err(ApiError(OrchestratorError::InvalidConfig(
            "vmName must not be empty".to_string(),
        )));
    }
    let view = state
        .start(StartRequest {
            name: body.vm_name,
            kernel: body.kernel,
            initramfs: body.initramfs,
            rootfs: body.rootfs,
            callback_url: body.callback_url,
        })
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
struct VmListResponse {
    vms: Vec<VmView>,
}

async fn list_vms(State(state): State<AppState>) -> Json<VmListResponse> {
    Json(VmListResponse {
        vms: state.list_all().await,
    })
}

async fn get_vm(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
) -> Result<Json<VmView>, ApiError> {
    Ok(Json(state.list_one(&name).await?))
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn destroy_one(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state.destroy_one(&name).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn destroy_all(State(state): State<AppState>) -> Result<Json<SuccessResponse>, ApiError> {
    state.destroy_all().await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
struct ExecBody {
    cmd: String,
    #[serde(default = "default_blocking")]
    blocking: bool,
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ExecResponseBody {
    output: String,
    error: String,
}

async fn exec(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<ExecResponseBody>, ApiError> {
    if body.cmd.is_empty() {
        return Err(ApiError(OrchestratorError::InvalidConfig(
            "cmd must not be empty".to_string(),
        )));
    }
    // require() inside exec() surfaces an unknown vm as NotFound -> 404.
    let outcome = state.exec(&name, &body.cmd, body.blocking).await?;
    Ok(Json(ExecResponseBody {
        output: outcome.output,
        error: outcome.error,
    }))
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "vmName")]
    vm_name: String,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct CallbackResponseBody {
    result: Value,
}

async fn callback(
    State(state): State<AppState>,
    Json(body): Json<CallbackBody>,
) -> Result<Json<CallbackResponseBody>, ApiError> {
    if body.vm_name.is_empty() || body.method.is_empty() {
        return Err(ApiError(OrchestratorError::InvalidConfig(
            "vmName and method must not be empty".to_string(),
        )));
    }
    let result = state
        .route_callback(&body.vm_name, &body.method, body.params)
        .await?;
    Ok(Json(CallbackResponseBody { result }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use httpmock::prelude::*;
    use tower::ServiceExt;

    fn sample_config(bridge_subnet: &str) -> Config {
        let toml = format!(
            r#"
                bridge_ip = "10.20.1.1"
                bridge_subnet = "{bridge_subnet}"
                vmm_binary_path = "/usr/bin/cloud-hypervisor"
                kernel_path = "/var/lib/microvmd/vmlinux"
                rootfs_path = "/var/lib/microvmd/rootfs.img"
            "#
        );
        toml::from_str(&toml).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_healthy() {
        let facade = Arc::new(ServerFacade::new(sample_config("10.20.1.0/24")).unwrap());
        let router = build_router(facade);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exec_against_missing_vm_is_404() {
        let facade = Arc::new(ServerFacade::new(sample_config("10.20.1.0/24")).unwrap());
        let router = build_router(facade);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/vms/ghost/exec")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"cmd": "echo hi"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_vm_with_empty_name_is_400() {
        let facade = Arc::new(ServerFacade::new(sample_config("10.20.1.0/24")).unwrap());
        let router = build_router(facade);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/vms")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"vmName": ""}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn callback_for_vm_without_session_is_500() {
        let facade = Arc::new(ServerFacade::new(sample_config("10.20.1.0/24")).unwrap());
        let router = build_router(facade);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/internal/callback")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"vmName": "ghost", "method": "ping", "params": {}}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    /// The message an operator actually sees for a VM with no session —
    /// exercised directly on the error type since reading the 500 response
    /// body would require pinning axum's internal hyper version as a direct
    /// dependency just for one assertion.
    #[test]
    fn no_session_error_message_mentions_no_active_callback_session() {
        let err = OrchestratorError::NoSession("ghost".to_string());
        assert!(err.to_string().contains("no active callback session"));
    }

    #[tokio::test]
    async fn callback_round_trip_reaches_registered_subscriber() {
        let mock_server = MockServer::start();
        mock_server.mock(|when, then| {
            when.method(POST).path("/cb");
            then.status(200).json_body(json!({"id": "x", "result": "pong"}));
        });

        let facade = Arc::new(ServerFacade::new(sample_config("10.20.1.0/24")).unwrap());
        // Registered directly through the facade's test-only surface,
        // bypassing `start()`, so this exercises the vmName/method/result
        // plumbing without needing a real VMM to boot.
        facade
            .start_test_session("b", format!("{}/cb", mock_server.base_url()))
            .await;
        let router = build_router(facade);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/internal/callback")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"vmName": "b", "method": "ping", "params": {"x": 1}}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
