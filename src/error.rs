//! Error taxonomy for the orchestrator core.
//!
//! One enum, one `thiserror::Error` derive, structured fields on the
//! variants the HTTP adapter needs to render distinctly.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("allocator exhausted")]
    Exhausted,

    #[error("address {0} was never allocated")]
    NotAllocated(String),

    #[error("command `{cmd}` failed (exit {exit:?}): {stderr}")]
    Subprocess {
        cmd: String,
        exit: Option<i32>,
        stderr: String,
    },

    #[error("vmm transport error: status {status}, body: {body}")]
    VmmTransport { status: u16, body: String },

    #[error("vmm did not become ready in time")]
    VmmTimeout,

    #[error("guest unreachable: {0}")]
    GuestUnreachable(String),

    #[error("vm `{0}` already exists")]
    AlreadyExists(String),

    #[error("vm not found: {0}")]
    NotFound(String),

    #[error("callback error {code}: {message}")]
    CallbackError { code: i64, message: String },

    #[error("no active callback session for vm `{0}`")]
    NoSession(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// HTTP status this error should be rendered as by the external adapter.
    pub fn status_code(&self) -> u16 {
        match self {
            OrchestratorError::InvalidConfig(_) => 400,
            OrchestratorError::NotFound(_) => 404,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A stack of compensating actions, run in reverse order of acquisition on
/// failure and simply dropped (never run) on success. Actions are async
/// because the compensations here are subprocess calls (tap/VMM teardown)
/// that must be awaited, so this can't be a `Drop` impl the way a sync RAII
/// guard would be — callers invoke [`CleanupGuard::run`] explicitly on the
/// failure path.
pub struct CleanupGuard {
    actions: Vec<CleanupAction>,
}

type CleanupAction =
    Box<dyn FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send>;

impl CleanupGuard {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registers a compensating action. Actions run in reverse order of
    /// registration, i.e. the most recent acquisition is released first.
    pub fn push<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.actions.push(Box::new(move || Box::pin(action())));
    }

    /// Runs every registered action in reverse order. Call this only on
    /// the failure path; on success just let the guard drop unused.
    pub async fn run(mut self) {
        while let Some(action) = self.actions.pop() {
            action().await;
        }
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}
