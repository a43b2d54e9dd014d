//! Thin wrapper around host utility invocation.
//!
//! Bridge, tap, iptables, truncate and mkfs.ext4 are driven by invoking
//! host binaries rather than binding to the kernel directly (netlink/ioctl).
//! Centralized here so every call site logs and maps failures the same way.

use std::ffi::OsStr;
use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Runs `program` with `args`, returning trimmed stdout on success.
pub async fn run_cmd<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<String> = args
        .into_iter()
        .map(|a| a.as_ref().to_string_lossy().into_owned())
        .collect();
    debug!(program, args = %args.join(" "), "running subprocess");

    let output: Output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(OrchestratorError::Io)?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(OrchestratorError::Subprocess {
            cmd: format!("{program} {}", args.join(" ")),
            exit: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Like [`run_cmd`], but a non-zero exit is only logged, never propagated.
/// Used for best-effort teardown steps where a reap failure should be
/// logged and ignored so retries can make progress.
pub async fn run_cmd_best_effort<I, S>(program: &str, args: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    if let Err(e) = run_cmd(program, args).await {
        tracing::warn!(error = %e, "best-effort subprocess failed, continuing");
    }
}
