//! Bounded subprocess execution.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Run a command to completion, collecting its output.
///
/// The child is killed when the timeout elapses, and also when the returned
/// future is dropped (e.g. the daemon shuts down mid-command), so no orphan
/// is ever left behind. A non-zero exit status is *not* an error here;
/// callers decide what it means.
pub(crate) async fn run(mut command: Command, timeout: Option<Duration>) -> Result<Output> {
    command.kill_on_drop(true).stdin(Stdio::null());
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    tracing::trace!(%program, args = ?command.as_std().get_args().collect::<Vec<_>>(), "Running command");
    let started = Instant::now();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, command.output()).await {
            Ok(output) => output,
            Err(_) => {
                tracing::warn!(%program, ?limit, "Command timed out; killed");
                exn::bail!(ErrorKind::Timeout(limit));
            },
        },
        None => command.output().await,
    }
    .or_raise(|| ErrorKind::Io)?;
    tracing::debug!(%program, status = ?output.status.code(), elapsed = ?started.elapsed(), "Command finished");
    Ok(output)
}

/// Fail with [`ErrorKind::Failed`] unless the command exited successfully.
pub(crate) fn check(output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    tracing::warn!(status = ?output.status.code(), stderr = %stderr.trim(), "Command failed");
    exn::bail!(ErrorKind::Failed(output.status.code()));
}
