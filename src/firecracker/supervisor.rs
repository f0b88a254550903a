//! Firecracker process supervision: spawn, liveness, and stop.
//!
//! Reference: `spec.md` §4.P.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::FirecrackerClient;

/// Deadline for the API socket to appear after spawn.
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after `SendCtrlAltDel` before escalating to `SIGKILL`.
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn firecracker: {0}")]
    SpawnFailed(String),

    #[error("firecracker API socket did not appear within the deadline")]
    ApiSocketTimeout,

    #[error("start was cancelled")]
    Cancelled,

    #[error("failed to stop firecracker: {0}")]
    StopFailed(String),
}

/// A spawned Firecracker process, its PID, and the API client bound to its
/// socket.
pub struct FirecrackerProcess {
    pub pid: u32,
    pub client: FirecrackerClient,
    child: Child,
}

impl FirecrackerProcess {
    /// Spawn `firecracker` with `--api-sock`/`--config-file`, with its
    /// console redirected to `console_log_path`, and wait for the API
    /// socket to appear.
    pub async fn spawn(
        firecracker_bin: &Path,
        api_socket_path: &Path,
        vm_config_path: &Path,
        console_log_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Self, SupervisorError> {
        if api_socket_path.exists() {
            let _ = std::fs::remove_file(api_socket_path);
        }

        if let Some(parent) = console_log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        }

        let console_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(console_log_path)
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        let console_log_err = console_log
            .try_clone()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let mut child = Command::new(firecracker_bin)
            .arg("--api-sock")
            .arg(api_socket_path)
            .arg("--config-file")
            .arg(vm_config_path)
            .stdin(std::process::Stdio::null())
            .stdout(console_log)
            .stderr(console_log_err)
            // Make the child its own process group leader so the forceful
            // stop path can signal the whole group, not just this pid
            // (`spec.md` §4.P "Forceful: SIGKILL the process group").
            .process_group(0)
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let pid = child.id().ok_or_else(|| {
            SupervisorError::SpawnFailed("child exited before a pid was assigned".to_string())
        })?;

        // Cancellation during the socket wait kills the spawned process
        // and aborts the loop (`spec.md` §5 "Cancellation during Start
        // aborts the socket-wait loop... any spawned Firecracker process
        // is killed.").
        let wait_result = tokio::select! {
            r = wait_for_socket(api_socket_path) => r,
            () = cancel.cancelled() => Err(SupervisorError::Cancelled),
        };

        if let Err(e) = wait_result {
            let _ = child.kill().await;
            return Err(e);
        }

        info!(pid, socket = %api_socket_path.display(), "firecracker process ready");

        Ok(Self {
            pid,
            client: FirecrackerClient::new(api_socket_path),
            child,
        })
    }

    /// Stop gracefully (`SendCtrlAltDel`, wait, then `SIGKILL` if still
    /// alive). Idempotent: calling this on an already-stopped process is
    /// not an error.
    pub async fn stop(mut self) -> Result<(), SupervisorError> {
        if !is_running(self.pid) {
            return Ok(());
        }

        match self.client.send_ctrl_alt_del().await {
            Ok(()) => {
                debug!(pid = self.pid, "sent SendCtrlAltDel");
                sleep(GRACEFUL_STOP_TIMEOUT).await;
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "SendCtrlAltDel failed, forcing kill");
            }
        }

        if is_running(self.pid) {
            kill_process_group(self.pid);
            let _ = self.child.wait().await;
        }

        Ok(())
    }
}

/// Liveness check by signal 0 only — never the API socket or a PUT probe
/// (`spec.md` §4.P: "liveness is `kill(pid, 0)`, nothing else").
pub fn is_running(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks on the target pid.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// `SIGKILL` the process group the child leads (`spec.md` §4.P "Forceful").
/// The child was spawned with `process_group(0)`, so its pid doubles as its
/// pgid.
pub fn kill_process_group(pid: u32) {
    // SAFETY: killpg with a pid observed alive via `is_running` above; a
    // negative-pid semantics error here can at worst fail with ESRCH.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

async fn wait_for_socket(path: &Path) -> Result<(), SupervisorError> {
    let deadline = Instant::now() + SOCKET_WAIT_TIMEOUT;
    timeout(SOCKET_WAIT_TIMEOUT, async {
        while Instant::now() < deadline {
            if path.exists() {
                return;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| SupervisorError::ApiSocketTimeout)?;

    if !path.exists() {
        return Err(SupervisorError::ApiSocketTimeout);
    }
    Ok(())
}

/// The console log path an instance's Firecracker output is redirected to.
pub fn console_log_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join("console.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_running_true_for_current_process() {
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn is_running_false_for_unlikely_pid() {
        assert!(!is_running(u32::MAX - 1));
    }
}
