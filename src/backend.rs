//! VMM backend seam: the boundary between instance lifecycle logic and an
//! actual Firecracker process.
//!
//! Grounded in the teacher's `Runtime`/`MockRuntime` split — kept here so
//! the orchestrator (`crate::runtime::Runtime`) and its tests never depend
//! on a real Firecracker binary being present.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::RuntimeError;
use crate::firecracker::{FirecrackerProcess, VmConfig, VmConfigParams};

/// A running VM's process-level handle.
pub struct VmHandle {
    pub pid: u32,
}

/// Capability to spawn, probe, and stop a single Firecracker VM process.
#[async_trait]
pub trait VmmBackend: Send + Sync {
    async fn spawn(
        &self,
        params: &VmConfigParams<'_>,
        api_socket_path: &PathBuf,
        vm_config_path: &PathBuf,
        console_log_path: &PathBuf,
        cancel: &CancellationToken,
    ) -> Result<VmHandle, RuntimeError>;

    async fn stop(&self, pid: u32, api_socket_path: &PathBuf) -> Result<(), RuntimeError>;

    fn is_running(&self, pid: u32) -> bool;
}

/// Spawns real `firecracker` processes.
pub struct FirecrackerBackend {
    pub firecracker_bin: PathBuf,
}

#[async_trait]
impl VmmBackend for FirecrackerBackend {
    async fn spawn(
        &self,
        params: &VmConfigParams<'_>,
        api_socket_path: &PathBuf,
        vm_config_path: &PathBuf,
        console_log_path: &PathBuf,
        cancel: &CancellationToken,
    ) -> Result<VmHandle, RuntimeError> {
        let config = VmConfig::render(params);
        config
            .write_atomic(vm_config_path)
            .map_err(|e| RuntimeError::ConfigWriteFailed(e.to_string()))?;

        let process = FirecrackerProcess::spawn(
            &self.firecracker_bin,
            api_socket_path,
            vm_config_path,
            console_log_path,
            cancel,
        )
        .await?;

        Ok(VmHandle { pid: process.pid })
    }

    async fn stop(&self, pid: u32, api_socket_path: &PathBuf) -> Result<(), RuntimeError> {
        if !crate::firecracker::is_running(pid) {
            return Ok(());
        }
        let client = crate::firecracker::FirecrackerClient::new(api_socket_path);
        // `FirecrackerProcess::stop` expects ownership of the child handle,
        // which this backend doesn't retain across calls; send the
        // graceful signal directly and fall back to process-group kill.
        let _ = client.send_ctrl_alt_del().await;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        if crate::firecracker::is_running(pid) {
            crate::firecracker::kill_process_group(pid);
        }
        Ok(())
    }

    fn is_running(&self, pid: u32) -> bool {
        crate::firecracker::is_running(pid)
    }
}

/// In-memory backend for tests: records calls, never shells out.
pub struct MockBackend {
    next_pid: Mutex<u32>,
    fail_spawn: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            next_pid: Mutex::new(1_000),
            fail_spawn: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            next_pid: Mutex::new(1_000),
            fail_spawn: true,
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmmBackend for MockBackend {
    async fn spawn(
        &self,
        params: &VmConfigParams<'_>,
        _api_socket_path: &PathBuf,
        vm_config_path: &PathBuf,
        _console_log_path: &PathBuf,
        cancel: &CancellationToken,
    ) -> Result<VmHandle, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        if self.fail_spawn {
            return Err(RuntimeError::VmmSpawnFailed("mock configured to fail".to_string()));
        }

        let config = VmConfig::render(params);
        config
            .write_atomic(vm_config_path)
            .map_err(|e| RuntimeError::ConfigWriteFailed(e.to_string()))?;

        let mut next_pid = self.next_pid.lock().await;
        let pid = *next_pid;
        *next_pid += 1;

        info!(instance_id = params.instance_id, pid, "[mock] spawned VM");
        Ok(VmHandle { pid })
    }

    async fn stop(&self, pid: u32, _api_socket_path: &PathBuf) -> Result<(), RuntimeError> {
        info!(pid, "[mock] stopped VM");
        Ok(())
    }

    fn is_running(&self, _pid: u32) -> bool {
        // The mock never actually spawns an OS process; callers that need
        // liveness in tests track it separately via the registry.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn params(id: &str) -> VmConfigParams<'_> {
        VmConfigParams {
            instance_id: id,
            vcpus: 1,
            memory_mib: 128,
            kernel_path: Path::new("/var/lib/zeitwork/firecracker/vmlinux"),
            rootfs_path: Path::new("/tmp/rootfs.ext4"),
            tap_device: "tap-zw-deadbeef",
            logs_dir: Path::new("/tmp"),
        }
    }

    #[tokio::test]
    async fn mock_backend_assigns_increasing_pids() {
        let backend = MockBackend::new();
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("vm-config.json");

        let h1 = backend
            .spawn(
                &params("i-1"),
                &PathBuf::new(),
                &cfg_path,
                &PathBuf::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let h2 = backend
            .spawn(
                &params("i-2"),
                &PathBuf::new(),
                &cfg_path,
                &PathBuf::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(h2.pid > h1.pid);
    }

    #[tokio::test]
    async fn failing_backend_reports_spawn_error() {
        let backend = MockBackend::failing();
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("vm-config.json");

        let result = backend
            .spawn(
                &params("i-1"),
                &PathBuf::new(),
                &cfg_path,
                &PathBuf::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RuntimeError::VmmSpawnFailed(_))));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_spawn() {
        let backend = MockBackend::new();
        let tmp = tempfile::tempdir().unwrap();
        let cfg_path = tmp.path().join("vm-config.json");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = backend
            .spawn(&params("i-1"), &PathBuf::new(), &cfg_path, &PathBuf::new(), &cancel)
            .await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
    }
}
