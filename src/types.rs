//! Core data model: instance specs, runtime state, and the per-instance
//! supervisor handle.
//!
//! Reference: `spec.md` §3.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource request for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub vcpus: u32,
    pub memory_mib: u32,
}

/// Desired network configuration for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub default_port: u16,
}

/// Input to `Runtime::create`: everything needed to assemble and boot a VM.
///
/// `environment` is an ordered mapping (insertion order is preserved and is
/// significant for rendering `/etc/zeitwork/env.sh` deterministically).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub id: String,
    pub image_tag: String,
    pub image_id: String,
    pub resources: Resources,
    pub environment: Vec<(String, String)>,
    pub network_config: NetworkConfig,
}

/// Observed network state of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ipv6_address: Option<String>,
    pub default_port: u16,
}

/// Lifecycle state of an instance.
///
/// `Create` transitions `∅ → Creating → Pending`; `Start` transitions
/// `Pending → Starting → Running`; `Stop` transitions `Running → Stopping →
/// Stopped`; `Delete` accepts any state and terminates at `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Creating,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Creating => "creating",
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Observable runtime state of an instance, returned by `get_state` and
/// `list_instances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub runtime_id: String,
    pub state: InstanceState,
    pub image_tag: String,
    pub resources: Resources,
    pub env_vars: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub network_info: NetworkInfo,
}

/// On-disk + host-resource handle for one instance's supervisor.
///
/// This is the value guarded by the instance registry (`spec.md` §4.S,
/// invariant I1: exactly one `Client` per live `instance_id`).
#[derive(Debug, Clone)]
pub struct Client {
    pub instance_id: String,
    pub api_socket_path: PathBuf,
    pub vm_config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub console_log_path: PathBuf,
    pub tap_device: String,
    pub rootfs_path: PathBuf,
    pub pid: Option<u32>,
}

impl Client {
    pub fn new(base_dir: &std::path::Path, instance_id: &str, tap_device: String) -> Self {
        let instance_dir = base_dir.join("instances").join(instance_id);
        let logs_dir = instance_dir.join("logs");
        Self {
            instance_id: instance_id.to_string(),
            api_socket_path: PathBuf::from(format!(
                "/tmp/firecracker-{}.socket",
                &short8(instance_id)
            )),
            vm_config_path: instance_dir.join("vm-config.json"),
            console_log_path: logs_dir.join("console.log"),
            logs_dir,
            tap_device,
            rootfs_path: instance_dir.join("rootfs.ext4"),
            pid: None,
        }
    }

    pub fn instance_dir(&self) -> &std::path::Path {
        self.rootfs_path
            .parent()
            .expect("rootfs_path always has a parent instance dir")
    }
}

/// First 8 characters of an instance id, used to keep the Firecracker API
/// socket path short (`AF_UNIX` paths have a tight length limit).
pub fn short8(instance_id: &str) -> String {
    instance_id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_paths_are_scoped_to_instance() {
        let client = Client::new(
            std::path::Path::new("/var/lib/zeitwork/firecracker"),
            "i-001",
            "tap-zw-deadbeef".to_string(),
        );
        assert_eq!(
            client.rootfs_path,
            PathBuf::from("/var/lib/zeitwork/firecracker/instances/i-001/rootfs.ext4")
        );
        assert_eq!(
            client.api_socket_path,
            PathBuf::from("/tmp/firecracker-i-001.socket")
        );
    }

    #[test]
    fn short8_truncates_long_ids() {
        assert_eq!(short8("i-0123456789"), "i-012345");
        assert_eq!(short8("i-1"), "i-1");
    }
}
