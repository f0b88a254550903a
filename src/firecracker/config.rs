//! Firecracker `--config-file` rendering.
//!
//! The instance's entire VM configuration — machine shape, boot source,
//! the single root drive, the network interface, and log/metrics sinks —
//! is rendered once as a JSON document consumed via `--config-file` at
//! spawn time. Firecracker is never configured over its API socket; the
//! API is used only for the `SendCtrlAltDel` action and a diagnostic GET.
//!
//! Reference: `spec.md` §4.V, and
//! https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::allocator::fnv1a_32;

/// Kernel command line every instance boots with.
pub const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Fixed locally-administered MAC prefix (`spec.md` §4.V: `06:00:AC:10:…`).
/// Only the trailing two octets vary per VM; bit 1 of the first octet is
/// set (locally administered), bit 0 is clear (unicast).
const MAC_PREFIX: [u8; 4] = [0x06, 0x00, 0xac, 0x10];

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl DriveConfig {
    /// The single root drive every instance gets (`spec.md` §4.V: "no
    /// scratch disk — the rootfs is the only drive").
    pub fn root(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Logger {
    pub log_path: PathBuf,
    pub level: String,
    pub show_level: bool,
    pub show_log_origin: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub metrics_path: PathBuf,
}

/// The complete document written to the instance's `vm-config.json` and
/// passed to Firecracker via `--config-file`.
#[derive(Debug, Clone, Serialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<DriveConfig>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    pub logger: Logger,
    pub metrics: Metrics,
}

pub struct VmConfigParams<'a> {
    pub instance_id: &'a str,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub kernel_path: &'a Path,
    pub rootfs_path: &'a Path,
    pub tap_device: &'a str,
    pub logs_dir: &'a Path,
}

impl VmConfig {
    /// Render the config document for one instance. Pure function of its
    /// inputs (`spec.md` §8 R1: same inputs always render the same bytes).
    pub fn render(params: &VmConfigParams<'_>) -> Self {
        VmConfig {
            boot_source: BootSource {
                kernel_image_path: params.kernel_path.to_path_buf(),
                boot_args: BOOT_ARGS.to_string(),
            },
            drives: vec![DriveConfig::root(params.rootfs_path.to_path_buf())],
            machine_config: MachineConfig {
                vcpu_count: params.vcpus.clamp(1, 32) as u8,
                mem_size_mib: params.memory_mib.max(128),
                smt: false,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                host_dev_name: params.tap_device.to_string(),
                guest_mac: generate_mac_address(params.instance_id),
            }],
            logger: Logger {
                log_path: params.logs_dir.join("firecracker.log"),
                level: "Info".to_string(),
                show_level: true,
                show_log_origin: false,
            },
            metrics: Metrics {
                metrics_path: params.logs_dir.join("firecracker.metrics"),
            },
        }
    }

    /// Atomically write the rendered config to `path` (write-temp-then-rename,
    /// so a concurrent reader never observes a partial file).
    pub fn write_atomic(&self, path: &Path) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Generate a deterministic, locally-administered MAC address for an
/// instance: the fixed `06:00:AC:10` prefix followed by a 16-bit per-VM
/// index (`spec.md` §4.V). This crate has no external sequential-index
/// allocator in scope, so the per-VM index is itself derived deterministically
/// from the instance id's FNV-1a-32 hash, truncated to 16 bits — it varies
/// only in the trailing two octets, unlike the teacher's scheme of hashing
/// three octets directly into the address (see DESIGN.md).
pub fn generate_mac_address(instance_id: &str) -> String {
    let vm_index = (fnv1a_32(instance_id.as_bytes()) & 0xFFFF) as u16;
    let index_bytes = vm_index.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX[0], MAC_PREFIX[1], MAC_PREFIX[2], MAC_PREFIX[3], index_bytes[0], index_bytes[1],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params(instance_id: &str) -> VmConfigParams<'_> {
        VmConfigParams {
            instance_id,
            vcpus: 2,
            memory_mib: 512,
            kernel_path: Path::new("/var/lib/zeitwork/firecracker/vmlinux"),
            rootfs_path: Path::new("/var/lib/zeitwork/firecracker/instances/i-1/rootfs.ext4"),
            tap_device: "tap-zw-deadbeef",
            logs_dir: Path::new("/var/lib/zeitwork/firecracker/instances/i-1/logs"),
        }
    }

    #[test]
    fn render_is_pure() {
        let params = sample_params("i-1");
        let a = VmConfig::render(&params);
        let b = VmConfig::render(&params);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn render_uses_exact_boot_args() {
        let params = sample_params("i-1");
        let config = VmConfig::render(&params);
        assert_eq!(config.boot_source.boot_args, BOOT_ARGS);
    }

    #[test]
    fn render_has_single_root_drive() {
        let params = sample_params("i-1");
        let config = VmConfig::render(&params);
        assert_eq!(config.drives.len(), 1);
        assert!(config.drives[0].is_root_device);
    }

    #[test]
    fn mac_address_is_locally_administered_and_stable() {
        let mac1 = generate_mac_address("i-1");
        let mac2 = generate_mac_address("i-1");
        let mac_other = generate_mac_address("i-2");

        assert_eq!(mac1, mac2);
        assert_ne!(mac1, mac_other);
        assert!(mac1.starts_with("06:00:ac:10:"));
    }

    #[test]
    fn write_atomic_produces_valid_json() {
        let tmp = tempfile::tempdir().unwrap();
        let params = sample_params("i-1");
        let config = VmConfig::render(&params);
        let path = tmp.path().join("vm-config.json");

        config.write_atomic(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(parsed.get("boot-source").is_some());
        assert!(parsed.get("machine-config").is_some());
    }
}
