//! TAP device creation and management.
//!
//! Creates and configures TAP devices for Firecracker microVMs. Each
//! instance gets a dedicated TAP device that Firecracker uses for its
//! virtio-net interface (eth0 inside the guest). The TAP is attached to a
//! single shared bridge (`br-zeitwork`) that carries the `fd00:42::/64`
//! overlay and owns the reserved gateway address.
//!
//! Reference: `spec.md` §4.N.

use std::process::Command;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocator::tap_name;

/// Default MTU for overlay traffic.
const DEFAULT_MTU: u32 = 1420;

/// TAP device configuration.
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// Instance ID (used for deterministic naming).
    pub instance_id: String,
    /// Name of the shared bridge this TAP attaches to.
    pub bridge_name: String,
    /// MTU (default 1420).
    pub mtu: u32,
}

impl TapConfig {
    pub fn new(instance_id: &str, bridge_name: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            bridge_name: bridge_name.to_string(),
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// The deterministic TAP device name for this instance.
    pub fn tap_name(&self) -> String {
        tap_name(&self.instance_id)
    }
}

/// Errors from TAP device operations.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("failed to create TAP device: {0}")]
    CreateFailed(String),

    #[error("failed to configure TAP device: {0}")]
    ConfigFailed(String),

    #[error("failed to attach TAP device to bridge: {0}")]
    BridgeAttachFailed(String),

    #[error("failed to delete TAP device: {0}")]
    DeleteFailed(String),

    #[error("command execution failed: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Handle to a created TAP device. Deleting it on drop guarantees an
/// instance never leaks a host-side interface if setup fails partway or the
/// owning task is cancelled (`spec.md` §4.N "Cleanup").
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    instance_id: String,
}

impl TapDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Delete the TAP device now, surfacing any failure to the caller
    /// instead of only logging it (used by explicit teardown paths; `Drop`
    /// falls back to logging since it cannot propagate an error).
    pub fn cleanup(&self) -> Result<(), TapError> {
        delete_tap(&self.name)
    }

    /// Release ownership without deleting the device, returning its name.
    /// Used when the TAP has been handed off to a longer-lived owner (the
    /// registry, keyed by name) and deletion is now name-addressed instead
    /// of tied to this handle's lifetime.
    pub fn into_name(self) -> String {
        let name = self.name.clone();
        std::mem::forget(self);
        name
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!(tap = %self.name, error = %e, "failed to clean up TAP device on drop");
        }
    }
}

/// Ensure the shared overlay bridge exists and owns the reserved gateway
/// address (`fd00:42::1/64`). Idempotent: safe to call on every boot and
/// before every `ensure_tap`.
pub fn ensure_bridge(bridge_name: &str) -> Result<(), TapError> {
    if !tap_exists(bridge_name) {
        run_ip(&["link", "add", "name", bridge_name, "type", "bridge"])
            .map_err(|e| TapError::CreateFailed(e.to_string()))?;
    }
    run_ip(&["link", "set", "dev", bridge_name, "up"])
        .map_err(|e| TapError::ConfigFailed(e.to_string()))?;

    // Idempotent: `ip addr add` fails if the address already exists, which
    // is not an error condition here.
    let _ = run_ip(&["-6", "addr", "add", "fd00:42::1/64", "dev", bridge_name]);

    Ok(())
}

/// Create a TAP device for an instance and attach it to the shared bridge.
pub fn ensure_tap(config: &TapConfig) -> Result<TapDevice, TapError> {
    let name = config.tap_name();

    if tap_exists(&name) {
        debug!(tap = %name, "TAP device already exists, reusing");
        return Ok(TapDevice {
            name,
            instance_id: config.instance_id.clone(),
        });
    }

    info!(
        tap = %name,
        instance_id = %config.instance_id,
        bridge = %config.bridge_name,
        "creating TAP device"
    );

    run_ip(&["tuntap", "add", "dev", &name, "mode", "tap"])
        .map_err(|e| TapError::CreateFailed(e.to_string()))?;

    let result = (|| -> Result<(), TapError> {
        run_ip(&["link", "set", "dev", &name, "mtu", &config.mtu.to_string()])
            .map_err(|e| TapError::ConfigFailed(format!("mtu: {e}")))?;

        run_ip(&["link", "set", "dev", &name, "master", &config.bridge_name])
            .map_err(|e| TapError::BridgeAttachFailed(e.to_string()))?;

        run_ip(&["link", "set", "dev", &name, "up"])
            .map_err(|e| TapError::ConfigFailed(format!("bring up: {e}")))?;

        Ok(())
    })();

    if let Err(e) = result {
        let _ = run_ip(&["link", "delete", &name]);
        return Err(e);
    }

    debug!(tap = %name, "TAP device created and attached");

    Ok(TapDevice {
        name,
        instance_id: config.instance_id.clone(),
    })
}

fn delete_tap(tap_name: &str) -> Result<(), TapError> {
    if !tap_exists(tap_name) {
        return Ok(());
    }

    info!(tap = %tap_name, "deleting TAP device");
    run_ip(&["link", "delete", tap_name]).map_err(|e| TapError::DeleteFailed(e.to_string()))?;
    debug!(tap = %tap_name, "TAP device deleted");
    Ok(())
}

/// Remove any TAP device still present on the host whose name matches the
/// `tap-zw-*` pattern but has no corresponding live instance
/// (`spec.md` §4.R "startup orphan sweep").
pub fn sweep_orphan_taps(live_names: &std::collections::HashSet<String>) -> Vec<String> {
    let mut removed = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return removed;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("tap-zw-") || live_names.contains(&name) {
            continue;
        }
        match delete_tap(&name) {
            Ok(()) => removed.push(name),
            Err(e) => warn!(tap = %name, error = %e, "failed to sweep orphan TAP device"),
        }
    }

    removed
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}

/// Check whether a network interface exists on the host.
pub fn tap_exists(name: &str) -> bool {
    std::path::Path::new(&format!("/sys/class/net/{name}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_config_name_matches_allocator() {
        let config = TapConfig::new("i-001", "br-zeitwork");
        assert_eq!(config.tap_name(), tap_name("i-001"));
        assert_eq!(config.tap_name().len(), 15);
    }

    #[test]
    fn tap_config_builder_sets_mtu() {
        let config = TapConfig::new("i-001", "br-zeitwork").with_mtu(9000);
        assert_eq!(config.mtu, 9000);
        assert_eq!(config.bridge_name, "br-zeitwork");
    }

    #[test]
    fn sweep_skips_non_tap_interfaces() {
        let live = std::collections::HashSet::new();
        // /sys/class/net may not be readable in the test sandbox; the
        // function must not panic either way.
        let _ = sweep_orphan_taps(&live);
    }
}
