//! Configuration for the runtime agent.
//!
//! Reference: `spec.md` §6 ("Environment variables read by the core").

use std::path::PathBuf;

/// Candidate paths searched for the Firecracker binary when
/// `FIRECRACKER_BIN` is not set.
const FIRECRACKER_SEARCH_PATH: &[&str] = &["/usr/local/bin/firecracker", "/usr/bin/firecracker"];

/// Runtime agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for per-instance state (`${ZEITWORK_FC_BASE}`).
    pub base_dir: PathBuf,

    /// Path to the Firecracker binary.
    pub firecracker_bin: PathBuf,

    /// Path to the pre-staged base rootfs template.
    pub base_rootfs_path: PathBuf,

    /// Path to the pre-staged kernel image.
    pub kernel_path: PathBuf,

    /// Name of the shared host bridge all TAPs attach to.
    pub bridge_name: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults documented in `spec.md` §6.
    pub fn from_env() -> Self {
        let base_dir = std::env::var("ZEITWORK_FC_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/zeitwork/firecracker"));

        let firecracker_bin = std::env::var("FIRECRACKER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| find_firecracker_binary());

        Self {
            base_rootfs_path: base_dir.join("images/base-rootfs.ext4"),
            kernel_path: base_dir.join("images/vmlinux"),
            base_dir,
            firecracker_bin,
            bridge_name: "br-zeitwork".to_string(),
        }
    }
}

/// Search `FIRECRACKER_SEARCH_PATH` then `$PATH` for a `firecracker` binary.
fn find_firecracker_binary() -> PathBuf {
    for candidate in FIRECRACKER_SEARCH_PATH {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return path;
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("firecracker");
            if candidate.exists() {
                return candidate;
            }
        }
    }

    PathBuf::from("firecracker")
}
