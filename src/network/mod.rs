//! Network setup for microVM instances.
//!
//! Each microVM gets a dedicated TAP device for its eth0 interface,
//! attached to a single shared bridge (`br-zeitwork`) carrying the
//! `fd00:42::/64` overlay. Reference: `spec.md` §4.N.

mod tap;

pub use tap::{ensure_bridge, ensure_tap, sweep_orphan_taps, tap_exists, TapConfig, TapDevice, TapError};
