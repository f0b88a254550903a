//! Resource allocator: deterministic TAP names and IPv6 addresses.
//!
//! Reference: `spec.md` §4.L.

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Reserved gateway address, never handed out to an instance.
const GATEWAY: u16 = 1;

/// Number of deterministic probe slots tried before falling back to random
/// slots (`spec.md` §4.L: "first 64 deterministic slots, then 128
/// cryptographically random slots").
const DETERMINISTIC_SLOTS: usize = 64;
const RANDOM_SLOTS: usize = 128;

/// Pluggable uniqueness oracle for IPv6 allocation.
///
/// When no oracle is configured the allocator degrades to deterministic
/// allocation; collisions are logged but not retried (`spec.md` §9).
#[async_trait]
pub trait IpUniqueness: Send + Sync {
    async fn in_use(&self, addr: &str) -> bool;
}

/// Oracle that never reports a collision — the degraded, oracle-less mode.
pub struct NullUniqueness;

#[async_trait]
impl IpUniqueness for NullUniqueness {
    async fn in_use(&self, _addr: &str) -> bool {
        false
    }
}

/// 32-bit FNV-1a hash, used for stable id-to-resource derivation.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic, ≤15-byte TAP device name for an instance id.
///
/// Format: `tap-zw-<8 hex chars>` — always exactly 15 bytes
/// (`IFNAMSIZ - 1` on Linux).
pub fn tap_name(instance_id: &str) -> String {
    format!("tap-zw-{:08x}", fnv1a_32(instance_id.as_bytes()))
}

/// Render an `fd00:42::/64` candidate address from a 16-bit slot.
fn render_address(slot: u16) -> String {
    format!("fd00:42::{:x}", slot)
}

/// The deterministic first candidate for an instance id, before any
/// uniqueness probing. Never the reserved gateway slot (`spec.md` §4.L:
/// "The reserved gateway `fd00:42::1` is never returned").
fn deterministic_slot(instance_id: &str) -> u16 {
    let h = fnv1a_32(instance_id.as_bytes());
    let slot = 0x10u16.wrapping_add((h & 0xFFFF) as u16);
    if slot == GATEWAY {
        slot.wrapping_add(1)
    } else {
        slot
    }
}

/// Derive successive probe slots from a SHA-256 digest of the id, skipping
/// the reserved gateway slot.
fn probe_slots(instance_id: &str, count: usize) -> Vec<u16> {
    let digest = Sha256::digest(instance_id.as_bytes());
    let mut slots = Vec::with_capacity(count);
    let mut i = 0usize;
    while slots.len() < count {
        let byte_a = digest[i % digest.len()];
        let byte_b = digest[(i + 1) % digest.len()];
        let slot = 0x10u16.wrapping_add((u16::from(byte_a) << 8 | u16::from(byte_b)) & 0xFFFF);
        if slot != GATEWAY {
            slots.push(slot);
        }
        i += 1;
    }
    slots
}

/// Allocate a collision-free IPv6 address for `instance_id` within
/// `fd00:42::/64`, optionally consulting a uniqueness oracle.
///
/// Without an oracle, the first deterministic candidate is returned
/// (`spec.md` §4.L: "Without an oracle, the first candidate is returned.").
pub async fn allocate_ipv6(instance_id: &str, oracle: &dyn IpUniqueness) -> String {
    let first = render_address(deterministic_slot(instance_id));
    if !oracle.in_use(&first).await {
        return first;
    }

    for slot in probe_slots(instance_id, DETERMINISTIC_SLOTS) {
        let addr = render_address(slot);
        if !oracle.in_use(&addr).await {
            return addr;
        }
    }

    let mut rng = rand::rngs::OsRng;
    for _ in 0..RANDOM_SLOTS {
        let mut buf = [0u8; 2];
        rng.fill_bytes(&mut buf);
        let slot = 0x10u16.wrapping_add(u16::from_be_bytes(buf) & 0xFFFF);
        if slot == GATEWAY {
            continue;
        }
        let addr = render_address(slot);
        if !oracle.in_use(&addr).await {
            return addr;
        }
    }

    // Exhausted every slot; fall back to the deterministic candidate so the
    // caller always gets a well-formed address rather than an error.
    first
}
