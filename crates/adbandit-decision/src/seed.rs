//! Deterministic per-cycle RNG seeding.

use sha2::{Digest, Sha256};

/// Seed for one decision cycle: a stable hash of `(campaign_id, tick)`.
///
/// Lets tests replay any cycle bit-for-bit without threading RNG state
/// through the scheduler.
pub fn cycle_seed(campaign_id: i64, cycle_tick: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(campaign_id.to_le_bytes());
    hasher.update(cycle_tick.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
