//! Deterministic per-key jitter.

use std::time::Duration;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

/// 64-bit FNV-1 hash.
pub fn fnv1_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in data {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u64::from(byte);
    }
    hash
}

/// Returns a duration in `[0, d)` derived from a hash of `key`.
///
/// Like a random duration, but stable for a given key, so per-repository
/// schedules spread out across the fleet without moving between runs.
pub fn jitter_duration(key: &str, d: Duration) -> Duration {
    if d.is_zero() {
        return Duration::ZERO;
    }
    let mut r = fnv1_64(key.as_bytes()) as i64;
    if r < 0 {
        // One more negative value than positive, hence the +1.
        r = -(r.wrapping_add(1));
    }
    Duration::from_nanos(r as u64 % d.as_nanos() as u64)
}
