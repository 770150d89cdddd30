//! Hash utilities for correlation-based routing.
//!
//! Provides a 64-bit FNV-1a hash over UTF-8 bytes and the jump consistent hash
//! (Lamping & Veach, 2014). Together they map a correlation value onto one of
//! `n` downstreams such that the same value always lands on the same
//! downstream while the downstream set is unchanged, and growing the set from
//! `n` to `n + 1` only moves keys onto the new slot.

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Multiplier of the linear congruential step used by jump consistent hash.
const JUMP_LCG_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

/// Computes a 64-bit FNV-1a hash of a string's UTF-8 bytes.
///
/// # Examples
///
/// ```
/// use conduit_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(""), 0xcbf2_9ce4_8422_2325); // FNV offset basis
/// assert_eq!(fnv1a_hash("a"), 0xaf63_dc4c_8601_ec8c);
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps `key` onto a bucket in `0..buckets` using jump consistent hashing.
///
/// Returns 0 when `buckets` is 0; callers validate that the downstream list
/// is non-empty before selecting.
///
/// # Examples
///
/// ```
/// use conduit_core::hash::jump_consistent_hash;
///
/// assert_eq!(jump_consistent_hash(12_345, 1), 0);
/// assert!(jump_consistent_hash(12_345, 10) < 10);
/// ```
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn jump_consistent_hash(mut key: u64, buckets: u32) -> u32 {
    if buckets == 0 {
        return 0;
    }
    let mut bucket: i64 = -1;
    let mut next: i64 = 0;
    while next < i64::from(buckets) {
        bucket = next;
        key = key.wrapping_mul(JUMP_LCG_MULTIPLIER).wrapping_add(1);
        let divisor = ((key >> 33) + 1) as f64;
        next = ((bucket + 1) as f64 * ((1_u64 << 31) as f64 / divisor)) as i64;
    }
    bucket as u32
}

/// Selects a bucket for a string correlation value.
#[must_use]
pub fn bucket_for(value: &str, buckets: u32) -> u32 {
    jump_consistent_hash(fnv1a_hash(value), buckets)
}
