//! Deterministic hashing for sticky variant assignment.
//!
//! Not cryptographic. The only requirement is that the same session key
//! maps to the same point on every process and platform.

/// FNV-1a over the key bytes followed by a SplitMix64 finalizer.
#[must_use]
pub fn stable_hash64(seed: u64, key: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in key.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    splitmix64(seed ^ h)
}

/// Map a key onto `[0, 1)` using the top 53 bits of its hash.
#[must_use]
pub fn unit_interval(seed: u64, key: &str) -> f64 {
    (stable_hash64(seed, key) >> 11) as f64 / (1u64 << 53) as f64
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
