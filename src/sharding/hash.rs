/// Computes a stable 64-bit hash for a tenant key.
///
/// FNV-1a over the key bytes followed by a 64-bit finalizer, so keys that
/// differ only in their last character still land far apart. Stable across
/// processes and releases; never swap this for `std`'s randomly seeded hasher.
pub fn stable_key_hash(key: &str) -> u64 {
    let mut hash = 14695981039346656037u64;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    fmix64(hash)
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Jump consistent hash (Lamping & Veach).
///
/// Maps `key` to a bucket in `0..buckets`. Growing from `n` to `n + 1`
/// buckets moves only the keys that land in the new bucket.
pub fn jump_consistent_hash(mut key: u64, buckets: u32) -> u32 {
    if buckets == 0 {
        return 0;
    }
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}

/// Bucket for a tenant key among `buckets` shards.
pub fn bucket_for(key: &str, buckets: u32) -> u32 {
    jump_consistent_hash(stable_key_hash(key), buckets)
}
