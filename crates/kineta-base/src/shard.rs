/// Number of cluster slots; slot ids are 14-bit.
pub const NUM_SLOTS: u16 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    /// The slot a key maps to: either its whole body, or the substring
    /// between the first `{` and the next `}` if one is present and
    /// non-empty (the standard cluster "hash tag" rule).
    pub fn of_key(key: &[u8]) -> SlotId {
        let tagged = hash_tag(key).unwrap_or(key);
        SlotId((xxhash_rust::xxh3::xxh3_64(tagged) % NUM_SLOTS as u64) as u16)
    }
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let rest = &key[open + 1..];
    let close = rest.iter().position(|&b| b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}

/// A key's shard id is a stable hash of the key modulo the shard count.
/// In cluster mode the slot table's resolution takes precedence; this free
/// function covers the non-cluster case.
pub fn shard_of(key: &[u8], num_shards: u32) -> ShardId {
    ShardId((xxhash_rust::xxh3::xxh3_64(key) % num_shards as u64) as u32)
}
