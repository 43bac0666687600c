//! `DbTable`: one logical database's primary map, expiration table, and
//! per-key flags.

use kineta_hash_table::DenseHashTable;

use crate::payload::Payload;

/// Per-key metadata that isn't the value itself: whether the key is exempt
/// from eviction, whether some client has opted into invalidation tracking
/// for it, and the opaque flags word the memcache protocol stores alongside
/// a value and echoes back on reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyFlags {
    pub no_evict: bool,
    pub tracked: bool,
    pub memcache_flags: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DbStats {
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub expired_keys: u64,
}

/// One logical database: primary key->value map, expiration table, and
/// per-key flags, all keyed by the same byte string.
pub struct DbTable {
    pub(crate) primary: DenseHashTable<Vec<u8>, Payload>,
    pub(crate) expires: DenseHashTable<Vec<u8>, i64>,
    pub(crate) flags: DenseHashTable<Vec<u8>, KeyFlags>,
    pub stats: DbStats,
}

impl Default for DbTable {
    fn default() -> Self {
        DbTable {
            primary: DenseHashTable::new(),
            expires: DenseHashTable::new(),
            flags: DenseHashTable::new(),
            stats: DbStats::default(),
        }
    }
}

impl DbTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// How many keys carry an expiry.
    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    pub fn flags_of(&self, key: &[u8]) -> KeyFlags {
        self.flags.find(&key.to_vec()).copied().unwrap_or_default()
    }

    pub fn set_flags(&mut self, key: &[u8], flags: KeyFlags) {
        self.flags.insert(key.to_vec(), flags);
    }

    /// Whether the primary entry carries the TTL tag. The tag mirrors the
    /// presence of an expiration-table entry; `DbSlice` keeps the two in
    /// lock-step.
    pub fn has_ttl(&self, key: &[u8]) -> bool {
        self.primary.has_ttl(&key.to_vec())
    }

    /// Discards every entry. Flushing one or all databases is a `DbSlice`
    /// operation; this is the per-table half.
    pub fn clear(&mut self) {
        self.primary = DenseHashTable::new();
        self.expires = DenseHashTable::new();
        self.flags = DenseHashTable::new();
    }
}
