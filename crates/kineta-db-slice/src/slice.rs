//! `DbSlice`: the per-shard owner of one or more logical databases. Every
//! method here runs to completion without an `.await`, so the expire-flag /
//! expiration-table pair is only ever observed in a consistent state by
//! other fibers on the same shard.

use std::collections::HashMap;

use kineta_hash_table::Cursor;

use crate::payload::{Payload, PrimeValue};
use crate::table::{DbTable, KeyFlags};

/// Which databases a `flush_db` call targets.
pub enum FlushScope {
    One(usize),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A pending mutation, reported to registered callbacks before it commits.
/// For `Update` and `Delete`, `value` is the entry's pre-change state —
/// this is what lets a concurrent snapshot serialize a bucket out-of-turn
/// before the write lands.
pub struct ChangeEvent<'a> {
    pub db: usize,
    pub key: &'a [u8],
    pub kind: ChangeKind,
    pub value: Option<&'a Payload>,
    pub expire_at_ms: Option<i64>,
}

type ChangeCallback = Box<dyn FnMut(ChangeEvent<'_>) + Send>;

pub struct DbSlice {
    tables: Vec<DbTable>,
    callbacks: HashMap<u64, ChangeCallback>,
    next_callback_id: u64,
    /// Bumped on every mutation; the snapshot producer uses this to tell
    /// which buckets it has already serialized.
    change_version: u64,
    /// Suppresses the periodic expiration sweep, e.g. while a
    /// `CLIENT PAUSE` is in effect.
    pub sweep_enabled: bool,
}

impl DbSlice {
    pub fn new(num_dbs: usize) -> Self {
        DbSlice {
            tables: (0..num_dbs).map(|_| DbTable::new()).collect(),
            callbacks: HashMap::new(),
            next_callback_id: 1,
            change_version: 0,
            sweep_enabled: true,
        }
    }

    pub fn change_version(&self) -> u64 {
        self.change_version
    }

    pub fn table(&self, db: usize) -> &DbTable {
        &self.tables[db]
    }

    pub fn table_mut(&mut self, db: usize) -> &mut DbTable {
        &mut self.tables[db]
    }

    pub fn num_dbs(&self) -> usize {
        self.tables.len()
    }

    /// Register a callback invoked with a [`ChangeEvent`] on every mutation,
    /// before the change commits, returning an id usable with
    /// `unregister_on_change`.
    pub fn register_on_change(&mut self, callback: ChangeCallback) -> u64 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.callbacks.insert(id, callback);
        id
    }

    pub fn unregister_on_change(&mut self, id: u64) {
        self.callbacks.remove(&id);
    }

    /// Fires the registered callbacks with the entry's current (pre-change)
    /// state. Field-level borrows keep the value readable while the
    /// callback map is iterated mutably.
    fn notify_change(&mut self, db: usize, key: &[u8], kind: ChangeKind) {
        self.change_version += 1;
        if self.callbacks.is_empty() {
            return;
        }
        let table = &self.tables[db];
        let value = table.primary.find(&key.to_vec());
        let expire_at_ms = table.expires.find(&key.to_vec()).copied();
        for cb in self.callbacks.values_mut() {
            cb(ChangeEvent { db, key, kind, value, expire_at_ms });
        }
    }

    /// Lazily expire `key` if its expiry has passed, counting it in
    /// `DbStats::expired_keys` if so. Called by every lookup path.
    fn expire_if_due(&mut self, db: usize, key: &[u8], now_ms: i64) -> bool {
        let due = matches!(self.tables[db].expires.find(&key.to_vec()), Some(&at) if now_ms >= at);
        if due {
            self.notify_change(db, key, ChangeKind::Delete);
            self.tables[db].primary.remove(&key.to_vec());
            self.tables[db].expires.remove(&key.to_vec());
            self.tables[db].flags.remove(&key.to_vec());
            self.tables[db].stats.expired_keys += 1;
        }
        due
    }

    /// Read-only lookup: does not bump any LRU-style recency state, but
    /// still performs the lazy expiration check since that's a correctness
    /// requirement, not a recency signal.
    pub fn find(&mut self, db: usize, key: &[u8], now_ms: i64) -> Option<&PrimeValue> {
        self.expire_if_due(db, key, now_ms);
        let table = &mut self.tables[db];
        match table.primary.find(&key.to_vec()) {
            Some(payload) => {
                table.stats.keyspace_hits += 1;
                payload.as_resident()
            }
            None => {
                table.stats.keyspace_misses += 1;
                None
            }
        }
    }

    /// A mutable handle to an existing key. The change callbacks fire with
    /// the pre-mutation state as the handle is created; the handle itself
    /// is the post-updater receipt that commits accounting on drop.
    pub fn find_mutable<'a>(&'a mut self, db: usize, key: &[u8], now_ms: i64) -> Option<MutGuard<'a>> {
        self.expire_if_due(db, key, now_ms);
        if self.tables[db].primary.find(&key.to_vec()).is_some() {
            self.notify_change(db, key, ChangeKind::Update);
            Some(MutGuard { slice: self, db, key: key.to_vec(), fired: false })
        } else {
            None
        }
    }

    /// Returns a mutable handle plus whether the key was freshly created.
    /// An existing key reports `Update` with its pre-mutation state; a
    /// fresh key reports `Insert` after the default value lands.
    pub fn add_or_find<'a>(&'a mut self, db: usize, key: &[u8], default: impl FnOnce() -> PrimeValue) -> (MutGuard<'a>, bool) {
        let is_new = self.tables[db].primary.find(&key.to_vec()).is_none();
        if is_new {
            self.tables[db].primary.insert(key.to_vec(), Payload::Resident(default()));
            self.notify_change(db, key, ChangeKind::Insert);
        } else {
            self.notify_change(db, key, ChangeKind::Update);
        }
        (MutGuard { slice: self, db, key: key.to_vec(), fired: false }, is_new)
    }

    /// Fires the change callback with the doomed entry, frees the value,
    /// and clears the expiration-table entry if present, all without an
    /// intervening `.await`.
    pub fn delete(&mut self, db: usize, key: &[u8]) -> bool {
        if self.tables[db].primary.find(&key.to_vec()).is_none() {
            return false;
        }
        self.notify_change(db, key, ChangeKind::Delete);
        self.tables[db].primary.remove(&key.to_vec());
        self.tables[db].expires.remove(&key.to_vec());
        self.tables[db].flags.remove(&key.to_vec());
        true
    }

    /// Sets `key`'s absolute expiry. The TTL tag on the primary entry and
    /// the expiration-table entry are updated together, synchronously, so
    /// no other fiber can observe one without the other.
    pub fn set_expiry(&mut self, db: usize, key: &[u8], at_ms: i64) -> bool {
        if self.tables[db].primary.find(&key.to_vec()).is_none() {
            return false;
        }
        self.tables[db].primary.set_has_ttl(&key.to_vec(), true);
        self.tables[db].expires.insert(key.to_vec(), at_ms);
        true
    }

    /// Clears the TTL tag and removes the expiration-table entry in the
    /// same step. Returns `true` if the key had a TTL.
    pub fn persist(&mut self, db: usize, key: &[u8]) -> bool {
        let had_ttl = self.tables[db].expires.remove(&key.to_vec()).is_some();
        if had_ttl {
            self.tables[db].primary.set_has_ttl(&key.to_vec(), false);
        }
        had_ttl
    }

    pub fn ttl_ms(&self, db: usize, key: &[u8], now_ms: i64) -> Option<i64> {
        self.tables[db].expires.find(&key.to_vec()).map(|&at| (at - now_ms).max(0))
    }

    /// Marks all entries in the selected database(s) for deletion. The
    /// invalidation message to tracking clients is the connection layer's
    /// responsibility; this performs the actual clear.
    pub fn flush_db(&mut self, scope: FlushScope) {
        match scope {
            FlushScope::One(db) => self.tables[db].clear(),
            FlushScope::All => {
                for table in &mut self.tables {
                    table.clear();
                }
            }
        }
        self.change_version += 1;
    }

    /// Samples up to `sample_size` entries from `db`'s expiration table and
    /// evicts any that are due, returning the evicted keys so the caller
    /// can journal the expirations. Suppressed entirely when
    /// `sweep_enabled` is false.
    pub fn sweep_expired(&mut self, db: usize, now_ms: i64, sample_size: usize) -> Vec<Vec<u8>> {
        if !self.sweep_enabled {
            return Vec::new();
        }
        let due: Vec<Vec<u8>> = self.tables[db]
            .expires
            .iter()
            .filter(|&(_, &at)| now_ms >= at)
            .take(sample_size)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &due {
            self.notify_change(db, key, ChangeKind::Delete);
            self.tables[db].primary.remove(key);
            self.tables[db].expires.remove(key);
            self.tables[db].flags.remove(key);
        }
        self.tables[db].stats.expired_keys += due.len() as u64;
        due
    }

    pub fn flags_of(&self, db: usize, key: &[u8]) -> KeyFlags {
        self.tables[db].flags_of(key)
    }

    pub fn set_flags(&mut self, db: usize, key: &[u8], flags: KeyFlags) {
        self.tables[db].set_flags(key, flags);
    }

    /// Resumable traversal of one database's primary table, one bucket per
    /// call.
    pub fn scan(&self, db: usize, cursor: Cursor, emit: impl FnMut(&Vec<u8>, &Payload)) -> Cursor {
        self.tables[db].primary.scan(cursor, emit)
    }
}

/// The RAII post-updater receipt handed out by `find_mutable` and
/// `add_or_find`: mutate through [`MutGuard::value_mut`], then either call
/// [`MutGuard::commit`] explicitly or let it run on scope exit. Either way
/// it reconciles the change-version accounting exactly once; the change
/// callbacks themselves fired with the pre-state when the handle was
/// created.
pub struct MutGuard<'a> {
    slice: &'a mut DbSlice,
    db: usize,
    key: Vec<u8>,
    fired: bool,
}

impl<'a> MutGuard<'a> {
    pub fn value_mut(&mut self) -> Option<&mut PrimeValue> {
        self.slice.tables[self.db].primary.find_mut(&self.key).and_then(Payload::as_resident_mut)
    }

    pub fn value(&self) -> Option<&PrimeValue> {
        self.slice.tables[self.db].primary.find(&self.key).and_then(Payload::as_resident)
    }

    /// Explicitly run the post-updater now rather than waiting for drop.
    pub fn commit(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if !self.fired {
            self.fired = true;
            self.slice.change_version += 1;
        }
    }
}

impl Drop for MutGuard<'_> {
    fn drop(&mut self) {
        self.fire();
    }
}
