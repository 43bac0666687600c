//! A dense-chained hash table with neighbor displacement: an open-addressed
//! table where a bucket's natural occupant can be bumped into an empty
//! immediate neighbor instead of chaining immediately, cutting worst-case
//! empty-slot waste at 100% load from ~36% to ~21%.
//!
//! Stealing high pointer bits for the `link`/`displaced`/`ttl` flags is not
//! portable safe Rust, so `Bucket` is a plain enum carrying the flags
//! alongside the entry, and displacement bookkeeping is an explicit `home`
//! field rather than tag bits. The whole surface is internal, so the
//! representation stays encapsulated in the bucket type.

mod cursor;

pub use cursor::Cursor;

use std::hash::Hash;

const GROW_LOAD_FACTOR: f64 = 0.88;
const MIN_CAPACITY: usize = 16;

/// One key/value slot plus its tag flags.
#[derive(Clone, Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    /// Set when the companion expiration table holds an entry for this key.
    /// The hash table itself never stores the expiry timestamp.
    has_ttl: bool,
    /// `Some(natural_bucket)` if this entry was displaced out of its
    /// natural bucket into a neighbor slot.
    home: Option<usize>,
}

#[derive(Clone, Debug, Default)]
enum Bucket<K, V> {
    #[default]
    Empty,
    Inline(Entry<K, V>),
    /// Promoted once both the natural bucket and its open neighbors are
    /// unusable; entries are kept most-recently-inserted first.
    Chain(Vec<Entry<K, V>>),
}

/// The engine's primary key -> value map.
pub struct DenseHashTable<K, V> {
    buckets: Vec<Bucket<K, V>>,
    len: usize,
}

impl<K: Eq + Hash + Clone, V> Default for DenseHashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> DenseHashTable<K, V> {
    pub fn new() -> Self {
        DenseHashTable {
            buckets: (0..MIN_CAPACITY).map(|_| Bucket::Empty).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn hash(key: &K) -> u64 {
        // Keys are typically byte strings in the engine; we hash via the
        // standard Hash impl through a fast, non-cryptographic hasher
        // rather than xxh3 directly so this stays generic over K.
        use std::hash::Hasher;
        struct X(xxhash_rust::xxh3::Xxh3);
        impl Hasher for X {
            fn finish(&self) -> u64 {
                self.0.digest()
            }
            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes)
            }
        }
        let mut h = X(xxhash_rust::xxh3::Xxh3::new());
        key.hash(&mut h);
        Hasher::finish(&h)
    }

    fn natural(&self, key: &K) -> usize {
        (Self::hash(key) as usize) & (self.buckets.len() - 1)
    }

    /// Lookup: inspect the natural bucket and, if any of its immediate
    /// neighbors are displaced-toward it, those too. Follows the chain if
    /// the natural bucket is a chain head.
    pub fn find(&self, key: &K) -> Option<&V> {
        let nat = self.natural(key);
        if let Some(v) = Self::find_in(&self.buckets[nat], key) {
            return Some(v);
        }
        for neighbor in self.neighbor_indices(nat) {
            if let Bucket::Inline(e) = &self.buckets[neighbor] {
                if e.home == Some(nat) && &e.key == key {
                    return Some(&e.value);
                }
            }
        }
        None
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        let nat = self.natural(key);
        self.find_slot_mut(nat, key)
    }

    fn find_in<'a>(bucket: &'a Bucket<K, V>, key: &K) -> Option<&'a V> {
        match bucket {
            Bucket::Inline(e) if &e.key == key => Some(&e.value),
            Bucket::Chain(chain) => chain.iter().find(|e| &e.key == key).map(|e| &e.value),
            _ => None,
        }
    }

    fn neighbor_indices(&self, nat: usize) -> [usize; 2] {
        let cap = self.buckets.len();
        [(nat + cap - 1) % cap, (nat + 1) % cap]
    }

    /// Insert or overwrite. Returns the previous value, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.len + 1 > (self.buckets.len() as f64 * GROW_LOAD_FACTOR) as usize {
            self.grow();
        }
        self.insert_no_grow(key, value)
    }

    fn insert_no_grow(&mut self, key: K, value: V) -> Option<V> {
        let nat = self.natural(&key);

        // Overwrite in place if the key already lives here (natural, a
        // neighbor, or the chain) rather than inserting a duplicate.
        if let Some(slot) = self.find_slot_mut(nat, &key) {
            return Some(std::mem::replace(slot, value));
        }

        match &self.buckets[nat] {
            Bucket::Empty => {
                self.buckets[nat] = Bucket::Inline(Entry {
                    key,
                    value,
                    has_ttl: false,
                    home: None,
                });
                self.len += 1;
                None
            }
            Bucket::Inline(_) => {
                // Natural bucket is occupied by a different key. Try the
                // immediate neighbors before promoting to a chain.
                for neighbor in self.neighbor_indices(nat) {
                    if matches!(self.buckets[neighbor], Bucket::Empty) {
                        self.buckets[neighbor] = Bucket::Inline(Entry {
                            key,
                            value,
                            has_ttl: false,
                            home: Some(nat),
                        });
                        self.len += 1;
                        return None;
                    }
                }
                // Both neighbors are occupied too: promote to a chain and
                // push-front.
                let displaced = std::mem::replace(&mut self.buckets[nat], Bucket::Empty);
                let mut chain = match displaced {
                    Bucket::Inline(e) => vec![e],
                    _ => unreachable!(),
                };
                chain.insert(
                    0,
                    Entry {
                        key,
                        value,
                        has_ttl: false,
                        home: None,
                    },
                );
                self.buckets[nat] = Bucket::Chain(chain);
                self.len += 1;
                None
            }
            Bucket::Chain(_) => {
                if let Bucket::Chain(chain) = &mut self.buckets[nat] {
                    chain.insert(
                        0,
                        Entry {
                            key,
                            value,
                            has_ttl: false,
                            home: None,
                        },
                    );
                }
                self.len += 1;
                None
            }
        }
    }

    /// Finds the mutable value slot for `key`, if it already occupies the
    /// bucket at `nat`, a displaced neighbor of it, or its chain. Used to
    /// implement overwrite-in-place for `insert`.
    fn find_slot_mut(&mut self, nat: usize, key: &K) -> Option<&mut V> {
        enum Loc {
            Inline(usize),
            Chain(usize),
        }

        let loc = if matches!(&self.buckets[nat], Bucket::Inline(e) if &e.key == key) {
            Some(Loc::Inline(nat))
        } else if matches!(&self.buckets[nat], Bucket::Chain(chain) if chain.iter().any(|e| &e.key == key))
        {
            Some(Loc::Chain(nat))
        } else {
            self.neighbor_indices(nat).into_iter().find(|&neighbor| {
                matches!(&self.buckets[neighbor], Bucket::Inline(e) if e.home == Some(nat) && &e.key == key)
            }).map(Loc::Inline)
        };

        match loc? {
            Loc::Inline(idx) => match &mut self.buckets[idx] {
                Bucket::Inline(e) => Some(&mut e.value),
                _ => unreachable!(),
            },
            Loc::Chain(idx) => match &mut self.buckets[idx] {
                Bucket::Chain(chain) => chain.iter_mut().find(|e| &e.key == key).map(|e| &mut e.value),
                _ => unreachable!(),
            },
        }
    }

    /// Erase a key. Mirrors insert: if a chain empties down to one entry
    /// it degrades back to an inline bucket.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let nat = self.natural(key);
        match &mut self.buckets[nat] {
            Bucket::Inline(e) if &e.key == key => {
                let e = match std::mem::take(&mut self.buckets[nat]) {
                    Bucket::Inline(e) => e,
                    _ => unreachable!(),
                };
                self.len -= 1;
                return Some(e.value);
            }
            Bucket::Chain(chain) => {
                if let Some(pos) = chain.iter().position(|e| &e.key == key) {
                    let e = chain.remove(pos);
                    if chain.len() == 1 {
                        let last = chain.pop().unwrap();
                        self.buckets[nat] = Bucket::Inline(last);
                    } else if chain.is_empty() {
                        self.buckets[nat] = Bucket::Empty;
                    }
                    self.len -= 1;
                    return Some(e.value);
                }
            }
            _ => {}
        }
        for neighbor in self.neighbor_indices(nat) {
            if matches!(&self.buckets[neighbor], Bucket::Inline(e) if e.home == Some(nat) && &e.key == key)
            {
                let e = match std::mem::take(&mut self.buckets[neighbor]) {
                    Bucket::Inline(e) => e,
                    _ => unreachable!(),
                };
                self.len -= 1;
                return Some(e.value);
            }
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Mark or clear the TTL tag bit for a key, without touching the
    /// companion expiration table (the caller, DbSlice, owns that and
    /// must keep the two in lock-step within one shard hop).
    pub fn set_has_ttl(&mut self, key: &K, has_ttl: bool) -> bool {
        let nat = self.natural(key);
        if let Bucket::Inline(e) = &mut self.buckets[nat] {
            if &e.key == key {
                e.has_ttl = has_ttl;
                return true;
            }
        }
        if let Bucket::Chain(chain) = &mut self.buckets[nat] {
            if let Some(e) = chain.iter_mut().find(|e| &e.key == key) {
                e.has_ttl = has_ttl;
                return true;
            }
        }
        for neighbor in self.neighbor_indices(nat) {
            if let Bucket::Inline(e) = &mut self.buckets[neighbor] {
                if e.home == Some(nat) && &e.key == key {
                    e.has_ttl = has_ttl;
                    return true;
                }
            }
        }
        false
    }

    pub fn has_ttl(&self, key: &K) -> bool {
        let nat = self.natural(key);
        if let Bucket::Inline(e) = &self.buckets[nat] {
            if &e.key == key {
                return e.has_ttl;
            }
        }
        if let Bucket::Chain(chain) = &self.buckets[nat] {
            if let Some(e) = chain.iter().find(|e| &e.key == key) {
                return e.has_ttl;
            }
        }
        for neighbor in self.neighbor_indices(nat) {
            if let Bucket::Inline(e) = &self.buckets[neighbor] {
                if e.home == Some(nat) && &e.key == key {
                    return e.has_ttl;
                }
            }
        }
        false
    }

    /// Doubles the bucket count and rehashes every live entry. Growth is a
    /// bounded, non-suspending operation: the shard cannot yield between
    /// allocation and rehash completion, which falls out naturally since
    /// `grow` never awaits.
    fn grow(&mut self) {
        let new_cap = self.buckets.len() * 2;
        let old = std::mem::replace(&mut self.buckets, (0..new_cap).map(|_| Bucket::Empty).collect());
        let old_len = self.len;
        self.len = 0;
        for bucket in old {
            match bucket {
                Bucket::Empty => {}
                Bucket::Inline(e) => {
                    self.insert_no_grow(e.key, e.value);
                }
                Bucket::Chain(chain) => {
                    for e in chain {
                        self.insert_no_grow(e.key, e.value);
                    }
                }
            }
        }
        debug_assert_eq!(self.len, old_len);
    }

    /// Resumable traversal: visits every entry exactly once in the
    /// absence of a concurrent grow. If a grow happens mid-scan the
    /// cursor is bucket-index based, so entries present both before and
    /// after double into predictable positions; newly inserted entries
    /// may or may not be visited.
    pub fn scan(&self, cursor: Cursor, mut emit: impl FnMut(&K, &V)) -> Cursor {
        let bucket_idx = cursor.bucket_index(self.buckets.len());
        if bucket_idx >= self.buckets.len() {
            return Cursor::DONE;
        }
        let chain_idx = cursor.chain_index();
        match &self.buckets[bucket_idx] {
            Bucket::Empty => {}
            Bucket::Inline(e) => {
                if chain_idx == 0 {
                    emit(&e.key, &e.value);
                }
            }
            Bucket::Chain(chain) => {
                for e in chain.iter().skip(chain_idx) {
                    emit(&e.key, &e.value);
                }
            }
        }
        // One bucket per scan call keeps this cheap to call in a loop that
        // yields to foreground traffic between buckets.
        if bucket_idx + 1 >= self.buckets.len() {
            Cursor::DONE
        } else {
            Cursor::at(bucket_idx + 1, 0)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets.iter().flat_map(|b| -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
            match b {
                Bucket::Empty => Box::new(std::iter::empty()),
                Bucket::Inline(e) => Box::new(std::iter::once((&e.key, &e.value))),
                Bucket::Chain(chain) => Box::new(chain.iter().map(|e| (&e.key, &e.value))),
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn insert_find_remove_roundtrip() {
        let mut t = DenseHashTable::new();
        assert_eq!(t.insert("a".to_string(), 1), None);
        assert_eq!(t.insert("b".to_string(), 2), None);
        assert_eq!(t.find(&"a".to_string()), Some(&1));
        assert_eq!(t.find(&"b".to_string()), Some(&2));
        assert_eq!(t.find(&"c".to_string()), None);
        assert_eq!(t.remove(&"a".to_string()), Some(1));
        assert_eq!(t.find(&"a".to_string()), None);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = DenseHashTable::new();
        for i in 0..1000 {
            t.insert(format!("key-{i}"), i);
        }
        assert_eq!(t.len(), 1000);
        for i in 0..1000 {
            assert_eq!(t.find(&format!("key-{i}")), Some(&i));
        }
    }

    #[test]
    fn ttl_tag_independent_of_value() {
        let mut t = DenseHashTable::new();
        t.insert("k".to_string(), 42);
        assert!(!t.has_ttl(&"k".to_string()));
        assert!(t.set_has_ttl(&"k".to_string(), true));
        assert!(t.has_ttl(&"k".to_string()));
    }

    #[test]
    fn scan_visits_every_entry_exactly_once() {
        let mut t = DenseHashTable::new();
        for i in 0..300 {
            t.insert(i, i * 2);
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = Cursor::START;
        loop {
            cursor = t.scan(cursor, |k, _v| {
                assert!(seen.insert(*k), "entry {k} visited twice");
            });
            if cursor.is_done() {
                break;
            }
        }
        assert_eq!(seen.len(), 300);
    }

    #[quickcheck]
    fn last_write_wins(ops: Vec<(u8, u16)>) -> bool {
        let mut t = DenseHashTable::new();
        let mut model = std::collections::HashMap::new();
        for (k, v) in ops {
            t.insert(k, v);
            model.insert(k, v);
        }
        model.iter().all(|(k, v)| t.find(k) == Some(v))
    }

    #[quickcheck]
    fn delete_then_find_is_absent(keys: Vec<u8>) -> bool {
        let mut t = DenseHashTable::new();
        for &k in &keys {
            t.insert(k, ());
        }
        for &k in &keys {
            t.remove(&k);
        }
        keys.iter().all(|k| t.find(k).is_none())
    }
}
