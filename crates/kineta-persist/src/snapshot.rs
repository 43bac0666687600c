//! The snapshot producer and loader. Values are translated into a small
//! closed record shape rather than serializing `PrimeValue` itself, keeping
//! the on-disk schema at the persistence boundary instead of pushed onto
//! the in-memory hot type. Entries are length-prefixed so the same framing
//! applies equally to a file or a socket.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use kineta_db_slice::{ChangeEvent, ChangeKind, DbSlice, DocumentValue, Payload, PrimeValue, ZSet};
use kineta_hash_table::{Cursor, DenseHashTable};

/// Version byte for the self-describing stream header.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SnapshotValue {
    Str(Vec<u8>),
    List(Vec<Vec<u8>>),
    Set(Vec<Vec<u8>>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    ZSet(Vec<(Vec<u8>, f64)>),
    Json(serde_json::Value),
    Document(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotRecord {
    pub db_index: u32,
    pub key: Vec<u8>,
    pub expire_at_ms: Option<i64>,
    pub value: SnapshotValue,
}

/// One entry in the framed snapshot stream: either a key record, or the
/// terminal "full-sync cut" marker separating the point-in-time dump from
/// any journal records streamed after it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SnapshotEntry {
    Header { version: u32 },
    Record(SnapshotRecord),
    Cut,
}

/// `PrimeValue` has no stable on-disk representation of its own; this is
/// the one place that translates it, matching the type's closed set of
/// variants exhaustively.
pub fn to_snapshot_value(value: &PrimeValue) -> SnapshotValue {
    match value {
        PrimeValue::Str(s) => SnapshotValue::Str(s.clone()),
        PrimeValue::List(l) => SnapshotValue::List(l.iter().cloned().collect()),
        PrimeValue::Set(s) => SnapshotValue::Set(s.iter().map(|(k, _)| k.clone()).collect()),
        PrimeValue::Hash(h) => SnapshotValue::Hash(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        PrimeValue::ZSet(z) => SnapshotValue::ZSet((0..z.len()).filter_map(|rank| z.at_rank(rank)).map(|(m, s)| (m.to_vec(), s)).collect()),
        PrimeValue::Json(j) => SnapshotValue::Json(j.clone()),
        PrimeValue::Document(d) => SnapshotValue::Document(d.body.clone()),
    }
}

/// Inverse of [`to_snapshot_value`], used when loading a dump.
pub fn from_snapshot_value(value: SnapshotValue) -> PrimeValue {
    match value {
        SnapshotValue::Str(s) => PrimeValue::Str(s),
        SnapshotValue::List(l) => PrimeValue::List(l.into()),
        SnapshotValue::Set(members) => {
            let mut set = DenseHashTable::new();
            for m in members {
                set.insert(m, ());
            }
            PrimeValue::Set(set)
        }
        SnapshotValue::Hash(pairs) => {
            let mut hash = DenseHashTable::new();
            for (f, v) in pairs {
                hash.insert(f, v);
            }
            PrimeValue::Hash(hash)
        }
        SnapshotValue::ZSet(scored) => {
            let mut zset = ZSet::new();
            for (member, score) in scored {
                zset.insert(member, score);
            }
            PrimeValue::ZSet(zset)
        }
        SnapshotValue::Json(j) => PrimeValue::Json(j),
        SnapshotValue::Document(body) => PrimeValue::Document(DocumentValue { body }),
    }
}

/// Applies one loaded record to `slice`, overwriting any existing entry
/// for the key and restoring its expiry if the record carried one.
pub fn apply_record(slice: &mut DbSlice, record: SnapshotRecord) {
    let db = record.db_index as usize;
    if db >= slice.num_dbs() {
        tracing::warn!(db, key_len = record.key.len(), "dropping snapshot record for an out-of-range database");
        return;
    }
    let value = from_snapshot_value(record.value);
    let key = record.key;
    slice.delete(db, &key);
    let (guard, _) = slice.add_or_find(db, &key, || value);
    guard.commit();
    if let Some(at_ms) = record.expire_at_ms {
        slice.set_expiry(db, &key, at_ms);
    }
}

/// Encodes one [`SnapshotEntry`] with a 4-byte big-endian length prefix.
pub fn encode_entry(entry: &SnapshotEntry, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    let body = serde_json::to_vec(entry)?;
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Decodes every length-prefixed entry found in `buf`, in order.
pub fn decode_entries(buf: &[u8]) -> Result<Vec<SnapshotEntry>, serde_json::Error> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if pos + len > buf.len() {
            break;
        }
        out.push(serde_json::from_slice(&buf[pos..pos + len])?);
        pos += len;
    }
    Ok(out)
}

/// Drives a chunked, bucket-at-a-time scan of one shard's databases. Each
/// call to [`SnapshotProducer::scan_one_bucket`] is meant to be issued from
/// a separate hop so that ordinary command hops can run in between.
///
/// Consistency: the change callback registered at `start` fires before any
/// mutation commits, carrying the entry's pre-change state. A key that is
/// about to be mutated or deleted before the cursor has reached it is
/// serialized out-of-turn right then, so the dump holds the value it had
/// when the snapshot started. Keys inserted after start are marked visited
/// without being emitted, which keeps them out of the dump entirely. Every
/// key is serialized at most once: by the cursor, or by the callback,
/// whichever gets there first.
pub struct SnapshotProducer {
    cursors: Vec<Cursor>,
    visited: Arc<Mutex<HashSet<(usize, Vec<u8>)>>>,
    out_of_turn: Arc<Mutex<Vec<SnapshotRecord>>>,
    callback_id: u64,
}

impl SnapshotProducer {
    pub fn start(slice: &mut DbSlice) -> SnapshotProducer {
        let visited = Arc::new(Mutex::new(HashSet::new()));
        let out_of_turn = Arc::new(Mutex::new(Vec::new()));

        let visited_cb = visited.clone();
        let out_cb = out_of_turn.clone();
        let callback_id = slice.register_on_change(Box::new(move |event: ChangeEvent<'_>| {
            let mut visited = visited_cb.lock().expect("snapshot visited-set poisoned");
            let first_touch = visited.insert((event.db, event.key.to_vec()));
            if !first_touch || event.kind == ChangeKind::Insert {
                return;
            }
            if let Some(Payload::Resident(value)) = event.value {
                out_cb.lock().expect("snapshot out-of-turn queue poisoned").push(SnapshotRecord {
                    db_index: event.db as u32,
                    key: event.key.to_vec(),
                    expire_at_ms: event.expire_at_ms,
                    value: to_snapshot_value(value),
                });
            }
        }));

        SnapshotProducer {
            cursors: vec![Cursor::START; slice.num_dbs()],
            visited,
            out_of_turn,
            callback_id,
        }
    }

    /// Scans one bucket of `db`, emitting a record for each resident entry
    /// the callback hasn't already captured. Returns `true` once every
    /// database has been fully scanned.
    pub fn scan_one_bucket(&mut self, slice: &mut DbSlice, db: usize, now_ms: i64, sink: &mut impl FnMut(SnapshotRecord)) -> bool {
        if self.cursors[db].is_done() {
            return self.cursors.iter().all(|c| c.is_done());
        }
        let mut visited = self.visited.lock().expect("snapshot visited-set poisoned");
        let cursor = slice.scan(db, self.cursors[db], |key, payload| {
            if !visited.insert((db, key.clone())) {
                return;
            }
            if let Payload::Resident(value) = payload {
                sink(SnapshotRecord {
                    db_index: db as u32,
                    key: key.clone(),
                    expire_at_ms: slice.ttl_ms(db, key, now_ms).map(|ttl| now_ms + ttl),
                    value: to_snapshot_value(value),
                });
            }
        });
        drop(visited);
        self.cursors[db] = cursor;
        self.cursors.iter().all(|c| c.is_done())
    }

    /// Drains records the change callback serialized out-of-turn since the
    /// last call. Meant to be interleaved with `scan_one_bucket` so the
    /// queue never grows past one step's worth of writes.
    pub fn drain_out_of_turn(&mut self, sink: &mut impl FnMut(SnapshotRecord)) {
        for record in self.out_of_turn.lock().expect("snapshot out-of-turn queue poisoned").drain(..) {
            sink(record);
        }
    }

    /// Call once every database's cursor has reached [`Cursor::DONE`]:
    /// unregisters the change callback, drains any remaining out-of-turn
    /// records, then emits the terminal cut marker.
    pub fn finish(mut self, slice: &mut DbSlice, sink: &mut impl FnMut(SnapshotEntry)) {
        slice.unregister_on_change(self.callback_id);
        let mut emit = |record| sink(SnapshotEntry::Record(record));
        self.drain_out_of_turn(&mut emit);
        sink(SnapshotEntry::Cut);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kineta_db_slice::DbSlice;

    fn drain_full_snapshot(slice: &mut DbSlice, now_ms: i64) -> Vec<SnapshotEntry> {
        let mut producer = SnapshotProducer::start(slice);
        let mut entries = Vec::new();

        loop {
            let mut done = true;
            for db in 0..slice.num_dbs() {
                let db_done = producer.scan_one_bucket(slice, db, now_ms, &mut |rec| entries.push(SnapshotEntry::Record(rec)));
                done &= db_done;
            }
            producer.drain_out_of_turn(&mut |rec| entries.push(SnapshotEntry::Record(rec)));
            if done {
                break;
            }
        }
        producer.finish(slice, &mut |entry| entries.push(entry));
        entries
    }

    #[test]
    fn snapshot_captures_every_resident_key_and_ends_with_a_cut_marker() {
        let mut slice = DbSlice::new(1);
        for i in 0..10 {
            let key = format!("k{i}");
            let (guard, _) = slice.add_or_find(0, key.as_bytes(), || PrimeValue::Str(b"v".to_vec()));
            guard.commit();
        }

        let entries = drain_full_snapshot(&mut slice, 0);
        let records: Vec<_> = entries
            .iter()
            .filter_map(|e| match e {
                SnapshotEntry::Record(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(records.len(), 10);
        assert!(matches!(entries.last(), Some(SnapshotEntry::Cut)));
    }

    #[test]
    fn snapshot_then_load_restores_every_value_kind() {
        let mut slice = DbSlice::new(1);
        let (guard, _) = slice.add_or_find(0, b"s", || PrimeValue::Str(b"v".to_vec()));
        guard.commit();
        let (guard, _) = slice.add_or_find(0, b"l", || PrimeValue::List(vec![b"a".to_vec(), b"b".to_vec()].into()));
        guard.commit();
        let mut zset = ZSet::new();
        zset.insert(b"m1".to_vec(), 1.5);
        zset.insert(b"m2".to_vec(), 0.5);
        let (guard, _) = slice.add_or_find(0, b"z", || PrimeValue::ZSet(zset));
        guard.commit();
        slice.set_expiry(0, b"s", 5_000);

        let entries = drain_full_snapshot(&mut slice, 0);

        let mut restored = DbSlice::new(1);
        for entry in entries {
            if let SnapshotEntry::Record(record) = entry {
                apply_record(&mut restored, record);
            }
        }

        assert!(matches!(restored.find(0, b"s", 0), Some(PrimeValue::Str(v)) if v == b"v"));
        assert!(matches!(restored.find(0, b"l", 0), Some(PrimeValue::List(l)) if l.len() == 2));
        match restored.find(0, b"z", 0) {
            Some(PrimeValue::ZSet(z)) => {
                assert_eq!(z.rank(b"m2"), Some(0));
                assert_eq!(z.rank(b"m1"), Some(1));
            }
            other => panic!("expected a zset, got {:?}", other.map(PrimeValue::type_name)),
        }
        assert_eq!(restored.ttl_ms(0, b"s", 0), Some(5_000));
        // Expired on load-side reads past the stored deadline.
        assert!(restored.find(0, b"s", 10_000).is_none());
    }

    #[test]
    fn keys_mutated_mid_scan_appear_once_with_their_start_value() {
        let mut slice = DbSlice::new(1);
        for i in 0..32 {
            let key = format!("k{i:02}");
            let (guard, _) = slice.add_or_find(0, key.as_bytes(), || PrimeValue::Str(b"old".to_vec()));
            guard.commit();
        }

        let mut producer = SnapshotProducer::start(&mut slice);
        let mut entries = Vec::new();

        // Walk a few buckets, then mutate every key (scanned or not),
        // delete some, and insert brand-new ones before resuming.
        for db in 0..1 {
            for _ in 0..4 {
                producer.scan_one_bucket(&mut slice, db, 0, &mut |rec| entries.push(rec));
            }
        }
        for i in 0..32 {
            let key = format!("k{i:02}");
            if i % 7 == 0 {
                slice.delete(0, key.as_bytes());
            } else {
                let (mut guard, _) = slice.add_or_find(0, key.as_bytes(), || PrimeValue::Str(Vec::new()));
                if let Some(PrimeValue::Str(s)) = guard.value_mut() {
                    *s = b"new".to_vec();
                }
                guard.commit();
            }
        }
        let (guard, _) = slice.add_or_find(0, b"late-arrival", || PrimeValue::Str(b"x".to_vec()));
        guard.commit();

        loop {
            let done = producer.scan_one_bucket(&mut slice, 0, 0, &mut |rec| entries.push(rec));
            producer.drain_out_of_turn(&mut |rec| entries.push(rec));
            if done {
                break;
            }
        }
        producer.finish(&mut slice, &mut |entry| {
            if let SnapshotEntry::Record(rec) = entry {
                entries.push(rec);
            }
        });

        let mut seen = HashSet::new();
        for rec in &entries {
            assert!(seen.insert(rec.key.clone()), "key {:?} dumped twice", String::from_utf8_lossy(&rec.key));
            assert_eq!(rec.value, SnapshotValue::Str(b"old".to_vec()), "key {:?} dumped with a post-start value", String::from_utf8_lossy(&rec.key));
        }
        assert_eq!(seen.len(), 32, "every key present at start appears, deletions included");
        assert!(!seen.contains(&b"late-arrival".to_vec()), "keys inserted after start stay out of the dump");
    }

    #[test]
    fn encode_then_decode_round_trips_a_cut_marker() {
        let mut buf = Vec::new();
        encode_entry(&SnapshotEntry::Header { version: SNAPSHOT_FORMAT_VERSION }, &mut buf).unwrap();
        encode_entry(&SnapshotEntry::Cut, &mut buf).unwrap();

        let decoded = decode_entries(&buf).unwrap();
        assert_eq!(decoded, vec![SnapshotEntry::Header { version: SNAPSHOT_FORMAT_VERSION }, SnapshotEntry::Cut]);
    }
}
