//! The tagged union of object types a key can hold, plus the sorted-set
//! helper built on `kineta-rank-index`.

use std::collections::VecDeque;

use kineta_hash_table::DenseHashTable;
use kineta_rank_index::RankIndex;

/// A key's object type is fixed for its lifetime; re-typing requires
/// delete+insert. `Encoding` is purely a compactness hint surfaced through
/// `OBJECT ENCODING`; every variant behaves identically regardless of which
/// encoding it reports.
pub enum PrimeValue {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(DenseHashTable<Vec<u8>, ()>),
    ZSet(ZSet),
    Hash(DenseHashTable<Vec<u8>, Vec<u8>>),
    Json(serde_json::Value),
    Document(DocumentValue),
}

/// A full-text-indexed document. The search query engine lives behind its
/// own service boundary; what remains here is the index-maintenance seam it
/// is called through on every mutation.
pub struct DocumentValue {
    pub body: Vec<u8>,
}

/// The compactness tier a value reports: int-packed for short numeric
/// strings, listpack for small collections, dense otherwise. Recomputed on
/// demand and surfaced via introspection; it has no bearing on how the
/// value is actually stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    IntPacked,
    ListPack,
    Dense,
}

/// Above this many elements, a `Set`/`Hash`/`ZSet` reports the `Dense`
/// encoding tier instead of the compact `ListPack` one.
const LISTPACK_MAX_ENTRIES: usize = 128;

impl PrimeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PrimeValue::Str(_) => "string",
            PrimeValue::List(_) => "list",
            PrimeValue::Set(_) => "set",
            PrimeValue::ZSet(_) => "zset",
            PrimeValue::Hash(_) => "hash",
            PrimeValue::Json(_) => "json",
            PrimeValue::Document(_) => "document",
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            PrimeValue::Str(s) => {
                if s.len() <= 20 && std::str::from_utf8(s).ok().and_then(|s| s.parse::<i64>().ok()).is_some() {
                    Encoding::IntPacked
                } else {
                    Encoding::Dense
                }
            }
            PrimeValue::List(l) => small_or_dense(l.len()),
            PrimeValue::Set(s) => small_or_dense(s.len()),
            PrimeValue::ZSet(z) => small_or_dense(z.len()),
            PrimeValue::Hash(h) => small_or_dense(h.len()),
            PrimeValue::Json(_) | PrimeValue::Document(_) => Encoding::Dense,
        }
    }
}

fn small_or_dense(len: usize) -> Encoding {
    if len <= LISTPACK_MAX_ENTRIES {
        Encoding::ListPack
    } else {
        Encoding::Dense
    }
}

/// A value may be offloaded to tiered disk, in which case only a
/// `(offset, length)` reference is charged to memory accounting. The tiered
/// store itself lives elsewhere; this is just the reference shape DbSlice
/// threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalRef {
    pub offset: u64,
    pub length: u64,
}

/// Either a resident value or a reference to one offloaded to tiered disk.
pub enum Payload {
    Resident(PrimeValue),
    External(ExternalRef),
}

impl Payload {
    pub fn as_resident(&self) -> Option<&PrimeValue> {
        match self {
            Payload::Resident(v) => Some(v),
            Payload::External(_) => None,
        }
    }

    pub fn as_resident_mut(&mut self) -> Option<&mut PrimeValue> {
        match self {
            Payload::Resident(v) => Some(v),
            Payload::External(_) => None,
        }
    }
}

/// `f64` wrapper giving sorted-set scores a total order via `total_cmp`, so
/// they can sit inside a `RankIndex` without requiring `Ord`/`Eq` on `f64`
/// itself (NaN scores are rejected before they ever reach a `ZSet`).
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedScore(f64);

fn zset_cmp(a: &(OrderedScore, Vec<u8>), b: &(OrderedScore, Vec<u8>)) -> std::cmp::Ordering {
    a.0 .0.total_cmp(&b.0 .0).then_with(|| a.1.cmp(&b.1))
}

/// Ordered set of (score, member) pairs. Maintains two indices in
/// lock-step: `scores` for O(1) member->score lookup, and `order` (a
/// `kineta-rank-index::RankIndex`) for O(log n) rank/range queries over
/// `(score, member)` pairs.
pub struct ZSet {
    scores: DenseHashTable<Vec<u8>, f64>,
    order: RankIndex<(OrderedScore, Vec<u8>), fn(&(OrderedScore, Vec<u8>), &(OrderedScore, Vec<u8>)) -> std::cmp::Ordering>,
}

impl Default for ZSet {
    fn default() -> Self {
        ZSet {
            scores: DenseHashTable::new(),
            order: RankIndex::new(zset_cmp),
        }
    }
}

impl ZSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert or update `member`'s score. Returns `true` if `member` is new.
    pub fn insert(&mut self, member: Vec<u8>, score: f64) -> bool {
        let is_new = match self.scores.find(&member) {
            Some(&old) => {
                self.order.remove(&(OrderedScore(old), member.clone()));
                false
            }
            None => true,
        };
        self.scores.insert(member.clone(), score);
        self.order.insert((OrderedScore(score), member));
        is_new
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.find(&member.to_vec()) {
            Some(&score) => {
                self.scores.remove(&member.to_vec());
                self.order.remove(&(OrderedScore(score), member.to_vec()));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.find(&member.to_vec()).copied()
    }

    /// 0-based position in ascending `(score, member)` order.
    pub fn rank(&self, member: &[u8]) -> Option<usize> {
        let score = self.score(member)?;
        self.order.rank(&(OrderedScore(score), member.to_vec()))
    }

    pub fn at_rank(&self, rank: usize) -> Option<(&[u8], f64)> {
        self.order.at_rank(rank).map(|(s, m)| (m.as_slice(), s.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zset_tracks_rank_across_score_updates() {
        let mut z = ZSet::new();
        assert!(z.insert(b"a".to_vec(), 5.0));
        assert!(z.insert(b"b".to_vec(), 1.0));
        assert!(z.insert(b"c".to_vec(), 3.0));
        assert_eq!(z.rank(b"b"), Some(0));
        assert_eq!(z.rank(b"c"), Some(1));
        assert_eq!(z.rank(b"a"), Some(2));

        // Re-scoring is not a new member, but does move its rank.
        assert!(!z.insert(b"b".to_vec(), 10.0));
        assert_eq!(z.len(), 3);
        assert_eq!(z.rank(b"b"), Some(2));
        assert_eq!(z.rank(b"c"), Some(0));
    }

    #[test]
    fn zset_remove_then_absent() {
        let mut z = ZSet::new();
        z.insert(b"x".to_vec(), 1.0);
        assert!(z.remove(b"x"));
        assert!(!z.remove(b"x"));
        assert_eq!(z.score(b"x"), None);
    }

    #[test]
    fn at_rank_roundtrips_with_rank() {
        let mut z = ZSet::new();
        for (m, s) in [("a", 3.0), ("b", 1.0), ("c", 2.0)] {
            z.insert(m.as_bytes().to_vec(), s);
        }
        let r = z.rank(b"c").unwrap();
        assert_eq!(z.at_rank(r), Some((&b"c"[..], 2.0)));
    }

    #[test]
    fn encoding_reports_int_packed_for_short_numeric_strings() {
        let v = PrimeValue::Str(b"12345".to_vec());
        assert_eq!(v.encoding(), Encoding::IntPacked);
        let v = PrimeValue::Str(b"hello".to_vec());
        assert_eq!(v.encoding(), Encoding::Dense);
    }
}
