use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing identifier assigned to a transaction at
/// scheduling time. Transactions on the same shard execute in `TxId`
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub u64);

/// Monotonically increasing identifier stamped on each journal record.
/// LSNs are strictly increasing per shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

/// A per-process monotonic counter handing out `TxId`s. One instance is
/// shared (as an `Arc`) by every connection's coordinator.
#[derive(Debug, Default)]
pub struct TxIdSource(AtomicU64);

impl TxIdSource {
    pub fn new() -> Self {
        TxIdSource(AtomicU64::new(1))
    }

    /// Obtain the next TxId. Relaxed ordering suffices: uniqueness and
    /// monotonicity come from the atomic fetch-add itself, not from any
    /// happens-before relationship with other memory.
    pub fn next(&self) -> TxId {
        TxId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}
