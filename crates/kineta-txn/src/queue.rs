//! The per-shard transaction priority queue — a min-priority queue on
//! TxId — plus the out-of-order admission rule: a read-only transaction
//! may leapfrog a blocked head-of-queue write it doesn't conflict with.

use std::collections::BTreeMap;

use kineta_base::TxId;

#[derive(Debug, Clone)]
pub struct QueuedTx {
    pub tx_id: TxId,
    pub read_only: bool,
    pub keys: Vec<Vec<u8>>,
}

/// A `BTreeMap` keyed by `TxId` already gives ascending-TxId iteration and
/// O(log n) head removal, so it doubles as the min-priority queue without a
/// separate heap type.
#[derive(Default)]
pub struct ShardQueue {
    entries: BTreeMap<TxId, QueuedTx>,
}

impl ShardQueue {
    pub fn new() -> Self {
        ShardQueue::default()
    }

    pub fn push(&mut self, tx: QueuedTx) {
        self.entries.insert(tx.tx_id, tx);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peek_head_id(&self) -> Option<TxId> {
        self.entries.keys().next().copied()
    }

    /// Removes and returns the next transaction to run. If the head isn't
    /// reported blocked by `is_blocked` (e.g. a multi-hop write still
    /// waiting on another shard), it simply runs next in TxId order. If the
    /// head *is* blocked, a later-queued read-only transaction may leapfrog
    /// it provided its keys don't overlap any write queued strictly ahead
    /// of it — blocked or not.
    pub fn pop_ready(&mut self, is_blocked: impl Fn(TxId) -> bool) -> Option<QueuedTx> {
        let head_id = self.peek_head_id()?;
        if !is_blocked(head_id) {
            return self.entries.remove(&head_id);
        }

        let candidate = self.entries.iter().find_map(|(&id, tx)| {
            if id == head_id || !tx.read_only {
                return None;
            }
            let conflicts = self
                .entries
                .range(..id)
                .any(|(_, other)| !other.read_only && keys_overlap(&other.keys, &tx.keys));
            (!conflicts).then_some(id)
        });

        candidate.and_then(|id| self.entries.remove(&id))
    }
}

fn keys_overlap(a: &[Vec<u8>], b: &[Vec<u8>]) -> bool {
    a.iter().any(|k| b.contains(k))
}
