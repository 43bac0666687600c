//! Assigns TxIds and computes the shard set a transaction's keys touch.

use std::sync::Arc;

use kineta_base::{shard_of, ShardId, TxIdSource};

use crate::transaction::{Transaction, TxMode};

/// Shared across every connection on the process; hands out monotonically
/// increasing TxIds from one per-process counter.
pub struct Coordinator {
    ids: Arc<TxIdSource>,
    num_shards: u32,
}

impl Coordinator {
    pub fn new(ids: Arc<TxIdSource>, num_shards: u32) -> Self {
        Coordinator { ids, num_shards }
    }

    /// The shard set touched by `keys`, deduplicated. A "global"
    /// transaction (e.g. `FLUSHALL`) should call [`Coordinator::begin_global`]
    /// instead of computing this itself.
    pub fn shards_for_keys(&self, keys: &[Vec<u8>]) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = keys.iter().map(|k| shard_of(k, self.num_shards)).collect();
        shards.sort_by_key(|s| s.0);
        shards.dedup();
        shards
    }

    /// Begins a transaction scoped to the shards `keys` touch.
    pub fn begin(&self, keys: &[Vec<u8>], read_only: bool) -> Transaction {
        let shards = self.shards_for_keys(keys);
        let mode = if shards.len() == 1 { TxMode::Inline } else { TxMode::Queued };
        Transaction::new(self.ids.next(), shards, mode, read_only)
    }

    /// Begins a global transaction touching every shard: `FLUSHALL`,
    /// snapshot coordination.
    pub fn begin_global(&self) -> Transaction {
        let shards = (0..self.num_shards).map(ShardId).collect();
        Transaction::new(self.ids.next(), shards, TxMode::Global, false)
    }
}
