//! Maps a key (or set of keys) to the shard(s) that own it and submits a
//! closure there via [`kineta_coroutines::HopSender`]. This is the seam
//! between the wire-protocol layer and the engine shards: a single-shard
//! command never enters the per-shard transaction queue, it hops straight
//! to the owning shard and runs once that shard's queued work has drained.

use kineta_base::{shard_of, Error, Result, ShardId};
use kineta_coroutines::HopSender;
use kineta_engine_shard::{EngineShard, ShardState};

use crate::unix_ms;

#[derive(Clone)]
pub struct Router {
    shards: Vec<HopSender<EngineShard>>,
}

impl Router {
    pub fn new(shards: Vec<HopSender<EngineShard>>) -> Self {
        Router { shards }
    }

    pub fn num_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        shard_of(key, self.num_shards())
    }

    /// Run `f` against the state of the single shard that owns `key`. If
    /// the shard has queued transactions, they are drained first so this
    /// dispatch cannot observe state from before a lower-TxId write; an
    /// empty queue is the inline fast path.
    pub async fn dispatch_single<F, R>(&self, key: &[u8], f: F) -> Result<R>
    where
        F: FnOnce(&mut ShardState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let shard = self.shard_for(key);
        self.dispatch_to_shard(shard, f).await
    }

    /// Hands a closure straight to `shard_id`, bypassing key-based routing.
    /// Used by the squasher and the cluster-aware dispatch path, both of
    /// which have already resolved the owning shard themselves.
    pub async fn dispatch_to_shard<F, R>(&self, shard_id: ShardId, f: F) -> Result<R>
    where
        F: FnOnce(&mut ShardState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let sender = self.shards.get(shard_id.0 as usize).ok_or(Error::ShardGone)?;
        sender
            .call(move |shard: &mut EngineShard| {
                if shard.is_queue_empty() {
                    shard.state.stats.inline_dispatches += 1;
                } else {
                    shard.run_ready(unix_ms());
                }
                let out = f(&mut shard.state);
                shard.state.stats.hops_run += 1;
                out
            })
            .await
            .map_err(|_| Error::ShardGone)
    }

    /// Access the whole [`EngineShard`] — queue machinery included — on the
    /// owning thread. Used to schedule queued transactions (MULTI/EXEC) and
    /// by the shard driver's own maintenance plumbing.
    pub async fn with_shard<F, R>(&self, shard_id: ShardId, f: F) -> Result<R>
    where
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
        R: Send + 'static,
    {
        let sender = self.shards.get(shard_id.0 as usize).ok_or(Error::ShardGone)?;
        sender.call(f).await.map_err(|_| Error::ShardGone)
    }

    /// Runs `f` on every shard in shard-id order, collecting the results.
    /// This is the building block for global operations (`FLUSHALL`,
    /// `DBSIZE`, snapshot coordination).
    pub async fn broadcast<F, R>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(&mut ShardState) -> R + Clone + Send + 'static,
        R: Send + 'static,
    {
        let mut out = Vec::with_capacity(self.shards.len());
        for shard in 0..self.num_shards() {
            let f = f.clone();
            out.push(self.dispatch_to_shard(ShardId(shard), f).await?);
        }
        Ok(out)
    }
}
