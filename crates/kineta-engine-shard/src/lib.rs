//! One shard's event loop: owns a `DbSlice`, its journal, a transaction
//! priority queue, and runs periodic maintenance between transactions.
//! Shards never share mutable state; the only thing that crosses a shard
//! boundary is a [`kineta_coroutines::HopSender`] closure, and the shard's
//! own driver thread is the only one that ever runs those closures.

use std::collections::HashMap;

use kineta_base::{Lsn, ShardId, SlotId, TxId};
use kineta_db_slice::DbSlice;
use kineta_persist::{Journal, JournalOpcode, JournalRecord, SnapshotProducer};
use kineta_txn::{QueuedTx, ShardQueue};

/// Runs a due round of periodic maintenance every this many ticks.
const MAINTENANCE_INTERVAL_TICKS: u32 = 64;

/// How many expiration-table entries a single maintenance round samples.
const EXPIRE_SAMPLE_SIZE: usize = 32;

/// Journal ring capacity per shard, in records.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 16 * 1024;

/// A per-shard callback invoked for one hop of a transaction. Returns
/// `true` if this was the transaction's concluding hop.
pub type HopCallback = Box<dyn FnMut(&mut ShardState) -> bool + Send>;

#[derive(Debug, Default, Clone, Copy)]
pub struct ShardStats {
    pub hops_run: u64,
    pub inline_dispatches: u64,
    pub maintenance_rounds: u64,
    pub keys_expired_by_sweep: u64,
}

/// A snapshot scan in flight on this shard, carried across hops so that
/// foreground traffic can interleave with the bucket walk.
pub struct ActiveSnapshot {
    pub producer: SnapshotProducer,
}

/// The state a hop closure runs against: everything on the shard except
/// the queue machinery itself (which is busy calling the closure).
pub struct ShardState {
    pub id: ShardId,
    pub shard_cnt: u32,
    pub db: DbSlice,
    pub journal: Journal,
    pub snapshot: Option<ActiveSnapshot>,
    pub stats: ShardStats,
}

impl ShardState {
    /// Appends a write command to this shard's journal. The slot is derived
    /// from the command's first key argument when it has one.
    pub fn journal_command(&mut self, db: usize, argv: &[Vec<u8>]) -> Lsn {
        self.append_command(JournalOpcode::Command, db, argv)
    }

    /// Appends one command of a MULTI/EXEC block; the block must be closed
    /// with [`ShardState::journal_exec`].
    pub fn journal_multi_command(&mut self, db: usize, argv: &[Vec<u8>]) -> Lsn {
        self.append_command(JournalOpcode::MultiCommand, db, argv)
    }

    pub fn journal_exec(&mut self, db: usize) -> Lsn {
        let shard_cnt = self.shard_cnt;
        self.journal.append(|lsn| JournalRecord {
            lsn,
            opcode: JournalOpcode::Exec,
            db_index: db as u32,
            shard_cnt,
            slot: None,
            payload: Vec::new(),
        })
    }

    fn append_command(&mut self, opcode: JournalOpcode, db: usize, argv: &[Vec<u8>]) -> Lsn {
        let shard_cnt = self.shard_cnt;
        let slot = argv.get(1).map(|key| SlotId::of_key(key).0);
        let payload = argv.to_vec();
        self.journal.append(|lsn| JournalRecord {
            lsn,
            opcode,
            db_index: db as u32,
            shard_cnt,
            slot,
            payload,
        })
    }

    fn journal_expired(&mut self, db: usize, key: Vec<u8>) {
        let shard_cnt = self.shard_cnt;
        let slot = Some(SlotId::of_key(&key).0);
        self.journal.append(|lsn| JournalRecord {
            lsn,
            opcode: JournalOpcode::Expired,
            db_index: db as u32,
            shard_cnt,
            slot,
            payload: vec![key],
        });
    }
}

/// What happened on one call to [`EngineShard::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No transaction was ready to run.
    Idle,
    /// A hop ran but the transaction has more hops remaining.
    HopRan(TxId),
    /// A hop ran and concluded the transaction.
    Concluded(TxId),
}

pub struct EngineShard {
    pub state: ShardState,
    queue: ShardQueue,
    callbacks: HashMap<TxId, HopCallback>,
    ticks_since_maintenance: u32,
}

impl EngineShard {
    pub fn new(id: ShardId, shard_cnt: u32, num_dbs: usize, journal_capacity: usize) -> EngineShard {
        EngineShard {
            state: ShardState {
                id,
                shard_cnt,
                db: DbSlice::new(num_dbs),
                journal: Journal::new(journal_capacity),
                snapshot: None,
                stats: ShardStats::default(),
            },
            queue: ShardQueue::new(),
            callbacks: HashMap::new(),
            ticks_since_maintenance: 0,
        }
    }

    /// Pushes a transaction's hop onto this shard's queue; it runs once it
    /// becomes head and its prerequisites clear.
    pub fn schedule(&mut self, queued: QueuedTx, callback: HopCallback) {
        let tx_id = queued.tx_id;
        self.queue.push(queued);
        self.callbacks.insert(tx_id, callback);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// One iteration of the event loop: pop the next ready transaction (if
    /// any), run its hop, then run periodic maintenance if due.
    /// `is_blocked` lets the caller report a multi-shard transaction's
    /// head-of-queue entry as not-yet-runnable (waiting on another shard),
    /// enabling out-of-order admission of a disjoint read behind it.
    pub fn tick(&mut self, now_ms: i64, is_blocked: impl Fn(TxId) -> bool) -> TickOutcome {
        let outcome = match self.queue.pop_ready(is_blocked) {
            None => TickOutcome::Idle,
            Some(queued) => {
                let tx_id = queued.tx_id;
                let Some(mut callback) = self.callbacks.remove(&tx_id) else {
                    tracing::error!(?tx_id, "popped a queued transaction with no registered callback");
                    return TickOutcome::Idle;
                };
                let conclude = callback(&mut self.state);
                self.state.stats.hops_run += 1;
                if conclude {
                    TickOutcome::Concluded(tx_id)
                } else {
                    // Still head-of-queue for its remaining hops: put the
                    // callback back, but not the queue entry itself — the
                    // coordinator re-pushes it for the next hop once the
                    // other shards in this transaction have also run.
                    self.callbacks.insert(tx_id, callback);
                    TickOutcome::HopRan(tx_id)
                }
            }
        };

        self.ticks_since_maintenance += 1;
        if self.ticks_since_maintenance >= MAINTENANCE_INTERVAL_TICKS {
            self.ticks_since_maintenance = 0;
            self.run_maintenance(now_ms);
        }

        outcome
    }

    /// Drives the transaction queue until no more work is ready, returning
    /// the number of hops run. Called by the shard's driver after draining
    /// cross-shard hops, so freshly scheduled transactions run promptly.
    pub fn run_ready(&mut self, now_ms: i64) -> usize {
        let mut ran = 0;
        while !matches!(self.tick(now_ms, |_| false), TickOutcome::Idle) {
            ran += 1;
        }
        ran
    }

    fn run_maintenance(&mut self, now_ms: i64) {
        self.state.stats.maintenance_rounds += 1;
        for db in 0..self.state.db.num_dbs() {
            let evicted = self.state.db.sweep_expired(db, now_ms, EXPIRE_SAMPLE_SIZE);
            self.state.stats.keys_expired_by_sweep += evicted.len() as u64;
            for key in evicted {
                self.state.journal_expired(db, key);
            }
        }
        // Heap defragmentation is an allocator concern the global allocator
        // exposes no incremental hook for; the maintenance slot for it
        // stays a no-op rather than a fabricated call.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kineta_base::TxId;
    use kineta_txn::QueuedTx;

    fn shard() -> EngineShard {
        EngineShard::new(ShardId(0), 1, 1, 64)
    }

    #[test]
    fn tick_runs_the_head_transaction_and_reports_conclusion() {
        let mut shard = shard();
        shard.schedule(
            QueuedTx { tx_id: TxId(1), read_only: false, keys: vec![b"k".to_vec()] },
            Box::new(|state| {
                let (guard, _) = state.db.add_or_find(0, b"k", || kineta_db_slice::PrimeValue::Str(b"v".to_vec()));
                guard.commit();
                true
            }),
        );

        let outcome = shard.tick(0, |_| false);
        assert_eq!(outcome, TickOutcome::Concluded(TxId(1)));
        assert!(shard.state.db.find(0, b"k", 0).is_some());
        assert_eq!(shard.state.stats.hops_run, 1);
    }

    #[test]
    fn multi_hop_transaction_keeps_its_callback_until_concluded() {
        let mut shard = shard();
        let mut hop = 0;
        shard.schedule(
            QueuedTx { tx_id: TxId(1), read_only: false, keys: vec![b"k".to_vec()] },
            Box::new(move |_state| {
                hop += 1;
                hop >= 2
            }),
        );

        assert_eq!(shard.tick(0, |_| false), TickOutcome::HopRan(TxId(1)));
        // Head-of-queue for the next hop: re-push since the queue entry
        // itself was consumed by pop_ready.
        let cb = match shard.callbacks.remove(&TxId(1)) {
            Some(cb) => cb,
            None => unreachable!(),
        };
        shard.schedule(QueuedTx { tx_id: TxId(1), read_only: false, keys: vec![b"k".to_vec()] }, cb);
        assert_eq!(shard.tick(0, |_| false), TickOutcome::Concluded(TxId(1)));
    }

    #[test]
    fn maintenance_sweep_journals_expired_keys() {
        let mut shard = shard();
        let (guard, _) = shard.state.db.add_or_find(0, b"k", || kineta_db_slice::PrimeValue::Str(b"v".to_vec()));
        guard.commit();
        shard.state.db.set_expiry(0, b"k", 5);

        for _ in 0..MAINTENANCE_INTERVAL_TICKS {
            shard.tick(100, |_| false);
        }
        assert_eq!(shard.state.stats.maintenance_rounds, 1);
        assert!(shard.state.db.find(0, b"k", 100).is_none());

        assert!(shard.state.journal.len() >= 1, "the sweep should have produced an Expired record");
    }

    #[test]
    fn run_ready_drains_every_scheduled_transaction() {
        let mut shard = shard();
        for id in 1..=3u64 {
            shard.schedule(
                QueuedTx { tx_id: TxId(id), read_only: false, keys: vec![format!("k{id}").into_bytes()] },
                Box::new(|_state| true),
            );
        }
        assert_eq!(shard.run_ready(0), 3);
        assert!(shard.is_queue_empty());
    }
}
