//! Collapses a run of adjacent, single-shard, non-transactional,
//! non-blocking pipeline commands into one cross-shard hop per touched
//! shard. Each shard runs its assigned sub-commands in arrival order
//! against a shared reply builder; replies are then re-interleaved back
//! into pipeline order.

use kineta_base::{Result, ShardId};
use kineta_engine_shard::ShardState;

use crate::router::Router;

/// At most this many sub-commands run per shard in a single squashed hop,
/// bounding how long a shard is held and how many entries pile up behind a
/// single inter-shard channel send.
pub const MAX_SUBCOMMANDS_PER_SHARD: usize = 32;

/// One already-routed queued command: its owning shard plus a closure that
/// runs it against that shard's state and produces a reply, type-erased as
/// `R` so the squasher stays generic over the caller's reply type.
pub struct Squashable<R> {
    pub shard: ShardId,
    pub run: Box<dyn FnOnce(&mut ShardState) -> R + Send>,
}

/// Runs `batch` as a sequence of squashed hops, at most
/// [`MAX_SUBCOMMANDS_PER_SHARD`] sub-commands per shard per hop, and
/// returns replies in the same order `batch` was given in.
///
/// `abort_on_error` implements the MULTI/EXEC rule: once a sub-command's
/// reply satisfies `is_err`, every sub-command still pending in this call
/// (on any shard, including ones already dispatched this round) has its
/// reply replaced by `on_discarded` instead.
pub async fn run_squashed<R>(
    router: &Router,
    batch: Vec<Squashable<R>>,
    abort_on_error: bool,
    is_err: impl Fn(&R) -> bool + Clone + Send + 'static,
    on_discarded: impl Fn() -> R + Clone + Send + 'static,
) -> Result<Vec<R>>
where
    R: Send + 'static,
{
    let len = batch.len();
    let mut slots: Vec<Option<Squashable<R>>> = batch.into_iter().map(Some).collect();
    let mut results: Vec<Option<R>> = (0..len).map(|_| None).collect();
    let mut aborted = false;

    let mut chunk_start = 0;
    while chunk_start < len {
        let chunk_end = (chunk_start + MAX_SUBCOMMANDS_PER_SHARD.max(1)).min(len);

        if aborted {
            for slot in results.iter_mut().take(chunk_end).skip(chunk_start) {
                *slot = Some(on_discarded());
            }
            chunk_start = chunk_end;
            continue;
        }

        // Partition this chunk by shard, preserving arrival order within
        // each shard's sub-batch.
        let mut by_shard: Vec<(ShardId, Vec<(usize, Box<dyn FnOnce(&mut ShardState) -> R + Send>)>)> = Vec::new();
        for idx in chunk_start..chunk_end {
            let item = slots[idx].take().expect("each slot consumed exactly once");
            match by_shard.iter_mut().find(|(shard, _)| *shard == item.shard) {
                Some((_, subs)) => subs.push((idx, item.run)),
                None => by_shard.push((item.shard, vec![(idx, item.run)])),
            }
        }

        let mut handles = Vec::with_capacity(by_shard.len());
        for (shard, subs) in by_shard {
            let is_err = is_err.clone();
            let on_discarded = on_discarded.clone();
            handles.push(router.dispatch_to_shard(shard, move |state: &mut ShardState| {
                // Once one sub-command in this shard's arrival-ordered run
                // errors, the rest of its sub-batch is discarded without
                // running.
                let mut shard_aborted = false;
                subs.into_iter()
                    .map(|(idx, run)| {
                        if shard_aborted {
                            (idx, on_discarded())
                        } else {
                            let value = run(state);
                            if abort_on_error && is_err(&value) {
                                shard_aborted = true;
                            }
                            (idx, value)
                        }
                    })
                    .collect::<Vec<_>>()
            }));
        }

        for handle in handles {
            for (idx, value) in handle.await? {
                if abort_on_error && is_err(&value) {
                    aborted = true;
                }
                results[idx] = Some(value);
            }
        }

        if aborted {
            for slot in results.iter_mut().take(chunk_end).skip(chunk_start) {
                if slot.is_none() {
                    *slot = Some(on_discarded());
                }
            }
        }

        chunk_start = chunk_end;
    }

    Ok(results.into_iter().map(|r| r.expect("every index filled exactly once")).collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use kineta_base::ShardId;
    use kineta_coroutines::HopQueue;
    use kineta_db_slice::PrimeValue;
    use kineta_engine_shard::EngineShard;

    fn spawn_shard(id: u32, shard_cnt: u32) -> kineta_coroutines::HopSender<EngineShard> {
        let (mut queue, sender) = HopQueue::new();
        let mut shard = EngineShard::new(ShardId(id), shard_cnt, 1, 64);
        tokio::spawn(async move { while queue.recv_one(&mut shard).await {} });
        sender
    }

    #[tokio::test]
    async fn squashes_single_key_commands_across_two_shards() {
        let router = Router::new(vec![spawn_shard(0, 2), spawn_shard(1, 2)]);

        let batch = vec![
            Squashable {
                shard: router.shard_for(b"a"),
                run: Box::new(|state: &mut ShardState| {
                    let (guard, _) = state.db.add_or_find(0, b"a", || PrimeValue::Str(b"1".to_vec()));
                    guard.commit();
                    "OK".to_string()
                }),
            },
            Squashable {
                shard: router.shard_for(b"b"),
                run: Box::new(|state: &mut ShardState| {
                    let (guard, _) = state.db.add_or_find(0, b"b", || PrimeValue::Str(b"2".to_vec()));
                    guard.commit();
                    "OK".to_string()
                }),
            },
        ];

        let replies = run_squashed(&router, batch, false, |r| r == "ERR", || "DISCARDED".to_string()).await.unwrap();
        assert_eq!(replies, vec!["OK".to_string(), "OK".to_string()]);
    }

    #[tokio::test]
    async fn aborts_remaining_replies_after_an_error_when_abort_on_error_is_set() {
        let router = Router::new(vec![spawn_shard(0, 1)]);

        let batch = vec![
            Squashable { shard: ShardId(0), run: Box::new(|_state: &mut ShardState| "ERR".to_string()) },
            Squashable { shard: ShardId(0), run: Box::new(|_state: &mut ShardState| "OK".to_string()) },
        ];

        let replies = run_squashed(&router, batch, true, |r| r == "ERR", || "DISCARDED".to_string()).await.unwrap();
        assert_eq!(replies[0], "ERR");
        assert_eq!(replies[1], "DISCARDED");
    }
}
