//! Drives the per-shard snapshot producers from the coordinating side: one
//! begin hop registers the change callback, repeated step hops each walk a
//! bounded number of buckets and hand back encoded bytes, and a finish hop
//! drains the last out-of-turn records. Ordinary command hops run in
//! between steps, which is what keeps a dump from starving foreground
//! traffic. The loader and journal replay live here too, since they are
//! the read side of the same formats.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use kineta_base::{Error, Result, ShardId};
use kineta_engine_shard::{ActiveSnapshot, ShardState};
use kineta_persist::{
    apply_record, decode_entries, encode_entry, JournalOpcode, JournalRecord, SnapshotEntry, SnapshotProducer,
    SnapshotRecord, SNAPSHOT_FORMAT_VERSION,
};
use tokio::io::AsyncWriteExt;

use crate::commands::apply;
use crate::context::ServerContext;
use crate::router::Router;
use crate::unix_ms;

/// Accumulated snapshot bytes are flushed to the sink once a step's output
/// crosses this size.
const SNAPSHOT_CHUNK_BYTES: usize = 256 * 1024;

/// Buckets walked per step hop, per database.
const BUCKETS_PER_STEP: usize = 64;

fn codec_err(error: serde_json::Error) -> Error {
    Error::Codec(error.to_string())
}

/// Dumps every shard's databases into one snapshot file, returning its
/// path. Concurrent writes proceed normally; a key mutated mid-dump is
/// captured out-of-turn with its pre-mutation value.
pub async fn save_snapshot(ctx: &Arc<ServerContext>) -> Result<PathBuf> {
    let config = ctx.config();
    let now_secs = (unix_ms() / 1000) as u64;
    let file_name = config.snapshot_template.replace("{ts}", &now_secs.to_string());
    let path = config.snapshot_dir.join(file_name);

    let mut file = tokio::fs::File::create(&path).await?;
    let mut header = Vec::new();
    encode_entry(&SnapshotEntry::Header { version: SNAPSHOT_FORMAT_VERSION }, &mut header).map_err(codec_err)?;
    file.write_all(&header).await?;

    for shard in 0..ctx.router.num_shards() {
        dump_one_shard(&ctx.router, ShardId(shard), &mut file).await?;
    }

    let mut cut = Vec::new();
    encode_entry(&SnapshotEntry::Cut, &mut cut).map_err(codec_err)?;
    file.write_all(&cut).await?;
    file.flush().await?;

    ctx.last_save.store(now_secs, Ordering::Relaxed);
    Ok(path)
}

/// One shard's dump. Each `dispatch_to_shard` call below is its own hop,
/// and the window between hops is where foreground command hops run on
/// the shard.
async fn dump_one_shard(router: &Router, shard: ShardId, file: &mut tokio::fs::File) -> Result<()> {
    let began = router
        .dispatch_to_shard(shard, |state: &mut ShardState| {
            if state.snapshot.is_some() {
                return false;
            }
            let producer = SnapshotProducer::start(&mut state.db);
            state.snapshot = Some(ActiveSnapshot { producer });
            true
        })
        .await?;
    if !began {
        return Err(Error::Codec("a snapshot is already in progress on this shard".to_string()));
    }

    let mut pending = Vec::new();
    loop {
        let (bytes, done) = router.dispatch_to_shard(shard, step_snapshot).await?;
        pending.extend_from_slice(&bytes);
        if pending.len() >= SNAPSHOT_CHUNK_BYTES {
            file.write_all(&pending).await?;
            pending.clear();
        }
        if done {
            break;
        }
    }

    let tail = router.dispatch_to_shard(shard, finish_snapshot).await?;
    pending.extend_from_slice(&tail);
    file.write_all(&pending).await?;
    Ok(())
}

/// Walks a bounded number of buckets of every database, encoding each
/// emitted record plus anything the change callback serialized out-of-turn
/// since the last step. Returns the encoded bytes and whether the walk is
/// done.
fn step_snapshot(state: &mut ShardState) -> (Vec<u8>, bool) {
    let Some(mut snap) = state.snapshot.take() else {
        return (Vec::new(), true);
    };
    let now = unix_ms();
    let mut buf = Vec::new();
    let mut done = true;
    for db in 0..state.db.num_dbs() {
        for _ in 0..BUCKETS_PER_STEP {
            let db_done = snap.producer.scan_one_bucket(&mut state.db, db, now, &mut |record| {
                encode_or_warn(&SnapshotEntry::Record(record), &mut buf);
            });
            if db_done {
                break;
            }
            done = false;
        }
    }
    snap.producer.drain_out_of_turn(&mut |record| {
        encode_or_warn(&SnapshotEntry::Record(record), &mut buf);
    });
    state.snapshot = Some(snap);
    (buf, done)
}

/// Unregisters the change callback and drains the last out-of-turn
/// records. The per-shard cut marker is dropped here; the combined file
/// carries a single terminal cut written by the coordinator.
fn finish_snapshot(state: &mut ShardState) -> Vec<u8> {
    let Some(snap) = state.snapshot.take() else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    snap.producer.finish(&mut state.db, &mut |entry| {
        if let SnapshotEntry::Record(_) = &entry {
            encode_or_warn(&entry, &mut buf);
        }
    });
    buf
}

fn encode_or_warn(entry: &SnapshotEntry, buf: &mut Vec<u8>) {
    if let Err(error) = encode_entry(entry, buf) {
        tracing::warn!(%error, "dropping unencodable snapshot entry");
    }
}

/// Loads a snapshot file, routing every record to the shard that owns its
/// key. Returns the number of records applied.
pub async fn load_snapshot(router: &Router, path: &Path) -> Result<usize> {
    let bytes = tokio::fs::read(path).await?;
    let entries = decode_entries(&bytes).map_err(codec_err)?;

    match entries.first() {
        Some(SnapshotEntry::Header { version: SNAPSHOT_FORMAT_VERSION }) => {}
        Some(SnapshotEntry::Header { version }) => {
            return Err(Error::Codec(format!("unsupported snapshot version {version}")));
        }
        _ => return Err(Error::Codec("snapshot stream is missing its header".to_string())),
    }
    if !matches!(entries.last(), Some(SnapshotEntry::Cut)) {
        return Err(Error::Codec("snapshot stream is missing its terminal cut marker".to_string()));
    }

    // Group records per owning shard so each shard gets one apply hop.
    let mut per_shard: Vec<Vec<SnapshotRecord>> = (0..router.num_shards()).map(|_| Vec::new()).collect();
    let mut total = 0usize;
    for entry in entries {
        if let SnapshotEntry::Record(record) = entry {
            let shard = router.shard_for(&record.key);
            per_shard[shard.0 as usize].push(record);
            total += 1;
        }
    }

    for (shard, records) in per_shard.into_iter().enumerate() {
        if records.is_empty() {
            continue;
        }
        router
            .dispatch_to_shard(ShardId(shard as u32), move |state: &mut ShardState| {
                for record in records {
                    apply_record(&mut state.db, record);
                }
            })
            .await?;
    }
    Ok(total)
}

/// Applies one source shard's journal suffix on top of loaded state: write
/// commands re-run through the ordinary interpreter, flushes clear the
/// corresponding local shard, expirations become deletes, and the marker
/// opcodes are skipped. This is the replica side of `KINETA JOURNAL`
/// incremental resync; `source_shard` is the shard the records came from,
/// which owns every key they touch.
pub async fn replay_journal(router: &Router, source_shard: ShardId, records: Vec<JournalRecord>) -> Result<usize> {
    let mut applied = 0usize;
    for record in records {
        let db = record.db_index as usize;
        match record.opcode {
            JournalOpcode::Command | JournalOpcode::MultiCommand => {
                let name = record.payload.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
                if name == b"FLUSHDB" || name == b"FLUSHALL" {
                    let scope_all = name == b"FLUSHALL";
                    router
                        .dispatch_to_shard(source_shard, move |state: &mut ShardState| {
                            state.db.flush_db(if scope_all {
                                kineta_db_slice::FlushScope::All
                            } else {
                                kineta_db_slice::FlushScope::One(db)
                            });
                        })
                        .await?;
                    applied += 1;
                    continue;
                }
                let Some(key) = record.payload.get(1) else { continue };
                let shard = router.shard_for(key);
                let argv = record.payload;
                let now = unix_ms();
                router
                    .dispatch_to_shard(shard, move |state: &mut ShardState| {
                        apply(state, db, now, &argv, false);
                    })
                    .await?;
                applied += 1;
            }
            JournalOpcode::Expired => {
                let Some(key) = record.payload.first() else { continue };
                let shard = router.shard_for(key);
                let key = key.clone();
                router
                    .dispatch_to_shard(shard, move |state: &mut ShardState| {
                        state.db.delete(db, &key);
                    })
                    .await?;
                applied += 1;
            }
            JournalOpcode::Noop | JournalOpcode::Select | JournalOpcode::Exec | JournalOpcode::Ping | JournalOpcode::Fin => {}
        }
    }
    Ok(applied)
}
