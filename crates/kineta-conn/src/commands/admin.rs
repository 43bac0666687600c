//! The administrative command surface: introspection (`INFO`, `DBSIZE`,
//! `SCAN`), runtime configuration (`CONFIG`), session management
//! (`CLIENT`), cluster topology (`CLUSTER`), persistence (`SAVE`,
//! `BGSAVE`), and the journal-resync endpoint replicas use.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use kineta_base::{Lsn, Result, ShardId};
use kineta_engine_shard::ShardState;
use kineta_hash_table::Cursor;
use kineta_persist::encode_record;
use kineta_wire::RespValue;

use crate::context::{ConnectionContext, ServerContext};
use crate::persistence;
use crate::unix_ms;

use super::{err_syntax, glob_match, upper_name};

/// Top 16 bits of a `SCAN` cursor select the shard; the rest is that
/// shard's own resumable table cursor.
const SCAN_SHARD_SHIFT: u32 = 48;
const SCAN_LOCAL_MASK: u64 = (1u64 << SCAN_SHARD_SHIFT) - 1;

/// Default number of buckets one `SCAN` call walks.
const SCAN_DEFAULT_COUNT: usize = 10;

pub async fn execute(ctx: &Arc<ServerContext>, conn: &mut ConnectionContext, name: &str, args: Vec<Vec<u8>>) -> Result<RespValue> {
    match name {
        "INFO" => info(ctx, args.get(1).map(|s| upper_name(s))).await,
        "CONFIG" => config(ctx, &args[1..]),
        "CLIENT" => client(ctx, conn, &args[1..]).await,
        "CLUSTER" => cluster(ctx, &args[1..]),
        "DEBUG" => debug(ctx, conn, &args[1..]).await,
        "DBSIZE" => dbsize(ctx, conn.db).await,
        "SCAN" => scan(ctx, conn.db, &args[1..]).await,
        "FLUSHDB" => flush(ctx, Some(conn.db)).await,
        "FLUSHALL" => flush(ctx, None).await,
        "SAVE" => save(ctx).await,
        "BGSAVE" => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(error) = persistence::save_snapshot(&ctx).await {
                    tracing::warn!(%error, "background snapshot failed");
                }
            });
            Ok(RespValue::SimpleString("Background saving started".to_string()))
        }
        "LASTSAVE" => Ok(RespValue::Integer(ctx.last_save.load(Ordering::Relaxed) as i64)),
        "KINETA" => kineta(ctx, &args[1..]).await,
        _ => Ok(RespValue::Error(format!("ERR unknown command '{name}'"))),
    }
}

async fn info(ctx: &Arc<ServerContext>, section: Option<String>) -> Result<RespValue> {
    use std::fmt::Write as _;

    let wants = |name: &str| section.as_deref().map(|s| s == name).unwrap_or(true);
    let stats = kineta_metrics::aggregate(&ctx.shard_counters, &ctx.process);
    let mut out = String::new();

    if wants("SERVER") {
        let _ = write!(
            out,
            "# Server\r\nkineta_version:{}\r\nnode_id:{}\r\nuptime_in_seconds:{}\r\nnum_shards:{}\r\ncluster_mode:{:?}\r\n\r\n",
            env!("CARGO_PKG_VERSION"),
            ctx.node_id,
            ctx.started_at.elapsed().as_secs(),
            ctx.router.num_shards(),
            ctx.cluster_mode,
        );
    }
    if wants("CLIENTS") {
        let _ = write!(
            out,
            "# Clients\r\nconnected_clients:{}\r\ntotal_connections_received:{}\r\n\r\n",
            stats.connected_clients, stats.total_connections,
        );
    }
    if wants("STATS") {
        let _ = write!(
            out,
            "# Stats\r\ntotal_commands_processed:{}\r\nhops_run:{}\r\nexpired_keys_total:{}\r\nmulti_squash_executions:{}\r\n\r\n",
            stats.commands_processed, stats.hops_run, stats.keys_expired, stats.multi_squash_executions,
        );
    }
    if wants("PERSISTENCE") {
        let _ = write!(out, "# Persistence\r\nlast_save_time:{}\r\n\r\n", ctx.last_save.load(Ordering::Relaxed));
    }
    if wants("REPLICATION") {
        let _ = write!(out, "# Replication\r\nrole:master\r\n");
        let lsns = ctx.router.broadcast(|state: &mut ShardState| state.journal.latest_lsn()).await?;
        for (shard, lsn) in lsns.iter().enumerate() {
            let _ = write!(out, "shard{shard}_journal_lsn:{}\r\n", lsn.0);
        }
        out.push_str("\r\n");
    }
    if wants("KEYSPACE") {
        let num_dbs = ctx.config().num_dbs;
        let per_shard = ctx
            .router
            .broadcast(move |state: &mut ShardState| {
                (0..num_dbs).map(|db| (state.db.table(db).len(), state.db.table(db).expires_len())).collect::<Vec<_>>()
            })
            .await?;
        out.push_str("# Keyspace\r\n");
        for db in 0..num_dbs {
            let keys: usize = per_shard.iter().map(|shard| shard[db].0).sum();
            let expires: usize = per_shard.iter().map(|shard| shard[db].1).sum();
            if keys > 0 {
                let _ = write!(out, "db{db}:keys={keys},expires={expires}\r\n");
            }
        }
    }

    Ok(RespValue::bulk(out))
}

fn config(ctx: &Arc<ServerContext>, argv: &[Vec<u8>]) -> Result<RespValue> {
    let Some(sub) = argv.first() else { return Ok(err_syntax()) };
    match upper_name(sub).as_str() {
        "GET" => {
            let Some(pattern) = argv.get(1) else { return Ok(err_syntax()) };
            let cfg = ctx.config();
            let interval_ms = cfg.snapshot_interval.map(|d| d.as_millis() as u64).unwrap_or(0);
            let entries: Vec<(&str, String)> = vec![
                ("maxclients", cfg.max_clients.to_string()),
                ("databases", cfg.num_dbs.to_string()),
                ("shards", cfg.num_shards.to_string()),
                ("dispatch-queue-bytes", cfg.queue_byte_ceiling.to_string()),
                ("pipeline-cache-bytes", cfg.pipeline_cache_limit.to_string()),
                ("snapshot-dir", cfg.snapshot_dir.display().to_string()),
                ("snapshot-template", cfg.snapshot_template.clone()),
                ("snapshot-interval-ms", interval_ms.to_string()),
                ("requirepass", cfg.requirepass.clone().unwrap_or_default()),
                ("tls-enabled", (cfg.tls.enabled as u8).to_string()),
            ];
            let matched = entries
                .into_iter()
                .filter(|(key, _)| glob_match(pattern, key.as_bytes()))
                .map(|(key, value)| (RespValue::bulk(key), RespValue::bulk(value)))
                .collect();
            Ok(RespValue::Map(matched))
        }
        "SET" => {
            let (Some(key), Some(value)) = (argv.get(1), argv.get(2)) else { return Ok(err_syntax()) };
            let value_text = String::from_utf8_lossy(value).to_string();
            let key = String::from_utf8_lossy(key).to_ascii_lowercase();
            let parse_usize = || value_text.parse::<usize>().ok();
            let applied = match key.as_str() {
                "maxclients" => parse_usize().map(|n| ctx.update_config(|c| c.max_clients = n)).is_some(),
                "dispatch-queue-bytes" => parse_usize().map(|n| ctx.update_config(|c| c.queue_byte_ceiling = n)).is_some(),
                "pipeline-cache-bytes" => parse_usize().map(|n| ctx.update_config(|c| c.pipeline_cache_limit = n)).is_some(),
                "snapshot-dir" => {
                    ctx.update_config(|c| c.snapshot_dir = std::path::PathBuf::from(&value_text));
                    true
                }
                "snapshot-template" => {
                    ctx.update_config(|c| c.snapshot_template = value_text.clone());
                    true
                }
                "requirepass" => {
                    let pass = if value_text.is_empty() { None } else { Some(value_text.clone()) };
                    ctx.update_config(|c| c.requirepass = pass);
                    true
                }
                _ => {
                    return Ok(RespValue::Error(format!("ERR Unknown option or number of arguments for CONFIG SET - '{key}'")));
                }
            };
            if applied {
                Ok(RespValue::ok())
            } else {
                Ok(RespValue::Error(format!("ERR argument couldn't be parsed into an integer for CONFIG SET - '{key}'")))
            }
        }
        "RESETSTAT" => {
            for shard in &ctx.shard_counters {
                shard.hops_run.store(0, Ordering::Relaxed);
                shard.commands_processed.store(0, Ordering::Relaxed);
                shard.keys_expired.store(0, Ordering::Relaxed);
            }
            ctx.process.multi_squash_executions.store(0, Ordering::Relaxed);
            ctx.process.total_connections.store(0, Ordering::Relaxed);
            Ok(RespValue::ok())
        }
        other => Ok(RespValue::Error(format!("ERR unknown CONFIG subcommand '{other}'"))),
    }
}

async fn client(ctx: &Arc<ServerContext>, conn: &mut ConnectionContext, argv: &[Vec<u8>]) -> Result<RespValue> {
    let Some(sub) = argv.first() else { return Ok(err_syntax()) };
    match upper_name(sub).as_str() {
        "ID" => Ok(RespValue::Integer(conn.id as i64)),
        "SETNAME" => match argv.get(1) {
            Some(name) => {
                conn.name = Some(String::from_utf8_lossy(name).to_string());
                Ok(RespValue::ok())
            }
            None => Ok(err_syntax()),
        },
        "GETNAME" => Ok(match &conn.name {
            Some(name) => RespValue::bulk(name.clone()),
            None => RespValue::bulk(""),
        }),
        "LIST" => {
            // Connections are homed on their own tasks; the listing renders
            // the calling session, which is all this node tracks centrally.
            let line = format!(
                "id={} addr={} name={} db={} resp={}\n",
                conn.id,
                conn.addr,
                conn.name.as_deref().unwrap_or(""),
                conn.db,
                if conn.resp3 { 3 } else { 2 },
            );
            Ok(RespValue::bulk(line))
        }
        "PAUSE" => {
            let Some(ms) = argv.get(1).and_then(|raw| std::str::from_utf8(raw).ok()).and_then(|s| s.parse::<u64>().ok()) else {
                return Ok(RespValue::Error("ERR timeout is not an integer or out of range".to_string()));
            };
            // While paused, the periodic expiry sweep is suppressed so a
            // paused observer never sees keys vanish underneath it.
            ctx.router.broadcast(|state: &mut ShardState| state.db.sweep_enabled = false).await?;
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if let Err(error) = ctx.router.broadcast(|state: &mut ShardState| state.db.sweep_enabled = true).await {
                    tracing::warn!(%error, "failed to resume expiry sweeps after CLIENT PAUSE");
                }
            });
            Ok(RespValue::ok())
        }
        other => Ok(RespValue::Error(format!("ERR unknown CLIENT subcommand '{other}'"))),
    }
}

fn cluster(ctx: &Arc<ServerContext>, argv: &[Vec<u8>]) -> Result<RespValue> {
    let Some(sub) = argv.first() else { return Ok(err_syntax()) };
    match upper_name(sub).as_str() {
        "INFO" => {
            let enabled = ctx.cluster_mode != kineta_cluster::ClusterMode::Disabled;
            let body = format!(
                "cluster_enabled:{}\r\ncluster_state:ok\r\ncluster_slots_assigned:{}\r\ncluster_known_nodes:1\r\n",
                enabled as u8,
                kineta_base::NUM_SLOTS,
            );
            Ok(RespValue::bulk(body))
        }
        "MYID" => Ok(RespValue::bulk(ctx.node_id.clone())),
        "SLOTS" => {
            let slots = ctx
                .slots
                .ranges()
                .map(|(start, end, owner)| {
                    RespValue::Array(Some(vec![
                        RespValue::Integer(start as i64),
                        RespValue::Integer(end as i64),
                        RespValue::Array(Some(vec![
                            RespValue::bulk(owner.host.clone()),
                            RespValue::Integer(owner.port as i64),
                        ])),
                    ]))
                })
                .collect();
            Ok(RespValue::Array(Some(slots)))
        }
        other => Ok(RespValue::Error(format!("ERR unknown CLUSTER subcommand '{other}'"))),
    }
}

async fn debug(ctx: &Arc<ServerContext>, conn: &ConnectionContext, argv: &[Vec<u8>]) -> Result<RespValue> {
    let Some(sub) = argv.first() else { return Ok(err_syntax()) };
    match upper_name(sub).as_str() {
        "SLEEP" => {
            let Some(seconds) = argv.get(1).and_then(|raw| std::str::from_utf8(raw).ok()).and_then(|s| s.parse::<f64>().ok())
            else {
                return Ok(err_syntax());
            };
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            Ok(RespValue::ok())
        }
        "OBJECT" => {
            let Some(key) = argv.get(1) else { return Ok(err_syntax()) };
            let shard = ctx.resolve_key(key)?;
            let db = conn.db;
            let key = key.clone();
            let now = unix_ms();
            let described = ctx
                .router
                .dispatch_to_shard(shard, move |state: &mut ShardState| {
                    state.db.find(db, &key, now).map(|value| {
                        format!("type:{} encoding:{:?} serializedlength:unknown", value.type_name(), value.encoding())
                    })
                })
                .await?;
            Ok(match described {
                Some(line) => RespValue::bulk(line),
                None => RespValue::Error("ERR no such key".to_string()),
            })
        }
        other => Ok(RespValue::Error(format!("ERR unknown DEBUG subcommand '{other}'"))),
    }
}

async fn dbsize(ctx: &Arc<ServerContext>, db: usize) -> Result<RespValue> {
    let per_shard = ctx.router.broadcast(move |state: &mut ShardState| state.db.table(db).len()).await?;
    Ok(RespValue::Integer(per_shard.into_iter().sum::<usize>() as i64))
}

/// A full-keyspace resumable scan: walks one shard's table at a time, the
/// shard index carried in the cursor's top bits. A reply cursor of `0`
/// means the traversal completed.
async fn scan(ctx: &Arc<ServerContext>, db: usize, argv: &[Vec<u8>]) -> Result<RespValue> {
    let Some(raw_cursor) = argv.first().and_then(|raw| std::str::from_utf8(raw).ok()).and_then(|s| s.parse::<u64>().ok())
    else {
        return Ok(RespValue::Error("ERR invalid cursor".to_string()));
    };

    let mut pattern: Option<Vec<u8>> = None;
    let mut count = SCAN_DEFAULT_COUNT;
    let mut it = argv[1..].iter();
    while let Some(opt) = it.next() {
        match upper_name(opt).as_str() {
            "MATCH" => match it.next() {
                Some(p) => pattern = Some(p.clone()),
                None => return Ok(err_syntax()),
            },
            "COUNT" => match it.next().and_then(|raw| std::str::from_utf8(raw).ok()).and_then(|s| s.parse::<usize>().ok()) {
                Some(n) if n > 0 => count = n,
                _ => return Ok(err_syntax()),
            },
            _ => return Ok(err_syntax()),
        }
    }

    let shard_idx = (raw_cursor >> SCAN_SHARD_SHIFT) as u32;
    let local = raw_cursor & SCAN_LOCAL_MASK;
    if shard_idx >= ctx.router.num_shards() {
        return Ok(scan_reply(0, Vec::new()));
    }

    let (keys, next_local) = ctx
        .router
        .dispatch_to_shard(ShardId(shard_idx), move |state: &mut ShardState| {
            let mut cursor = Cursor::from_raw(local);
            let mut keys = Vec::new();
            for _ in 0..count {
                if cursor.is_done() {
                    break;
                }
                cursor = state.db.scan(db, cursor, |key, _| {
                    let keep = pattern.as_deref().map(|p| glob_match(p, key)).unwrap_or(true);
                    if keep {
                        keys.push(key.clone());
                    }
                });
            }
            (keys, cursor)
        })
        .await?;

    let next_cursor = if next_local.is_done() {
        let next_shard = shard_idx + 1;
        if next_shard >= ctx.router.num_shards() {
            0
        } else {
            (next_shard as u64) << SCAN_SHARD_SHIFT
        }
    } else {
        ((shard_idx as u64) << SCAN_SHARD_SHIFT) | next_local.raw()
    };

    Ok(scan_reply(next_cursor, keys))
}

fn scan_reply(cursor: u64, keys: Vec<Vec<u8>>) -> RespValue {
    RespValue::Array(Some(vec![
        RespValue::bulk(cursor.to_string()),
        RespValue::Array(Some(keys.into_iter().map(RespValue::bulk).collect())),
    ]))
}

/// Flushes run as a global transaction: every shard is drained and cleared
/// under one TxId's bookkeeping.
async fn flush(ctx: &Arc<ServerContext>, db: Option<usize>) -> Result<RespValue> {
    let argv: Vec<Vec<u8>> = match db {
        Some(db) => vec![b"FLUSHDB".to_vec(), db.to_string().into_bytes()],
        None => vec![b"FLUSHALL".to_vec()],
    };
    let mut tx = ctx.coordinator.begin_global();
    tx.mark_scheduled();
    ctx.router
        .broadcast(move |state: &mut ShardState| {
            state.db.flush_db(match db {
                Some(one) => kineta_db_slice::FlushScope::One(one),
                None => kineta_db_slice::FlushScope::All,
            });
            state.journal_command(db.unwrap_or(0), &argv);
        })
        .await?;
    tx.record_hop(true);
    Ok(RespValue::ok())
}

async fn save(ctx: &Arc<ServerContext>) -> Result<RespValue> {
    match persistence::save_snapshot(ctx).await {
        Ok(path) => {
            tracing::info!(path = %path.display(), "snapshot written");
            Ok(RespValue::ok())
        }
        Err(error) => Ok(RespValue::Error(format!("ERR snapshot failed: {error}"))),
    }
}

/// Engine-specific admin namespace. `KINETA JOURNAL <shard> <from-lsn>`
/// serves the incremental-resync suffix, failing when the requested LSN
/// has been evicted so the replica knows to full-sync. `KINETA LSN`
/// reports every shard's latest journal position.
async fn kineta(ctx: &Arc<ServerContext>, argv: &[Vec<u8>]) -> Result<RespValue> {
    let Some(sub) = argv.first() else { return Ok(err_syntax()) };
    match upper_name(sub).as_str() {
        "JOURNAL" => {
            let (Some(shard), Some(from)) = (parse_u64(argv.get(1)), parse_u64(argv.get(2))) else {
                return Ok(err_syntax());
            };
            if shard >= ctx.router.num_shards() as u64 {
                return Ok(RespValue::Error("ERR shard index out of range".to_string()));
            }
            let suffix = ctx
                .router
                .dispatch_to_shard(ShardId(shard as u32), move |state: &mut ShardState| {
                    state.journal.records_since(Lsn(from)).map(|records| {
                        records
                            .iter()
                            .filter_map(|record| {
                                let mut buf = Vec::new();
                                encode_record(record, &mut buf).ok().map(|()| buf)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .await?;
            Ok(match suffix {
                Ok(frames) => RespValue::Array(Some(frames.into_iter().map(RespValue::bulk).collect())),
                Err(error) => RespValue::Error(format!("ERR {error}")),
            })
        }
        "LSN" => {
            let lsns = ctx.router.broadcast(|state: &mut ShardState| state.journal.latest_lsn()).await?;
            Ok(RespValue::Array(Some(lsns.into_iter().map(|lsn| RespValue::Integer(lsn.0 as i64)).collect())))
        }
        other => Ok(RespValue::Error(format!("ERR unknown KINETA subcommand '{other}'"))),
    }
}

fn parse_u64(raw: Option<&Vec<u8>>) -> Option<u64> {
    raw.and_then(|raw| std::str::from_utf8(raw).ok()).and_then(|s| s.parse().ok())
}
