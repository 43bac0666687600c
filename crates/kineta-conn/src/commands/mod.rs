//! Command dispatch: classifies a parsed request, routes single-key bodies
//! to the owning shard, fans multi-key commands out through the squasher,
//! and schedules MULTI/EXEC blocks onto the per-shard transaction queues.

mod admin;
mod apply;

pub use apply::apply;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kineta_base::{CommandError, CommandErrorKind, Error, Result, ShardId};
use kineta_engine_shard::{EngineShard, ShardState};
use kineta_txn::QueuedTx;
use kineta_wire::RespValue;

use crate::context::{ConnectionContext, ServerContext};
use crate::squash::{run_squashed, Squashable};
use crate::unix_ms;

/// How a command interacts with the keyspace, for routing and journaling.
#[derive(Debug, Clone, Copy)]
pub struct CommandTraits {
    pub write: bool,
    /// The command names exactly one key at position 1 and touches exactly
    /// one shard, which makes it eligible for squashing and MULTI blocks.
    pub single_key: bool,
}

const fn w() -> CommandTraits {
    CommandTraits { write: true, single_key: true }
}

const fn r() -> CommandTraits {
    CommandTraits { write: false, single_key: true }
}

pub fn traits_of(name: &str) -> Option<CommandTraits> {
    let traits = match name {
        "GET" | "STRLEN" | "TTL" | "PTTL" | "TYPE" => r(),
        "SET" | "APPEND" | "INCR" | "DECR" | "INCRBY" | "DECRBY" | "EXPIRE" | "PEXPIRE" | "PERSIST" => w(),
        // Container and document commands are classified here — routing,
        // squash/MULTI eligibility, journal policy — but their bodies
        // defer to the external type engines at the interpreter's seam.
        "HGET" | "HGETALL" | "HLEN" | "SISMEMBER" | "SCARD" | "SMEMBERS" | "ZSCORE" | "ZRANK" | "ZCARD"
        | "ZRANGE" | "LLEN" | "LRANGE" | "JSON.GET" | "FT.GET" => r(),
        "HSET" | "HDEL" | "SADD" | "SREM" | "ZADD" | "ZREM" | "LPUSH" | "RPUSH" | "LPOP" | "RPOP"
        | "JSON.SET" | "FT.ADD" => w(),
        // Variadic over their keys; the fan-out layer splits them into
        // one single-key sub-command per key, so they are never routed
        // (or queued in a MULTI block) as a whole.
        "DEL" => CommandTraits { write: true, single_key: false },
        "EXISTS" => CommandTraits { write: false, single_key: false },
        _ => return None,
    };
    Some(traits)
}

pub(crate) fn upper_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_uppercase()
}

pub(crate) fn err_syntax() -> RespValue {
    RespValue::Error("ERR syntax error".to_string())
}

pub(crate) fn err_wrong_type() -> RespValue {
    RespValue::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
}

pub(crate) fn err_invalid_int() -> RespValue {
    RespValue::Error("ERR value is not an integer or out of range".to_string())
}

fn is_error(reply: &RespValue) -> bool {
    matches!(reply, RespValue::Error(_))
}

/// Whether a parsed request may join a squashed pipeline hop: a known
/// single-key command with its key present.
pub fn is_squashable(argv: &[Vec<u8>]) -> bool {
    argv.len() >= 2 && traits_of(&upper_name(&argv[0])).map(|t| t.single_key).unwrap_or(false)
}

/// Matches `pattern` against `text` with `*` (any run) and `?` (any single
/// byte) wildcards, the dialect `SCAN MATCH` and `CONFIG GET` use.
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((&c, rest)) => text.first() == Some(&c) && glob_match(rest, &text[1..]),
    }
}

/// Executes one parsed request for `conn`. The connection layer owns the
/// socket; everything here speaks in `RespValue`s.
pub async fn execute(ctx: &Arc<ServerContext>, conn: &mut ConnectionContext, args: Vec<Vec<u8>>) -> Result<RespValue> {
    let Some(name_raw) = args.first() else {
        return Ok(RespValue::Error("ERR empty command".to_string()));
    };
    let name = upper_name(name_raw);

    if !conn.authenticated && !matches!(name.as_str(), "AUTH" | "HELLO" | "QUIT") {
        return Ok(RespValue::Error("NOAUTH Authentication required.".to_string()));
    }

    // Inside an open MULTI block every command except the block controls
    // is queued, not executed.
    if conn.in_multi() && !matches!(name.as_str(), "MULTI" | "EXEC" | "DISCARD") {
        if !is_squashable(&args) {
            conn.multi_error = true;
            return Ok(RespValue::Error(format!("ERR '{name}' is not allowed in transactions")));
        }
        if let Some(queued) = conn.multi.as_mut() {
            queued.push(args);
        }
        return Ok(RespValue::SimpleString("QUEUED".to_string()));
    }

    match name.as_str() {
        "PING" => Ok(match args.get(1) {
            Some(msg) => RespValue::bulk(msg.clone()),
            None => RespValue::SimpleString("PONG".to_string()),
        }),
        "ECHO" => match args.get(1) {
            Some(msg) => Ok(RespValue::bulk(msg.clone())),
            None => Ok(err_syntax()),
        },
        "QUIT" => Ok(RespValue::ok()),
        "SELECT" => {
            let idx = parse_index(args.get(1))?;
            ctx.check_db_index(idx)?;
            conn.db = idx;
            Ok(RespValue::ok())
        }
        "HELLO" => hello(ctx, conn, &args[1..]),
        "AUTH" => auth(ctx, conn, &args[1..]),
        "MULTI" => {
            if conn.in_multi() {
                return Ok(RespValue::Error("ERR MULTI calls can not be nested".to_string()));
            }
            conn.multi = Some(Vec::new());
            conn.multi_error = false;
            Ok(RespValue::ok())
        }
        "DISCARD" => {
            if conn.multi.take().is_none() {
                return Ok(RespValue::Error("ERR DISCARD without MULTI".to_string()));
            }
            conn.multi_error = false;
            Ok(RespValue::ok())
        }
        "EXEC" => exec_multi(ctx, conn).await,
        "MGET" | "MSET" | "DEL" | "EXISTS" => fan_out(ctx, conn, &name, &args).await,
        // OBJECT's key sits after its subcommand.
        "OBJECT" => dispatch_keyed(ctx, conn.db, args, 2).await,
        "INFO" | "CONFIG" | "CLIENT" | "CLUSTER" | "DEBUG" | "DBSIZE" | "SCAN" | "FLUSHDB" | "FLUSHALL" | "SAVE"
        | "BGSAVE" | "LASTSAVE" | "KINETA" => admin::execute(ctx, conn, &name, args).await,
        _ => match traits_of(&name) {
            Some(traits) if traits.single_key => dispatch_keyed(ctx, conn.db, args, 1).await,
            Some(_) | None => Ok(RespValue::Error(format!("ERR unknown command '{name}'"))),
        },
    }
}

fn parse_index(raw: Option<&Vec<u8>>) -> Result<usize> {
    raw.and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| Error::Command(CommandError::new(CommandErrorKind::InvalidInt, "value is not an integer or out of range")))
}

fn hello(ctx: &Arc<ServerContext>, conn: &mut ConnectionContext, argv: &[Vec<u8>]) -> Result<RespValue> {
    if let Some(proto) = argv.first() {
        match proto.as_slice() {
            b"2" => conn.resp3 = false,
            b"3" => conn.resp3 = true,
            _ => return Ok(RespValue::Error("NOPROTO unsupported protocol version".to_string())),
        }
    }
    let mode = if ctx.cluster_mode == kineta_cluster::ClusterMode::Disabled { "standalone" } else { "cluster" };
    Ok(RespValue::Map(vec![
        (RespValue::bulk("server"), RespValue::bulk("kineta")),
        (RespValue::bulk("version"), RespValue::bulk(env!("CARGO_PKG_VERSION"))),
        (RespValue::bulk("proto"), RespValue::Integer(if conn.resp3 { 3 } else { 2 })),
        (RespValue::bulk("id"), RespValue::Integer(conn.id as i64)),
        (RespValue::bulk("mode"), RespValue::bulk(mode)),
        (RespValue::bulk("role"), RespValue::bulk("master")),
    ]))
}

fn auth(ctx: &Arc<ServerContext>, conn: &mut ConnectionContext, argv: &[Vec<u8>]) -> Result<RespValue> {
    // Both `AUTH <password>` and `AUTH <user> <password>` forms; only the
    // default user exists.
    let password = match argv {
        [password] => password,
        [user, password] if user.as_slice() == b"default" => password,
        [_, _] => return Ok(RespValue::Error("WRONGPASS invalid username-password pair".to_string())),
        _ => return Ok(err_syntax()),
    };
    match ctx.config().requirepass.as_deref() {
        None => Ok(RespValue::Error("ERR Client sent AUTH, but no password is set.".to_string())),
        Some(expected) if expected.as_bytes() == password.as_slice() => {
            conn.authenticated = true;
            Ok(RespValue::ok())
        }
        Some(_) => Ok(RespValue::Error("WRONGPASS invalid username-password pair".to_string())),
    }
}

/// Routes one single-key command to its owning shard and runs it there.
/// `key_index` is the argument position the routing key sits at.
async fn dispatch_keyed(ctx: &Arc<ServerContext>, db: usize, args: Vec<Vec<u8>>, key_index: usize) -> Result<RespValue> {
    let Some(key) = args.get(key_index) else {
        return Ok(err_syntax());
    };
    let shard = ctx.resolve_key(key)?;
    let now = unix_ms();
    ctx.router.dispatch_to_shard(shard, move |state: &mut ShardState| apply(state, db, now, &args, false)).await
}

/// Fans a multi-key command out as one single-key sub-command per key,
/// squashed into at most one hop per touched shard, and recombines the
/// captured replies in key order.
async fn fan_out(ctx: &Arc<ServerContext>, conn: &ConnectionContext, name: &str, args: &[Vec<u8>]) -> Result<RespValue> {
    let subs: Vec<Vec<Vec<u8>>> = match name {
        "MSET" => {
            let pairs = &args[1..];
            if pairs.is_empty() || pairs.len() % 2 != 0 {
                return Ok(RespValue::Error("ERR wrong number of arguments for 'mset' command".to_string()));
            }
            pairs.chunks_exact(2).map(|pair| vec![b"SET".to_vec(), pair[0].clone(), pair[1].clone()]).collect()
        }
        "MGET" => {
            if args.len() < 2 {
                return Ok(err_syntax());
            }
            args[1..].iter().map(|key| vec![b"GET".to_vec(), key.clone()]).collect()
        }
        // DEL and EXISTS accept many keys; each one is an independent
        // single-key sub-command whose integer replies sum up.
        _ => {
            if args.len() < 2 {
                return Ok(err_syntax());
            }
            args[1..].iter().map(|key| vec![args[0].clone(), key.clone()]).collect()
        }
    };

    let db = conn.db;
    let now = unix_ms();
    let mut batch = Vec::with_capacity(subs.len());
    for argv in subs {
        let shard = ctx.resolve_key(&argv[1])?;
        batch.push(Squashable {
            shard,
            run: Box::new(move |state: &mut ShardState| apply(state, db, now, &argv, false)),
        });
    }

    if batch.len() > 1 {
        ctx.process.multi_squash_executions.fetch_add(1, Ordering::Relaxed);
    }
    let replies = run_squashed(&ctx.router, batch, false, is_error, || RespValue::Error("ERR discarded".to_string())).await?;

    Ok(match name {
        "MGET" => RespValue::Array(Some(replies)),
        "MSET" => replies.into_iter().find(is_error).unwrap_or_else(RespValue::ok),
        // DEL / EXISTS
        _ => RespValue::Integer(
            replies
                .iter()
                .map(|r| match r {
                    RespValue::Integer(n) => *n,
                    _ => 0,
                })
                .sum(),
        ),
    })
}

/// Runs an EXEC block: every queued command is scheduled under one TxId
/// across the shards its keys touch, each shard executing its sub-commands
/// in one atomic hop, and the replies are re-interleaved into queue order.
async fn exec_multi(ctx: &Arc<ServerContext>, conn: &mut ConnectionContext) -> Result<RespValue> {
    let Some(queued) = conn.multi.take() else {
        return Ok(RespValue::Error("ERR EXEC without MULTI".to_string()));
    };
    if std::mem::take(&mut conn.multi_error) {
        return Ok(RespValue::Error("EXECABORT Transaction discarded because of previous errors.".to_string()));
    }
    if queued.is_empty() {
        return Ok(RespValue::Array(Some(Vec::new())));
    }

    let total = queued.len();
    let db = conn.db;
    let all_keys: Vec<Vec<u8>> = queued.iter().map(|argv| argv[1].clone()).collect();
    let read_only = queued
        .iter()
        .all(|argv| traits_of(&upper_name(&argv[0])).map(|t| !t.write).unwrap_or(true));
    let mut tx = ctx.coordinator.begin(&all_keys, read_only);
    let tx_id = tx.id;

    // Group sub-commands by owning shard, preserving queue order within
    // each shard.
    struct ShardBlock {
        shard: ShardId,
        subs: Vec<(usize, Vec<Vec<u8>>)>,
        keys: Vec<Vec<u8>>,
        read_only: bool,
    }
    let mut blocks: Vec<ShardBlock> = Vec::new();
    for (idx, argv) in queued.into_iter().enumerate() {
        let shard = ctx.resolve_key(&argv[1])?;
        let write = traits_of(&upper_name(&argv[0])).map(|t| t.write).unwrap_or(false);
        let pos = match blocks.iter().position(|b| b.shard == shard) {
            Some(pos) => pos,
            None => {
                blocks.push(ShardBlock { shard, subs: Vec::new(), keys: Vec::new(), read_only: true });
                blocks.len() - 1
            }
        };
        blocks[pos].keys.push(argv[1].clone());
        blocks[pos].read_only &= !write;
        blocks[pos].subs.push((idx, argv));
    }
    tx.mark_scheduled();

    let mut receivers = Vec::with_capacity(blocks.len());
    for block in blocks {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel::<Vec<(usize, RespValue)>>();
        receivers.push(reply_rx);

        let queued_tx = QueuedTx { tx_id, read_only: block.read_only, keys: block.keys };
        let subs = block.subs;
        ctx.router
            .with_shard(block.shard, move |engine: &mut EngineShard| {
                let mut subs = Some(subs);
                let mut reply_tx = Some(reply_tx);
                engine.schedule(
                    queued_tx,
                    Box::new(move |state: &mut ShardState| {
                        let now = unix_ms();
                        let mut wrote = false;
                        let mut replies = Vec::new();
                        for (idx, argv) in subs.take().unwrap_or_default() {
                            let write = traits_of(&upper_name(&argv[0])).map(|t| t.write).unwrap_or(false);
                            let reply = apply(state, db, now, &argv, true);
                            wrote |= write && !is_error(&reply);
                            replies.push((idx, reply));
                        }
                        if wrote {
                            state.journal_exec(db);
                        }
                        if let Some(reply_tx) = reply_tx.take() {
                            let _ = reply_tx.send(replies);
                        }
                        true
                    }),
                );
                engine.run_ready(unix_ms());
            })
            .await?;
    }

    let mut out: Vec<Option<RespValue>> = (0..total).map(|_| None).collect();
    for reply_rx in receivers {
        for (idx, reply) in reply_rx.await.map_err(|_| Error::Cancelled(tx_id))? {
            out[idx] = Some(reply);
        }
    }
    tx.record_hop(true);
    debug_assert!(tx.is_concluded());

    // Abort-on-error inside a transaction: replies after the first error
    // are discarded rather than surfaced.
    let mut seen_error = false;
    let replies = out
        .into_iter()
        .map(|reply| {
            let reply = reply.unwrap_or_else(|| RespValue::Error("ERR internal: missing reply".to_string()));
            if seen_error {
                return RespValue::Error("EXECABORT Transaction discarded because of previous errors.".to_string());
            }
            if is_error(&reply) {
                seen_error = true;
            }
            reply
        })
        .collect();
    Ok(RespValue::Array(Some(replies)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn traits_classify_reads_and_writes() {
        assert!(traits_of("SET").unwrap().write);
        assert!(!traits_of("GET").unwrap().write);
        assert!(traits_of("ZADD").unwrap().single_key);
        assert!(traits_of("NOPE").is_none());
    }

    #[test]
    fn squashable_requires_a_known_single_key_command() {
        assert!(is_squashable(&[b"GET".to_vec(), b"k".to_vec()]));
        assert!(is_squashable(&[b"set".to_vec(), b"k".to_vec(), b"v".to_vec()]));
        assert!(!is_squashable(&[b"FLUSHALL".to_vec()]));
        assert!(!is_squashable(&[b"GET".to_vec()]));
    }

    #[test]
    fn glob_matches_star_and_question_mark() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"max*", b"maxclients"));
        assert!(glob_match(b"k?y", b"key"));
        assert!(!glob_match(b"max*", b"databases"));
        assert!(!glob_match(b"k?y", b"kezzy"));
    }
}
