//! The memcache text-protocol session loop. Memcache traffic always lands
//! in logical database 0, stores its per-key flags word alongside the
//! value, and journals each store as the equivalent string-command record
//! so one replication stream covers both protocols.

use std::sync::Arc;

use bytes::BytesMut;
use kineta_base::Error as KinetaError;
use kineta_db_slice::{KeyFlags, PrimeValue};
use kineta_engine_shard::ShardState;
use kineta_wire::{MemcacheCodec, MemcacheReply, MemcacheRequest, MemcacheValue, StoreVerb};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::context::ServerContext;
use crate::unix_ms;

const READ_CHUNK: usize = 8 * 1024;

/// The database memcache sessions operate on.
const MEMCACHE_DB: usize = 0;

/// Exptimes up to this many seconds are relative to now; larger values are
/// absolute unix timestamps, per the memcache protocol's 30-day rule.
const RELATIVE_EXPTIME_LIMIT: i64 = 60 * 60 * 24 * 30;

/// Drives one memcache connection until the peer disconnects, a protocol
/// error forces a shutdown, or `cancel` fires.
pub async fn serve_memcache(mut stream: TcpStream, ctx: Arc<ServerContext>, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut codec = MemcacheCodec::new();
    let mut read_buf = BytesMut::new();
    let mut write_buf = BytesMut::new();

    loop {
        loop {
            match codec.decode(&mut read_buf) {
                Ok(Some(request)) => {
                    let noreply = request_noreply(&request);
                    let reply = handle(&ctx, request).await?;
                    if !noreply {
                        codec.encode(reply, &mut write_buf)?;
                    }
                }
                Ok(None) => break,
                Err(KinetaError::Protocol(msg)) => {
                    if !write_buf.is_empty() {
                        stream.write_all(&write_buf).await?;
                    }
                    stream.write_all(format!("CLIENT_ERROR {msg}\r\n").as_bytes()).await?;
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
                Err(other) => return Err(other.into()),
            }
        }

        if !write_buf.is_empty() {
            stream.write_all(&write_buf).await?;
            write_buf.clear();
        }

        let mut scratch = [0u8; READ_CHUNK];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read(&mut scratch) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                read_buf.extend_from_slice(&scratch[..n]);
            }
        }
    }
}

fn request_noreply(request: &MemcacheRequest) -> bool {
    match request {
        MemcacheRequest::Get { .. } => false,
        MemcacheRequest::Store { noreply, .. } => *noreply,
        MemcacheRequest::Delete { noreply, .. } => *noreply,
    }
}

async fn handle(ctx: &Arc<ServerContext>, request: MemcacheRequest) -> anyhow::Result<MemcacheReply> {
    match request {
        MemcacheRequest::Get { keys } => {
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                let now = unix_ms();
                let lookup_key = key.clone();
                let found = ctx
                    .router
                    .dispatch_single(&key, move |state: &mut ShardState| {
                        match state.db.find(MEMCACHE_DB, &lookup_key, now) {
                            Some(PrimeValue::Str(payload)) => {
                                let payload = payload.clone();
                                let flags = state.db.flags_of(MEMCACHE_DB, &lookup_key).memcache_flags;
                                Some((payload, flags))
                            }
                            _ => None,
                        }
                    })
                    .await?;
                if let Some((payload, flags)) = found {
                    values.push(MemcacheValue { key, flags, payload });
                }
            }
            Ok(MemcacheReply::Values(values))
        }
        MemcacheRequest::Store { verb, key, flags, exptime, payload, .. } => {
            let now = unix_ms();
            let expire_at = expire_at_ms(exptime, now);
            let routing_key = key.clone();
            let stored = ctx
                .router
                .dispatch_single(&routing_key, move |state: &mut ShardState| {
                    let exists = state.db.find(MEMCACHE_DB, &key, now).is_some();
                    let allowed = match verb {
                        StoreVerb::Set => true,
                        StoreVerb::Add => !exists,
                        StoreVerb::Replace => exists,
                    };
                    if !allowed {
                        return false;
                    }
                    if matches!(expire_at, Some(at) if at <= now) {
                        // Already expired on arrival: a set of a dead value
                        // is a delete.
                        state.db.delete(MEMCACHE_DB, &key);
                        return true;
                    }
                    state.db.delete(MEMCACHE_DB, &key);
                    let value = payload.clone();
                    let (guard, _) = state.db.add_or_find(MEMCACHE_DB, &key, || PrimeValue::Str(value));
                    guard.commit();
                    state.db.set_flags(MEMCACHE_DB, &key, KeyFlags { memcache_flags: flags, ..KeyFlags::default() });
                    if let Some(at) = expire_at {
                        state.db.set_expiry(MEMCACHE_DB, &key, at);
                    }
                    state.journal_command(MEMCACHE_DB, &[b"SET".to_vec(), key.clone(), payload.clone()]);
                    true
                })
                .await?;
            Ok(if stored { MemcacheReply::Stored } else { MemcacheReply::NotStored })
        }
        MemcacheRequest::Delete { key, .. } => {
            let routing_key = key.clone();
            let deleted = ctx
                .router
                .dispatch_single(&routing_key, move |state: &mut ShardState| {
                    let deleted = state.db.delete(MEMCACHE_DB, &key);
                    if deleted {
                        state.journal_command(MEMCACHE_DB, &[b"DEL".to_vec(), key.clone()]);
                    }
                    deleted
                })
                .await?;
            Ok(if deleted { MemcacheReply::Deleted } else { MemcacheReply::NotFound })
        }
    }
}

fn expire_at_ms(exptime: i64, now_ms: i64) -> Option<i64> {
    match exptime {
        0 => None,
        t if t < 0 => Some(now_ms),
        t if t <= RELATIVE_EXPTIME_LIMIT => Some(now_ms + t * 1000),
        t => Some(t * 1000),
    }
}
