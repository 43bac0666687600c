//! Per-connection event loop: a raw read buffer fed by `tokio::select!`
//! against a cancellation token, rather than a full `Framed` stream, so the
//! loop can see whether a decode left a pipelined tail behind and decide
//! inline vs. queued dispatch itself.
//!
//! A single task plays both pipeline roles: it parses everything currently
//! buffered (the input side's job) before draining the resulting queue and
//! writing replies (the dispatch side's job). Adjacent queued single-key
//! commands are collapsed through the squasher into one hop per touched
//! shard instead of dispatching one at a time.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use kineta_base::Error as KinetaError;
use kineta_engine_shard::ShardState;
use kineta_wire::{looks_like_http_request_line, RespCodec, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::commands::{self, apply, is_squashable};
use crate::context::{ConnectionContext, ServerContext};
use crate::pipeline::{self, PendingQueue, PipelineMessage};
use crate::squash::{run_squashed, Squashable, MAX_SUBCOMMANDS_PER_SHARD};
use crate::unix_ms;

const INITIAL_READ_BUFFER: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

/// Drives one RESP connection until the peer disconnects, a protocol
/// error forces a shutdown, or `cancel` fires. `admin_port` enables the
/// HTTP probe and is recorded for command gating.
pub async fn serve_resp(
    mut stream: TcpStream,
    ctx: Arc<ServerContext>,
    admin_port: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let config = ctx.config();
    let mut conn = ConnectionContext::new(ctx.next_client_id(), config.requirepass.is_some());
    conn.addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();

    let mut codec = RespCodec::new();
    let mut read_buf = BytesMut::with_capacity(INITIAL_READ_BUFFER);
    let mut write_buf = BytesMut::new();
    let mut queue = PendingQueue::new(config.queue_byte_ceiling);
    let mut probed = !admin_port;

    loop {
        // Parse everything currently buffered. Intake pauses when the
        // pending queue crosses its byte ceiling; the unparsed tail stays
        // in the read buffer until dispatch has drained the queue.
        let mut paused = false;
        loop {
            if !probed {
                match memchr::memchr(b'\n', &read_buf) {
                    Some(pos) => {
                        let line_end = if pos > 0 && read_buf[pos - 1] == b'\r' { pos - 1 } else { pos };
                        if looks_like_http_request_line(&read_buf[..line_end]) {
                            return serve_http_probe(stream, &ctx).await;
                        }
                        probed = true;
                    }
                    None => break,
                }
            }

            match codec.decode(&mut read_buf) {
                Ok(Some(args)) => {
                    let has_unparsed_tail = !read_buf.is_empty();
                    if pipeline::should_dispatch_inline(has_unparsed_tail, false, &queue, false) {
                        PipelineMessage::note_inline_dispatch(ctx.process.connected_clients.load(Ordering::Relaxed) as usize);
                        let quit = dispatch_one(&ctx, &mut conn, &mut codec, &mut write_buf, args).await?;
                        if quit {
                            stream.write_all(&write_buf).await?;
                            return Ok(());
                        }
                    } else {
                        queue.push(PipelineMessage::acquire(args));
                        if queue.over_byte_ceiling() {
                            paused = true;
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(KinetaError::Protocol(msg)) => {
                    // Flush legitimate replies already buffered before the
                    // protocol-error line, then drop the connection.
                    if !write_buf.is_empty() {
                        stream.write_all(&write_buf).await?;
                        write_buf.clear();
                    }
                    write_protocol_error(&mut stream, &msg).await?;
                    return Ok(());
                }
                Err(other) => return Err(other.into()),
            }
        }

        let should_yield = queue.should_yield();
        drain_queue(&ctx, &mut conn, &mut queue, &mut codec, &mut write_buf).await?;

        if !write_buf.is_empty() {
            stream.write_all(&write_buf).await?;
            write_buf.clear();
        }

        if paused {
            // The queue has drained; resume parsing the buffered tail
            // before touching the socket again.
            continue;
        }

        if should_yield {
            tokio::task::yield_now().await;
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

/// Drains the pending queue: contiguous runs of squashable commands go
/// through one squashed cross-shard dispatch, everything else dispatches
/// one at a time. The queue is always empty on return, which is what lifts
/// the backpressure ceiling for the next read.
async fn drain_queue(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionContext,
    queue: &mut PendingQueue,
    codec: &mut RespCodec,
    write_buf: &mut BytesMut,
) -> anyhow::Result<()> {
    let cache_limit = ctx.config().pipeline_cache_limit;
    while !queue.is_empty() {
        let mut run: Vec<PipelineMessage> = Vec::new();
        while run.len() < MAX_SUBCOMMANDS_PER_SHARD {
            let eligible = queue
                .peek()
                .map(|msg| {
                    !conn.in_multi()
                        && conn.authenticated
                        && is_squashable(&msg.args)
                        && ctx.resolve_key(&msg.args[1]).is_ok()
                })
                .unwrap_or(false);
            if !eligible {
                break;
            }
            if let Some(msg) = queue.pop() {
                run.push(msg);
            }
        }

        if run.len() >= 2 {
            dispatch_squashed(ctx, conn, &run, codec, write_buf).await?;
            for msg in run {
                msg.recycle(cache_limit);
            }
        } else if let Some(msg) = run.pop().or_else(|| queue.pop()) {
            let args = msg.args.clone();
            msg.recycle(cache_limit);
            dispatch_one(ctx, conn, codec, write_buf, args).await?;
        }
    }
    Ok(())
}

/// Runs one squash-eligible batch as a single cross-shard hop per shard and
/// encodes the captured replies back in pipeline order.
async fn dispatch_squashed(
    ctx: &Arc<ServerContext>,
    conn: &ConnectionContext,
    run: &[PipelineMessage],
    codec: &mut RespCodec,
    write_buf: &mut BytesMut,
) -> anyhow::Result<()> {
    let db = conn.db;
    let now = unix_ms();
    let mut batch = Vec::with_capacity(run.len());
    for msg in run {
        let argv = msg.args.clone();
        let shard = match ctx.resolve_key(&argv[1]) {
            Ok(shard) => shard,
            Err(KinetaError::Command(err)) => {
                // Eligibility was checked at collection time; a config swap
                // in between can still surface a redirect here.
                codec.encode(RespValue::from_command_error(&err), write_buf)?;
                continue;
            }
            Err(other) => return Err(other.into()),
        };
        batch.push(Squashable {
            shard,
            run: Box::new(move |state: &mut ShardState| apply(state, db, now, &argv, false)),
        });
    }

    ctx.process.multi_squash_executions.fetch_add(1, Ordering::Relaxed);
    let replies = run_squashed(
        &ctx.router,
        batch,
        false,
        |reply| matches!(reply, RespValue::Error(_)),
        || RespValue::Error("ERR discarded".to_string()),
    )
    .await?;
    for reply in replies {
        codec.encode(reply, write_buf)?;
    }
    Ok(())
}

/// Dispatches one command through the full interpreter and encodes its
/// reply. Returns `true` when the command asks the connection to close.
async fn dispatch_one(
    ctx: &Arc<ServerContext>,
    conn: &mut ConnectionContext,
    codec: &mut RespCodec,
    write_buf: &mut BytesMut,
    args: Vec<Vec<u8>>,
) -> anyhow::Result<bool> {
    let quit = args.first().map(|name| name.eq_ignore_ascii_case(b"QUIT")).unwrap_or(false);

    let reply = match commands::execute(ctx, conn, args).await {
        Ok(value) => value,
        Err(KinetaError::Command(err)) => RespValue::from_command_error(&err),
        Err(other) => return Err(other.into()),
    };
    codec.resp3 = conn.resp3;
    codec.encode(reply, write_buf)?;
    Ok(quit)
}

/// A connection whose first line is an HTTP request gets a minimal plain
/// text status page instead of a RESP protocol error; full HTTP admin
/// lives on the metrics endpoint.
async fn serve_http_probe(mut stream: TcpStream, ctx: &Arc<ServerContext>) -> anyhow::Result<()> {
    let stats = kineta_metrics::aggregate(&ctx.shard_counters, &ctx.process);
    let body = format!(
        "kineta {}\nuptime_seconds: {}\ncommands_processed: {}\nconnected_clients: {}\n",
        env!("CARGO_PKG_VERSION"),
        ctx.started_at.elapsed().as_secs(),
        stats.commands_processed,
        stats.connected_clients,
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn write_protocol_error(stream: &mut TcpStream, msg: &str) -> anyhow::Result<()> {
    let line = format!("-ERR Protocol error: {msg}\r\n");
    stream.write_all(line.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}
