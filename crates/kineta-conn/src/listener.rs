//! TCP accept loop: a `TcpListener` plus `tokio::select!` racing `accept()`
//! against a [`CancellationToken`], a [`Semaphore`] capping live
//! connections, and one spawned task per accepted socket.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::connection::serve_resp;
use crate::context::ServerContext;
use crate::memcache_conn::serve_memcache;

/// Which wire protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerProtocol {
    Resp,
    Memcache,
}

pub struct ListenerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    pub protocol: ListenerProtocol,
    /// Admin listeners additionally answer the HTTP probe and are where
    /// operators point management tooling.
    pub admin: bool,
}

/// Binds `config.bind_addr` and serves connections against `ctx` until
/// `cancel` fires.
pub async fn serve(ctx: Arc<ServerContext>, config: ListenerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    serve_listener(listener, ctx, config, cancel).await
}

/// Serves connections on an already-bound listener. Each connection gets
/// its own child token so a single session's failure can't cancel its
/// siblings.
pub async fn serve_listener(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    config: ListenerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(addr = %config.bind_addr, protocol = ?config.protocol, admin = config.admin, "listening");

    let limit = Arc::new(Semaphore::new(config.max_connections));

    loop {
        tokio::select! {
            accept = listener.accept() => {
                let Ok((socket, addr)) = accept else { continue };
                let Ok(permit) = limit.clone().try_acquire_owned() else {
                    tracing::warn!(%addr, "rejecting connection, connection limit reached");
                    continue;
                };
                let _ = socket.set_nodelay(true);

                ctx.process.connected_clients.fetch_add(1, Ordering::Relaxed);
                ctx.process.total_connections.fetch_add(1, Ordering::Relaxed);

                let ctx = ctx.clone();
                let protocol = config.protocol;
                let admin = config.admin;
                let task_cancel = cancel.child_token();

                tokio::spawn(async move {
                    let _permit = permit;
                    let served = match protocol {
                        ListenerProtocol::Resp => serve_resp(socket, ctx.clone(), admin, task_cancel).await,
                        ListenerProtocol::Memcache => serve_memcache(socket, ctx.clone(), task_cancel).await,
                    };
                    ctx.process.connected_clients.fetch_sub(1, Ordering::Relaxed);
                    if let Err(err) = served {
                        tracing::warn!(%addr, error = %err, "connection ended with an error");
                    }
                });
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}
