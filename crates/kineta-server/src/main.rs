//! Process entry point: parses configuration, starts one OS thread per
//! shard each driving its own engine shard on a single-threaded runtime,
//! and serves the RESP, memcache, admin, and metrics listeners on the main
//! runtime, all under one cancellation token.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use kineta_base::ShardId;
use kineta_cluster::{ClusterMode, NodeAddr, SlotTable};
use kineta_conn::{ListenerConfig, ListenerProtocol, Router, RuntimeConfig, ServerContext, TlsConfig};
use kineta_coroutines::HopQueue;
use kineta_engine_shard::{EngineShard, DEFAULT_JOURNAL_CAPACITY};
use kineta_metrics::{ProcessCounters, ShardCounters};

/// An in-memory key/value engine speaking RESP2/RESP3 and memcache.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Address the RESP listener binds to.
    #[arg(long, default_value = "0.0.0.0:6379", env = "KINETA_BIND_ADDR")]
    bind_addr: String,

    /// Optional address for a memcache text-protocol listener.
    #[arg(long, env = "KINETA_MEMCACHE_ADDR")]
    memcache_addr: Option<String>,

    /// Optional admin RESP listener; also answers the HTTP probe.
    #[arg(long, env = "KINETA_ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// Address the Prometheus `/metrics` endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:9091", env = "KINETA_METRICS_ADDR")]
    metrics_addr: String,

    /// Number of shards, each run on its own OS thread.
    #[arg(long, default_value_t = 8, env = "KINETA_SHARDS")]
    shards: u32,

    /// Number of logical databases per shard (`SELECT 0..num_dbs`).
    #[arg(long, default_value_t = 16, env = "KINETA_NUM_DBS")]
    num_dbs: usize,

    /// Maximum number of simultaneously open client connections.
    #[arg(long, default_value_t = 10_000, env = "KINETA_MAX_CLIENTS")]
    max_clients: usize,

    /// Per-connection pending-command queue byte ceiling.
    #[arg(long, default_value_t = kineta_conn::DEFAULT_QUEUE_BYTE_CEILING, env = "KINETA_QUEUE_BYTE_CEILING")]
    queue_byte_ceiling: usize,

    /// Per-thread cap on pooled pipeline-message allocations, in bytes.
    #[arg(long, default_value_t = 1024 * 1024, env = "KINETA_PIPELINE_CACHE_BYTES")]
    pipeline_cache_bytes: usize,

    /// Journal ring capacity per shard, in records.
    #[arg(long, default_value_t = DEFAULT_JOURNAL_CAPACITY, env = "KINETA_JOURNAL_CAPACITY")]
    journal_capacity: usize,

    /// Cluster slot-routing mode.
    #[arg(long, value_enum, default_value_t = CliClusterMode::Disabled, env = "KINETA_CLUSTER_MODE")]
    cluster_mode: CliClusterMode,

    /// Slot ranges owned by other nodes, as `start-end=host:port`. Keys in
    /// these ranges answer with a MOVED redirect when cluster mode is
    /// enabled.
    #[arg(long = "cluster-assign", env = "KINETA_CLUSTER_ASSIGN", value_delimiter = ',')]
    cluster_assign: Vec<String>,

    /// Hostname this node advertises to cluster peers.
    #[arg(long, default_value = "127.0.0.1", env = "KINETA_ADVERTISE_HOST")]
    advertise_host: String,

    /// Port this node advertises to cluster peers.
    #[arg(long, default_value_t = 6379, env = "KINETA_ADVERTISE_PORT")]
    advertise_port: u16,

    /// Require clients to AUTH with this password before running commands.
    #[arg(long, env = "KINETA_REQUIREPASS")]
    requirepass: Option<String>,

    /// Directory snapshots are written into.
    #[arg(long, default_value = ".", env = "KINETA_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,

    /// Snapshot filename template; `{ts}` expands to a unix timestamp.
    #[arg(long, default_value = "kineta-{ts}.snap", env = "KINETA_SNAPSHOT_TEMPLATE")]
    snapshot_template: String,

    /// Periodic snapshot interval, e.g. `5m`; omit to snapshot only on
    /// SAVE/BGSAVE.
    #[arg(long, value_parser = humantime::parse_duration, env = "KINETA_SNAPSHOT_INTERVAL")]
    snapshot_interval: Option<Duration>,

    /// Snapshot file to load before serving traffic.
    #[arg(long, env = "KINETA_LOAD_SNAPSHOT")]
    load_snapshot: Option<PathBuf>,

    /// Enable TLS termination via a fronting proxy; the engine only records
    /// the material paths below for tooling to consume.
    #[arg(long, default_value_t = false, env = "KINETA_TLS")]
    tls: bool,

    #[arg(long, env = "KINETA_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "KINETA_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    #[arg(long, env = "KINETA_TLS_CA_FILE")]
    tls_ca_file: Option<PathBuf>,

    /// How often each shard re-checks maintenance when no command traffic
    /// is keeping it busy.
    #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration, env = "KINETA_MAINTENANCE_INTERVAL")]
    maintenance_interval: Duration,

    /// Tracing filter, e.g. `info`, `debug`, `kineta_conn=trace,warn`.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliClusterMode {
    Disabled,
    Emulated,
    Enabled,
}

impl std::fmt::Display for CliClusterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CliClusterMode::Disabled => "disabled",
            CliClusterMode::Emulated => "emulated",
            CliClusterMode::Enabled => "enabled",
        };
        f.write_str(s)
    }
}

impl From<CliClusterMode> for ClusterMode {
    fn from(mode: CliClusterMode) -> Self {
        match mode {
            CliClusterMode::Disabled => ClusterMode::Disabled,
            CliClusterMode::Emulated => ClusterMode::Emulated,
            CliClusterMode::Enabled => ClusterMode::Enabled,
        }
    }
}

fn install_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter.to_string()))
        .with_target(false)
        .init();
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Copies one shard's monotonically-increasing stats into its published
/// counters. Both sides only ever grow, so a plain overwrite keeps this
/// idempotent.
fn publish_shard_stats(shard: &EngineShard, counters: &ShardCounters) {
    counters.hops_run.store(shard.state.stats.hops_run, Ordering::Relaxed);
    let expired: u64 = (0..shard.state.db.num_dbs()).map(|db| shard.state.db.table(db).stats.expired_keys).sum();
    counters.keys_expired.store(expired, Ordering::Relaxed);
}

/// One shard's event loop: alternates waiting for the next dispatched
/// closure with periodic maintenance, then drives any transactions the
/// closure scheduled. Runs on its own `current_thread` runtime pinned to a
/// dedicated OS thread, so every closure has exclusive access to the shard.
fn run_shard(
    mut shard: EngineShard,
    mut hops: HopQueue<EngineShard>,
    counters: Arc<ShardCounters>,
    cancel: CancellationToken,
    maintenance_interval: Duration,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(shard = shard.state.id.0, error = %err, "failed to start shard runtime");
            return;
        }
    };

    runtime.block_on(async move {
        let mut maintenance = tokio::time::interval(maintenance_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ran = hops.recv_one(&mut shard) => {
                    if !ran {
                        break;
                    }
                    counters.commands_processed.fetch_add(1, Ordering::Relaxed);
                    let drained = hops.drain(&mut shard);
                    counters.commands_processed.fetch_add(drained as u64, Ordering::Relaxed);
                    shard.run_ready(now_ms());
                    publish_shard_stats(&shard, &counters);
                }
                _ = maintenance.tick() => {
                    hops.drain(&mut shard);
                    shard.tick(now_ms(), |_| false);
                    publish_shard_stats(&shard, &counters);
                }
            }
        }
        tracing::info!(shard = shard.state.id.0, "shard event loop stopped");
    });
}

/// Parses one `start-end=host:port` foreign-range assignment.
fn parse_assignment(raw: &str) -> anyhow::Result<(u16, u16, NodeAddr)> {
    let (range, owner) = raw.split_once('=').context("expected start-end=host:port")?;
    let (start, end) = range.split_once('-').context("expected start-end")?;
    let (host, port) = owner.rsplit_once(':').context("expected host:port")?;
    Ok((
        start.trim().parse().context("bad range start")?,
        end.trim().parse().context("bad range end")?,
        NodeAddr { host: host.trim().to_string(), port: port.trim().parse().context("bad port")? },
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    install_logging(&cli.log_level);

    tracing::info!(shards = cli.shards, bind_addr = %cli.bind_addr, "starting kineta-server");

    let cluster_mode: ClusterMode = cli.cluster_mode.into();
    let mut slots = SlotTable::single_node(
        cluster_mode,
        NodeAddr { host: cli.advertise_host.clone(), port: cli.advertise_port },
        cli.shards,
    );
    for raw in &cli.cluster_assign {
        let (start, end, owner) = parse_assignment(raw).with_context(|| format!("invalid --cluster-assign '{raw}'"))?;
        slots.assign(start, end, owner);
    }

    let cancel = CancellationToken::new();

    let shard_counters: Vec<Arc<ShardCounters>> = (0..cli.shards).map(|_| ShardCounters::new()).collect();
    let mut senders = Vec::with_capacity(cli.shards as usize);
    let mut shard_threads = Vec::with_capacity(cli.shards as usize);

    for shard_id in 0..cli.shards {
        let shard = EngineShard::new(ShardId(shard_id), cli.shards, cli.num_dbs, cli.journal_capacity);
        let (hops, sender) = HopQueue::new();
        senders.push(sender);

        let counters = shard_counters[shard_id as usize].clone();
        let shard_cancel = cancel.child_token();
        let maintenance_interval = cli.maintenance_interval;
        let handle = std::thread::Builder::new()
            .name(format!("kineta-shard-{shard_id}"))
            .spawn(move || run_shard(shard, hops, counters, shard_cancel, maintenance_interval))
            .context("failed to spawn shard thread")?;
        shard_threads.push(handle);
    }

    let router = Router::new(senders);
    let process = ProcessCounters::new();

    let config = RuntimeConfig {
        num_shards: cli.shards,
        num_dbs: cli.num_dbs,
        max_clients: cli.max_clients,
        pipeline_cache_limit: cli.pipeline_cache_bytes,
        queue_byte_ceiling: cli.queue_byte_ceiling,
        snapshot_interval: cli.snapshot_interval,
        snapshot_dir: cli.snapshot_dir.clone(),
        snapshot_template: cli.snapshot_template.clone(),
        requirepass: cli.requirepass.clone(),
        tls: TlsConfig {
            enabled: cli.tls,
            cert_file: cli.tls_cert_file.clone(),
            key_file: cli.tls_key_file.clone(),
            ca_file: cli.tls_ca_file.clone(),
        },
    };

    let ctx = ServerContext::new(
        router,
        config,
        Arc::new(slots),
        cluster_mode,
        shard_counters.clone(),
        process.clone(),
        uuid::Uuid::new_v4().to_string(),
    );

    if let Some(path) = &cli.load_snapshot {
        let loaded = kineta_conn::load_snapshot(&ctx.router, path)
            .await
            .with_context(|| format!("failed to load snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), records = loaded, "snapshot loaded");
    }

    let metrics_addr: SocketAddr = cli.metrics_addr.parse().context("invalid --metrics-addr")?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await.context("failed to bind metrics listener")?;
    let metrics_router = kineta_metrics::build_router(shard_counters, process);
    let metrics_cancel = cancel.child_token();
    tokio::spawn(async move {
        let server = axum::serve(metrics_listener, metrics_router).with_graceful_shutdown(async move {
            metrics_cancel.cancelled().await;
        });
        if let Err(err) = server.await {
            tracing::warn!(error = %err, "metrics server exited with an error");
        }
    });
    tracing::info!(addr = %metrics_addr, "serving metrics");

    if let Some(interval) = cli.snapshot_interval {
        let ctx = ctx.clone();
        let snapshot_cancel = cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = snapshot_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match kineta_conn::save_snapshot(&ctx).await {
                            Ok(path) => tracing::info!(path = %path.display(), "periodic snapshot written"),
                            Err(error) => tracing::warn!(%error, "periodic snapshot failed"),
                        }
                    }
                }
            }
        });
    }

    if let Some(addr) = cli.memcache_addr.clone() {
        let ctx = ctx.clone();
        let config = ListenerConfig {
            bind_addr: addr,
            max_connections: cli.max_clients,
            protocol: ListenerProtocol::Memcache,
            admin: false,
        };
        let listener_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(error) = kineta_conn::serve(ctx, config, listener_cancel).await {
                tracing::error!(%error, "memcache listener exited");
            }
        });
    }

    if let Some(addr) = cli.admin_addr.clone() {
        let ctx = ctx.clone();
        let config = ListenerConfig {
            bind_addr: addr,
            max_connections: cli.max_clients,
            protocol: ListenerProtocol::Resp,
            admin: true,
        };
        let listener_cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(error) = kineta_conn::serve(ctx, config, listener_cancel).await {
                tracing::error!(%error, "admin listener exited");
            }
        });
    }

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, shutting down");
            shutdown_cancel.cancel();
        }
    });

    let listener_config = ListenerConfig {
        bind_addr: cli.bind_addr.clone(),
        max_connections: cli.max_clients,
        protocol: ListenerProtocol::Resp,
        admin: false,
    };
    kineta_conn::serve(ctx, listener_config, cancel.child_token()).await?;

    cancel.cancel();
    for handle in shard_threads {
        let _ = handle.join();
    }

    Ok(())
}
