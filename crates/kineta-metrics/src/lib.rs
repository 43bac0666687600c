//! Prometheus exposition and the stats snapshot behind `INFO`: an `axum`
//! router wrapping a `PrometheusHandle` behind `/metrics`, with per-shard
//! counters that are lazily aggregated on scrape rather than contended on
//! the write path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Per-shard counters. Each shard owns its own atomics and a scrape sums
/// across shards instead of taking a lock.
#[derive(Default)]
pub struct ShardCounters {
    pub hops_run: AtomicU64,
    pub commands_processed: AtomicU64,
    pub keys_expired: AtomicU64,
}

impl ShardCounters {
    pub fn new() -> Arc<ShardCounters> {
        Arc::new(ShardCounters::default())
    }
}

/// Process-wide counters owned by the connection layer rather than any one
/// shard: live connection count and how many squashed pipeline dispatches
/// have run.
#[derive(Default)]
pub struct ProcessCounters {
    pub connected_clients: AtomicU64,
    pub total_connections: AtomicU64,
    pub multi_squash_executions: AtomicU64,
}

impl ProcessCounters {
    pub fn new() -> Arc<ProcessCounters> {
        Arc::new(ProcessCounters::default())
    }
}

/// A point-in-time sum across every shard's [`ShardCounters`] plus the
/// process-wide counters, the shape the `INFO` command and the Prometheus
/// scrape both render from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub hops_run: u64,
    pub commands_processed: u64,
    pub keys_expired: u64,
    pub multi_squash_executions: u64,
    pub connected_clients: u64,
    pub total_connections: u64,
}

pub fn aggregate(shards: &[Arc<ShardCounters>], process: &ProcessCounters) -> ServerStats {
    let mut stats = ServerStats {
        connected_clients: process.connected_clients.load(Ordering::Relaxed),
        total_connections: process.total_connections.load(Ordering::Relaxed),
        multi_squash_executions: process.multi_squash_executions.load(Ordering::Relaxed),
        ..Default::default()
    };
    for shard in shards {
        stats.hops_run += shard.hops_run.load(Ordering::Relaxed);
        stats.commands_processed += shard.commands_processed.load(Ordering::Relaxed);
        stats.keys_expired += shard.keys_expired.load(Ordering::Relaxed);
    }
    stats
}

fn publish(stats: ServerStats) {
    metrics::gauge!("kineta_connected_clients").set(stats.connected_clients as f64);
    metrics::counter!("kineta_connections_received_total").absolute(stats.total_connections);
    metrics::counter!("kineta_hops_run_total").absolute(stats.hops_run);
    metrics::counter!("kineta_commands_processed_total").absolute(stats.commands_processed);
    metrics::counter!("kineta_expired_keys_total").absolute(stats.keys_expired);
    metrics::counter!("kineta_multi_squash_executions_total").absolute(stats.multi_squash_executions);
}

#[derive(Clone)]
struct ScrapeState {
    handle: PrometheusHandle,
    shards: Arc<Vec<Arc<ShardCounters>>>,
    process: Arc<ProcessCounters>,
}

/// Builds the `/metrics` router, installing the Prometheus recorder exactly
/// once. `shards` and `process` back the gauges recomputed on every scrape.
pub fn build_router(shards: Vec<Arc<ShardCounters>>, process: Arc<ProcessCounters>) -> axum::Router<()> {
    let handle = PrometheusBuilder::new().install_recorder().expect("failed to install prometheus recorder");

    let state = ScrapeState { handle, shards: Arc::new(shards), process };

    axum::Router::new()
        .route("/metrics", get(scrape))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[tracing::instrument(skip_all)]
async fn scrape(State(state): State<ScrapeState>) -> (StatusCode, String) {
    let stats = aggregate(&state.shards, &state.process);
    publish(stats);
    (StatusCode::OK, state.handle.render())
}
