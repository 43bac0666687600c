//! The client-facing connection layer: routes parsed commands to engine
//! shards, runs the per-connection pipeline, collapses pipelined bursts
//! into squashed cross-shard hops, and coordinates snapshot save/load
//! across the shards.

mod commands;
mod connection;
mod context;
mod listener;
mod memcache_conn;
mod persistence;
mod pipeline;
mod router;
mod squash;

pub use commands::{apply, execute, is_squashable, traits_of, CommandTraits};
pub use connection::serve_resp;
pub use context::{ConnectionContext, RuntimeConfig, ServerContext, TlsConfig};
pub use listener::{serve, serve_listener, ListenerConfig, ListenerProtocol};
pub use memcache_conn::serve_memcache;
pub use persistence::{load_snapshot, replay_journal, save_snapshot};
pub use pipeline::{PendingQueue, PipelineMessage, DEFAULT_QUEUE_BYTE_CEILING};
pub use router::Router;
pub use squash::{run_squashed, Squashable, MAX_SUBCOMMANDS_PER_SHARD};

pub(crate) fn unix_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}
