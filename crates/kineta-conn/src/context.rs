//! Shared server state threaded through every connection: the hot-swappable
//! runtime configuration, slot routing, per-process stats handles, and the
//! per-connection session state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use kineta_base::{CommandError, CommandErrorKind, Error, Result, ShardId, TxIdSource};
use kineta_cluster::{ClusterMode, Resolution, SlotTable};
use kineta_metrics::{ProcessCounters, ShardCounters};
use kineta_txn::Coordinator;

use crate::router::Router;
use crate::pipeline::DEFAULT_QUEUE_BYTE_CEILING;

/// Runtime-tunable parameters. Reads clone the current `Arc` out of the
/// lock; `CONFIG SET` mutates a fresh clone and swaps it in, so readers
/// never hold the lock across an `.await`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub num_shards: u32,
    pub num_dbs: usize,
    pub max_clients: usize,
    /// Per-thread cap on pooled pipeline-message allocations, in bytes.
    pub pipeline_cache_limit: usize,
    /// Per-connection pending-queue memory ceiling, in bytes.
    pub queue_byte_ceiling: usize,
    pub snapshot_interval: Option<Duration>,
    pub snapshot_dir: PathBuf,
    /// Snapshot filename template; `{ts}` expands to the unix timestamp at
    /// the moment the dump starts.
    pub snapshot_template: String,
    pub requirepass: Option<String>,
    pub tls: TlsConfig,
}

/// TLS material paths. Termination itself is handled by a fronting proxy;
/// the engine only carries the configuration surface for it.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            num_shards: 1,
            num_dbs: 16,
            max_clients: 10_000,
            pipeline_cache_limit: 1024 * 1024,
            queue_byte_ceiling: DEFAULT_QUEUE_BYTE_CEILING,
            snapshot_interval: None,
            snapshot_dir: PathBuf::from("."),
            snapshot_template: "kineta-{ts}.snap".to_string(),
            requirepass: None,
            tls: TlsConfig::default(),
        }
    }
}

/// Everything a command handler may need beyond the connection itself.
/// One per process, shared by every listener.
pub struct ServerContext {
    pub router: Router,
    config: RwLock<Arc<RuntimeConfig>>,
    pub slots: Arc<SlotTable>,
    pub cluster_mode: ClusterMode,
    pub coordinator: Coordinator,
    pub shard_counters: Vec<Arc<ShardCounters>>,
    pub process: Arc<ProcessCounters>,
    pub node_id: String,
    pub started_at: Instant,
    /// Unix seconds of the last completed snapshot, 0 if none yet.
    pub last_save: AtomicU64,
    next_client_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        router: Router,
        config: RuntimeConfig,
        slots: Arc<SlotTable>,
        cluster_mode: ClusterMode,
        shard_counters: Vec<Arc<ShardCounters>>,
        process: Arc<ProcessCounters>,
        node_id: String,
    ) -> Arc<ServerContext> {
        let num_shards = config.num_shards;
        Arc::new(ServerContext {
            router,
            config: RwLock::new(Arc::new(config)),
            slots,
            cluster_mode,
            coordinator: Coordinator::new(Arc::new(TxIdSource::new()), num_shards),
            shard_counters,
            process,
            node_id,
            started_at: Instant::now(),
            last_save: AtomicU64::new(0),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> Arc<RuntimeConfig> {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Applies `mutate` to a fresh clone of the current config and swaps it
    /// in. Connections pick the new values up on their next read.
    pub fn update_config(&self, mutate: impl FnOnce(&mut RuntimeConfig)) {
        let mut guard = self.config.write().expect("config lock poisoned");
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Routes `key` to its owning shard, or fails with a `MOVED` redirect
    /// when cluster mode assigns its slot to another node.
    pub fn resolve_key(&self, key: &[u8]) -> Result<ShardId> {
        match self.slots.resolve(key) {
            Resolution::Local(shard) => Ok(shard),
            Resolution::Moved(err) => Err(Error::Command(err)),
        }
    }

    pub fn check_db_index(&self, db: usize) -> Result<()> {
        if db >= self.config().num_dbs {
            Err(Error::Command(CommandError::new(CommandErrorKind::OutOfRange, "DB index is out of range")))
        } else {
            Ok(())
        }
    }
}

/// Per-connection session state: the selected database, protocol dialect,
/// authentication, and an open MULTI block's queued commands.
pub struct ConnectionContext {
    pub id: u64,
    pub addr: String,
    pub db: usize,
    pub resp3: bool,
    pub authenticated: bool,
    pub name: Option<String>,
    /// `Some` while a MULTI block is open; holds the queued argument
    /// vectors until EXEC or DISCARD.
    pub multi: Option<Vec<Vec<Vec<u8>>>>,
    /// Set when a queue-time error occurred inside the open MULTI block,
    /// forcing EXEC to abort.
    pub multi_error: bool,
}

impl ConnectionContext {
    pub fn new(id: u64, auth_required: bool) -> Self {
        ConnectionContext {
            id,
            addr: String::new(),
            db: 0,
            resp3: false,
            authenticated: !auth_required,
            name: None,
            multi: None,
            multi_error: false,
        }
    }

    pub fn in_multi(&self) -> bool {
        self.multi.is_some()
    }
}
