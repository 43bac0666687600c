//! End-to-end tests driving the wire protocols against in-process engine
//! shards: real sockets, real shard tasks, real dispatch.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use kineta_base::{Lsn, ShardId, SlotId, NUM_SLOTS};
use kineta_cluster::{ClusterMode, NodeAddr, SlotTable};
use kineta_conn::{
    apply, load_snapshot, replay_journal, save_snapshot, serve_listener, ListenerConfig, ListenerProtocol, Router,
    RuntimeConfig, ServerContext,
};
use kineta_coroutines::HopQueue;
use kineta_engine_shard::{EngineShard, ShardState};
use kineta_metrics::{ProcessCounters, ShardCounters};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    cancel: CancellationToken,
}

async fn start_server(shards: u32, cluster: Option<(SlotTable, ClusterMode)>, mutate: impl FnOnce(&mut RuntimeConfig)) -> TestServer {
    let mut senders = Vec::new();
    for id in 0..shards {
        let mut shard = EngineShard::new(ShardId(id), shards, 16, 16 * 1024);
        let (mut hops, sender) = HopQueue::new();
        senders.push(sender);
        tokio::spawn(async move {
            while hops.recv_one(&mut shard).await {
                hops.drain(&mut shard);
                shard.run_ready(now_ms());
            }
        });
    }
    let router = Router::new(senders);

    let (slots, mode) = cluster.unwrap_or_else(|| {
        (
            SlotTable::single_node(ClusterMode::Disabled, NodeAddr { host: "127.0.0.1".into(), port: 6379 }, shards),
            ClusterMode::Disabled,
        )
    });

    let mut config = RuntimeConfig { num_shards: shards, ..RuntimeConfig::default() };
    mutate(&mut config);

    let ctx = ServerContext::new(
        router,
        config,
        Arc::new(slots),
        mode,
        (0..shards).map(|_| ShardCounters::new()).collect(),
        ProcessCounters::new(),
        "node-under-test".into(),
    );

    let cancel = CancellationToken::new();
    let addr = start_listener(&ctx, ListenerProtocol::Resp, &cancel).await;
    TestServer { addr, ctx, cancel }
}

async fn start_listener(ctx: &Arc<ServerContext>, protocol: ListenerProtocol, cancel: &CancellationToken) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let config = ListenerConfig { bind_addr: addr.to_string(), max_connections: 64, protocol, admin: false };
    let serve_ctx = ctx.clone();
    let serve_cancel = cancel.child_token();
    tokio::spawn(async move {
        let _ = serve_listener(listener, serve_ctx, config, serve_cancel).await;
    });
    addr
}

fn encode(parts: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn expect(stream: &mut TcpStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    stream.read_exact(&mut buf).await.expect("read reply");
    assert_eq!(
        String::from_utf8_lossy(&buf),
        expected,
        "unexpected reply bytes",
    );
}

async fn send(stream: &mut TcpStream, parts: &[&str]) {
    stream.write_all(&encode(parts)).await.expect("write request");
}

async fn roundtrip(stream: &mut TcpStream, parts: &[&str], expected: &str) {
    send(stream, parts).await;
    expect(stream, expected).await;
}

/// Seeds a key directly through the router, bypassing the wire.
async fn seed(ctx: &Arc<ServerContext>, key: &str, value: &str) {
    let argv: Vec<Vec<u8>> = vec![b"SET".to_vec(), key.as_bytes().to_vec(), value.as_bytes().to_vec()];
    let shard = ctx.router.shard_for(key.as_bytes());
    let now = now_ms();
    ctx.router
        .dispatch_to_shard(shard, move |state: &mut ShardState| {
            apply(state, 0, now, &argv, false);
        })
        .await
        .expect("seed dispatch");
}

async fn read_value(ctx: &Arc<ServerContext>, key: &str) -> Option<Vec<u8>> {
    let key_bytes = key.as_bytes().to_vec();
    let shard = ctx.router.shard_for(&key_bytes);
    let now = now_ms();
    ctx.router
        .dispatch_to_shard(shard, move |state: &mut ShardState| {
            match state.db.find(0, &key_bytes, now) {
                Some(kineta_db_slice::PrimeValue::Str(s)) => Some(s.clone()),
                _ => None,
            }
        })
        .await
        .expect("read dispatch")
}

#[tokio::test]
async fn ping_set_get_round_trip() {
    let server = start_server(2, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["PING"], "+PONG\r\n").await;
    roundtrip(&mut conn, &["SET", "k", "v"], "+OK\r\n").await;
    roundtrip(&mut conn, &["GET", "k"], "$1\r\nv\r\n").await;
    roundtrip(&mut conn, &["GET", "missing"], "$-1\r\n").await;
    roundtrip(&mut conn, &["DEL", "k"], ":1\r\n").await;
    roundtrip(&mut conn, &["DEL", "k"], ":0\r\n").await;
}

#[tokio::test]
async fn pipelined_burst_is_squashed_and_replies_stay_ordered() {
    let server = start_server(4, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    // Send the whole burst before reading anything, so the parser sees an
    // unparsed tail and routes the burst through the pending queue.
    let mut burst = Vec::new();
    burst.extend_from_slice(&encode(&["SET", "a", "1"]));
    burst.extend_from_slice(&encode(&["SET", "b", "2"]));
    burst.extend_from_slice(&encode(&["SET", "c", "3"]));
    burst.extend_from_slice(&encode(&["GET", "a"]));
    burst.extend_from_slice(&encode(&["GET", "b"]));
    burst.extend_from_slice(&encode(&["GET", "c"]));
    conn.write_all(&burst).await.unwrap();

    expect(&mut conn, "+OK\r\n+OK\r\n+OK\r\n$1\r\n1\r\n$1\r\n2\r\n$1\r\n3\r\n").await;
    assert!(
        server.ctx.process.multi_squash_executions.load(Ordering::Relaxed) >= 1,
        "the burst should have run as at least one squashed dispatch",
    );
}

#[tokio::test]
async fn mset_mget_span_shards_and_preserve_order() {
    let server = start_server(4, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["MSET", "x1", "A", "x2", "B", "x3", "C"], "+OK\r\n").await;
    roundtrip(&mut conn, &["MGET", "x1", "x2", "x3"], "*3\r\n$1\r\nA\r\n$1\r\nB\r\n$1\r\nC\r\n").await;
    roundtrip(&mut conn, &["EXISTS", "x1", "x2", "nope"], ":2\r\n").await;
}

#[tokio::test]
async fn px_expiry_is_enforced_and_counted() {
    let server = start_server(2, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["SET", "k", "v", "PX", "50"], "+OK\r\n").await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    roundtrip(&mut conn, &["GET", "k"], "$-1\r\n").await;

    let expired: u64 = server
        .ctx
        .router
        .broadcast(|state: &mut ShardState| (0..state.db.num_dbs()).map(|db| state.db.table(db).stats.expired_keys).sum::<u64>())
        .await
        .unwrap()
        .into_iter()
        .sum();
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn foreign_slot_gets_a_moved_redirect() {
    let local = NodeAddr { host: "127.0.0.1".into(), port: 6379 };
    let remote = NodeAddr { host: "10.0.0.9".into(), port: 7000 };
    let mut slots = SlotTable::single_node(ClusterMode::Enabled, local, 2);
    // The upper half of the slot space lives elsewhere.
    slots.assign(NUM_SLOTS / 2, NUM_SLOTS - 1, remote);

    let server = start_server(2, Some((slots, ClusterMode::Enabled)), |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    let foreign = (0u64..)
        .map(|i| format!("k{i}"))
        .find(|k| SlotId::of_key(k.as_bytes()).0 >= NUM_SLOTS / 2)
        .unwrap();
    let slot = SlotId::of_key(foreign.as_bytes()).0;

    send(&mut conn, &["GET", &foreign]).await;
    expect(&mut conn, &format!("-MOVED {slot} 10.0.0.9:7000\r\n")).await;

    // A locally-owned key still serves normally.
    let owned = (0u64..)
        .map(|i| format!("h{i}"))
        .find(|k| SlotId::of_key(k.as_bytes()).0 < NUM_SLOTS / 2)
        .unwrap();
    roundtrip(&mut conn, &["SET", &owned, "v"], "+OK\r\n").await;
}

#[tokio::test]
async fn multi_exec_runs_queued_commands_atomically_per_shard() {
    let server = start_server(4, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["MULTI"], "+OK\r\n").await;
    roundtrip(&mut conn, &["SET", "t1", "A"], "+QUEUED\r\n").await;
    roundtrip(&mut conn, &["SET", "t2", "B"], "+QUEUED\r\n").await;
    roundtrip(&mut conn, &["GET", "t1"], "+QUEUED\r\n").await;
    roundtrip(&mut conn, &["EXEC"], "*3\r\n+OK\r\n+OK\r\n$1\r\nA\r\n").await;

    roundtrip(&mut conn, &["GET", "t2"], "$1\r\nB\r\n").await;
    roundtrip(&mut conn, &["EXEC"], "-ERR EXEC without MULTI\r\n").await;
}

#[tokio::test]
async fn exec_aborts_replies_after_the_first_error() {
    let server = start_server(1, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["SET", "s", "text"], "+OK\r\n").await;
    roundtrip(&mut conn, &["MULTI"], "+OK\r\n").await;
    roundtrip(&mut conn, &["INCR", "s"], "+QUEUED\r\n").await;
    roundtrip(&mut conn, &["SET", "after", "x"], "+QUEUED\r\n").await;
    send(&mut conn, &["EXEC"]).await;
    expect(
        &mut conn,
        "*2\r\n-ERR value is not an integer or out of range\r\n-EXECABORT Transaction discarded because of previous errors.\r\n",
    )
    .await;
}

#[tokio::test]
async fn non_transactable_command_poisons_the_multi_block() {
    let server = start_server(1, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["MULTI"], "+OK\r\n").await;
    send(&mut conn, &["FLUSHALL"]).await;
    expect(&mut conn, "-ERR 'FLUSHALL' is not allowed in transactions\r\n").await;
    send(&mut conn, &["EXEC"]).await;
    expect(&mut conn, "-EXECABORT Transaction discarded because of previous errors.\r\n").await;
}

#[tokio::test]
async fn protocol_error_flushes_then_closes() {
    let server = start_server(1, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    conn.write_all(b"PING\r\n").await.unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("-ERR Protocol error:"), "got {text:?}");
}

#[tokio::test]
async fn auth_gates_commands_until_the_password_matches() {
    let server = start_server(1, None, |config| config.requirepass = Some("sesame".into())).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    send(&mut conn, &["GET", "k"]).await;
    expect(&mut conn, "-NOAUTH Authentication required.\r\n").await;
    send(&mut conn, &["AUTH", "wrong"]).await;
    expect(&mut conn, "-WRONGPASS invalid username-password pair\r\n").await;
    roundtrip(&mut conn, &["AUTH", "sesame"], "+OK\r\n").await;
    roundtrip(&mut conn, &["GET", "k"], "$-1\r\n").await;
}

#[tokio::test]
async fn memcache_store_get_delete_session() {
    let server = start_server(2, None, |_| {}).await;
    let mc_addr = start_listener(&server.ctx, ListenerProtocol::Memcache, &server.cancel).await;
    let mut conn = TcpStream::connect(mc_addr).await.unwrap();

    conn.write_all(b"set greet 7 0 5\r\nhello\r\n").await.unwrap();
    expect(&mut conn, "STORED\r\n").await;

    conn.write_all(b"add greet 0 0 3\r\nnew\r\n").await.unwrap();
    expect(&mut conn, "NOT_STORED\r\n").await;

    conn.write_all(b"get greet missing\r\n").await.unwrap();
    expect(&mut conn, "VALUE greet 7 5\r\nhello\r\nEND\r\n").await;

    conn.write_all(b"delete greet\r\n").await.unwrap();
    expect(&mut conn, "DELETED\r\n").await;
    conn.write_all(b"delete greet\r\n").await.unwrap();
    expect(&mut conn, "NOT_FOUND\r\n").await;

    // The two protocols share the keyspace of database 0.
    let mut resp = TcpStream::connect(server.addr).await.unwrap();
    roundtrip(&mut resp, &["SET", "shared", "both"], "+OK\r\n").await;
    conn.write_all(b"get shared\r\n").await.unwrap();
    expect(&mut conn, "VALUE shared 0 4\r\nboth\r\nEND\r\n").await;
}

#[tokio::test]
async fn snapshot_save_then_load_restores_the_keyspace() {
    let dir = tempfile::tempdir().unwrap();
    let source = start_server(3, None, |config| {
        config.snapshot_dir = dir.path().to_path_buf();
    })
    .await;

    for i in 0..50 {
        seed(&source.ctx, &format!("key{i}"), &format!("value{i}")).await;
    }
    let path = save_snapshot(&source.ctx).await.unwrap();

    let restored = start_server(3, None, |_| {}).await;
    let loaded = load_snapshot(&restored.ctx.router, &path).await.unwrap();
    assert_eq!(loaded, 50);

    for i in 0..50 {
        assert_eq!(
            read_value(&restored.ctx, &format!("key{i}")).await.as_deref(),
            Some(format!("value{i}").as_bytes()),
        );
    }
}

#[tokio::test]
async fn snapshot_under_concurrent_overwrites_keeps_the_start_keyset() {
    let dir = tempfile::tempdir().unwrap();
    let source = start_server(2, None, |config| {
        config.snapshot_dir = dir.path().to_path_buf();
    })
    .await;

    for i in 0..200 {
        seed(&source.ctx, &format!("pre{i}"), "old").await;
    }

    let writer_ctx = source.ctx.clone();
    let writer = async move {
        for i in 0..200 {
            seed(&writer_ctx, &format!("pre{i}"), "post").await;
        }
    };
    let (path, ()) = tokio::join!(save_snapshot(&source.ctx), writer);
    let path = path.unwrap();

    let restored = start_server(2, None, |_| {}).await;
    load_snapshot(&restored.ctx.router, &path).await.unwrap();

    let total: usize = restored
        .ctx
        .router
        .broadcast(|state: &mut ShardState| state.db.table(0).len())
        .await
        .unwrap()
        .into_iter()
        .sum();
    assert_eq!(total, 200, "the dump holds exactly the keys present at snapshot start");

    for i in 0..200 {
        let value = read_value(&restored.ctx, &format!("pre{i}")).await.expect("pre-start key must survive");
        assert!(value == b"old" || value == b"post", "unexpected value {:?}", String::from_utf8_lossy(&value));
    }
}

#[tokio::test]
async fn journal_suffix_replays_onto_a_fresh_keyspace() {
    let source = start_server(2, None, |_| {}).await;
    let mut conn = TcpStream::connect(source.addr).await.unwrap();

    roundtrip(&mut conn, &["SET", "j1", "A"], "+OK\r\n").await;
    roundtrip(&mut conn, &["SET", "j2", "B"], "+OK\r\n").await;
    roundtrip(&mut conn, &["DEL", "j1"], ":1\r\n").await;

    let per_shard = source
        .ctx
        .router
        .broadcast(|state: &mut ShardState| state.journal.iter().cloned().collect::<Vec<_>>())
        .await
        .unwrap();

    let replica = start_server(2, None, |_| {}).await;
    for (shard, records) in per_shard.into_iter().enumerate() {
        replay_journal(&replica.ctx.router, ShardId(shard as u32), records).await.unwrap();
    }

    assert_eq!(read_value(&replica.ctx, "j1").await, None);
    assert_eq!(read_value(&replica.ctx, "j2").await.as_deref(), Some(&b"B"[..]));
}

#[tokio::test]
async fn scan_walks_every_shard_and_terminates_at_cursor_zero() {
    use kineta_conn::{execute, ConnectionContext};
    use kineta_wire::RespValue;

    let server = start_server(3, None, |_| {}).await;
    for i in 0..30 {
        seed(&server.ctx, &format!("scan:{i}"), "v").await;
    }
    seed(&server.ctx, "other", "v").await;

    let mut session = ConnectionContext::new(1, false);
    let mut cursor = "0".to_string();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        let args = vec![
            b"SCAN".to_vec(),
            cursor.clone().into_bytes(),
            b"MATCH".to_vec(),
            b"scan:*".to_vec(),
            b"COUNT".to_vec(),
            b"8".to_vec(),
        ];
        let reply = execute(&server.ctx, &mut session, args).await.unwrap();
        let RespValue::Array(Some(parts)) = reply else { panic!("SCAN reply shape") };
        let RespValue::Bulk(Some(next)) = &parts[0] else { panic!("SCAN cursor shape") };
        let RespValue::Array(Some(keys)) = &parts[1] else { panic!("SCAN keys shape") };
        for key in keys {
            let RespValue::Bulk(Some(key)) = key else { panic!("SCAN key shape") };
            assert!(seen.insert(key.clone()), "key {:?} yielded twice", String::from_utf8_lossy(key));
        }
        cursor = String::from_utf8_lossy(next).to_string();
        if cursor == "0" {
            break;
        }
    }
    assert_eq!(cursor, "0", "the cursor must terminate");
    assert_eq!(seen.len(), 30, "MATCH keeps only the scan-prefixed keys");
}

#[tokio::test]
async fn journal_resync_endpoint_reports_eviction() {
    let server = start_server(1, None, |_| {}).await;
    let mut conn = TcpStream::connect(server.addr).await.unwrap();

    roundtrip(&mut conn, &["SET", "a", "1"], "+OK\r\n").await;
    roundtrip(&mut conn, &["SET", "b", "2"], "+OK\r\n").await;

    // A suffix strictly after LSN 0 contains the second write.
    send(&mut conn, &["KINETA", "JOURNAL", "0", "0"]).await;
    let mut buf = vec![0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"*1\r\n");
    // Drain the frame so the connection stays usable.
    let mut rest = vec![0u8; 16];
    let _ = conn.read(&mut rest).await.unwrap();

    let lsns = server
        .ctx
        .router
        .broadcast(|state: &mut ShardState| state.journal.latest_lsn())
        .await
        .unwrap();
    assert_eq!(lsns[0], Lsn(1));
}
