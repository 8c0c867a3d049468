use super::*;
use crate::bencode::{decode, Dict, Value};
use crate::config::DhtConfig;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct RecordingSocket {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    fail: bool,
}

impl RecordingSocket {
    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

impl DatagramSocket for RecordingSocket {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "unreachable"));
            }
            self.sent.lock().push((target, buf.to_vec()));
            Ok(buf.len())
        })
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

const LOCAL: u16 = 6881;
const PEER: u16 = 7000;

fn echo_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("echo", |args: &Dict, from: SocketAddr| -> HandlerResult {
            let mut out = args.clone();
            out.insert(Bytes::from_static(b"port"), Value::Integer(from.port() as i64));
            Ok(out)
        })
        .unwrap();
    registry
        .register("quiet", |_: &Dict, _: SocketAddr| -> HandlerResult {
            Err(HandlerError::FailSilently)
        })
        .unwrap();
    registry
        .register("bad_args", |_: &Dict, _: SocketAddr| -> HandlerResult {
            Err(HandlerError::Protocol("missing target".into()))
        })
        .unwrap();
    registry
        .register("overloaded", |_: &Dict, _: SocketAddr| -> HandlerResult {
            Err(HandlerError::Server("store full".into()))
        })
        .unwrap();
    registry
        .register("broken", |_: &Dict, _: SocketAddr| -> HandlerResult {
            panic!("handler bug")
        })
        .unwrap();
    registry
}

struct Harness {
    socket: Arc<RecordingSocket>,
    broker: Arc<Broker>,
}

fn harness_with(socket: RecordingSocket, config: &DhtConfig) -> Harness {
    let socket = Arc::new(socket);
    let sender = RateLimitedSender::new(socket.clone(), 0);
    sender.start();
    let broker = Arc::new(Broker::new(
        addr(LOCAL),
        Arc::new(echo_registry()),
        sender,
        config,
    ));
    Harness { socket, broker }
}

fn harness() -> Harness {
    harness_with(RecordingSocket::default(), &DhtConfig::default())
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn decoded(datagram: &[u8]) -> KrpcMessage {
    KrpcMessage::parse(datagram).unwrap()
}

fn args_with(key: &'static [u8], value: Value) -> Dict {
    let mut args = Dict::new();
    args.insert(Bytes::from_static(key), value);
    args
}

#[test]
fn test_message_query_encoding() {
    let msg = KrpcMessage::query(7, "find_node", args_with(b"target", Value::string("x")));
    let raw = msg.encode();
    let value = decode(&raw).unwrap();

    assert_eq!(value.get(b"y").and_then(Value::as_str), Some("q"));
    assert_eq!(value.get(b"q").and_then(Value::as_str), Some("find_node"));
    assert_eq!(
        value.get(b"t").and_then(Value::as_bytes).map(|b| b.to_vec()),
        Some(vec![7])
    );

    let parsed = KrpcMessage::parse(&raw).unwrap();
    assert_eq!(parsed, msg);
    assert_eq!(parsed.short_transaction_id(), Some(7));
}

#[test]
fn test_message_error_payload_forms() {
    let plain = KrpcMessage::parse(b"d1:e14:Method Unknown1:t1:\x011:y1:ee").unwrap();
    assert_eq!(plain.kind, MessageKind::Error("Method Unknown".into()));

    let bep5 = KrpcMessage::parse(b"d1:eli201e13:Generic Errore1:t2:aa1:y1:ee").unwrap();
    assert_eq!(bep5.kind, MessageKind::Error("Generic Error".into()));
    assert_eq!(bep5.short_transaction_id(), None);

    let code = KrpcMessage::parse(b"d1:ei4e1:t1:\x011:y1:ee").unwrap();
    assert_eq!(code.kind, MessageKind::Error("error code 4".into()));
}

#[test]
fn test_message_rejects_malformed() {
    assert!(KrpcMessage::parse(b"not bencode").is_err());
    assert!(KrpcMessage::parse(b"li1ee").is_err());
    assert!(KrpcMessage::parse(b"d1:y1:qe").is_err());
    assert!(KrpcMessage::parse(b"d1:t1:\x001:y1:re").is_err());

    let unknown = KrpcMessage::parse(b"d1:t1:\x001:y1:ze").unwrap();
    assert_eq!(unknown.kind, MessageKind::Unknown(Bytes::from_static(b"z")));
}

#[test]
fn test_registry_fault_mapping() {
    let registry = echo_registry();
    let from = addr(PEER);
    let args = Dict::new();

    assert_eq!(
        registry.dispatch("nope", &args, from),
        Reply::Error("Method Unknown".into())
    );
    assert_eq!(registry.dispatch("quiet", &args, from), Reply::Silent);
    assert_eq!(
        registry.dispatch("bad_args", &args, from),
        Reply::Error("Protocol Error: missing target".into())
    );
    assert_eq!(
        registry.dispatch("overloaded", &args, from),
        Reply::Error("Server Error: store full".into())
    );
    assert_eq!(
        registry.dispatch("broken", &args, from),
        Reply::Error("Server Error".into())
    );
    match registry.dispatch("echo", &args, from) {
        Reply::Response(out) => {
            assert_eq!(out.get(b"port".as_slice()), Some(&Value::Integer(PEER as i64)))
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_registry_rejects_duplicates() {
    let mut registry = echo_registry();
    let err = registry
        .register("echo", |_: &Dict, _: SocketAddr| -> HandlerResult { Ok(Dict::new()) })
        .err();
    assert_eq!(err, Some(RpcError::DuplicateMethod("echo".into())));
}

#[test]
fn test_cache_expiry_is_exact() {
    let t0 = Instant::now();
    let mut cache = ExpiringCache::new();
    cache.get_or_insert_with("old", t0, || 1);
    cache.get_or_insert_with("touched", t0, || 2);
    cache.get_or_insert_with("fresh", t0 + Duration::from_secs(30), || 3);

    // A hit keeps the cached value and refreshes its access time.
    assert_eq!(*cache.get_or_insert_with("touched", t0 + Duration::from_secs(35), || 0), 2);

    let cutoff = t0 + Duration::from_secs(50) - Duration::from_secs(40);
    assert_eq!(cache.expire(cutoff), 1);
    assert!(!cache.contains_key(&"old"));
    assert!(cache.contains_key(&"touched"));
    assert!(cache.contains_key(&"fresh"));

    // An entry accessed exactly at the cutoff survives.
    assert_eq!(cache.expire(t0 + Duration::from_secs(30)), 0);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_token_bucket_pacing() {
    let t0 = Instant::now();
    let mut bucket = TokenBucket::new(100, t0);

    assert_eq!(bucket.reserve(150, t0), Duration::ZERO);
    assert_eq!(bucket.reserve(100, t0), Duration::from_millis(500));
    // One second later the bucket has refilled 100 bytes.
    assert_eq!(bucket.reserve(100, t0 + Duration::from_secs(1)), Duration::ZERO);
}

#[tokio::test]
async fn test_sender_round_robin_between_peers() {
    let socket = Arc::new(RecordingSocket::default());
    let sender = RateLimitedSender::new(socket.clone(), 0);

    for i in 0..3u8 {
        sender.enqueue(Bytes::copy_from_slice(&[b'a', i]), addr(1));
    }
    sender.enqueue(Bytes::from_static(b"b0"), addr(2));
    sender.enqueue(Bytes::from_static(b"c0"), addr(3));
    assert_eq!(sender.queued(), 5);

    sender.start();
    settle().await;

    let order: Vec<Vec<u8>> = socket.sent().into_iter().map(|(_, d)| d).collect();
    assert_eq!(
        order,
        vec![
            vec![b'a', 0],
            b"b0".to_vec(),
            b"c0".to_vec(),
            vec![b'a', 1],
            vec![b'a', 2],
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_sender_delays_over_budget() {
    let socket = Arc::new(RecordingSocket::default());
    let sender = RateLimitedSender::new(socket.clone(), 100);
    sender.start();

    sender.enqueue(Bytes::from(vec![0u8; 200]), addr(1));
    sender.enqueue(Bytes::from(vec![0u8; 100]), addr(2));
    settle().await;
    assert_eq!(socket.sent().len(), 1);
    assert_eq!(sender.queued(), 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    settle().await;
    assert_eq!(socket.sent().len(), 2);
}

#[tokio::test]
async fn test_request_resolves_with_response() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn
        .send_request("find_node", args_with(b"target", Value::string("abc")))
        .unwrap();
    settle().await;

    let sent = h.socket.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, addr(PEER));
    let query = decoded(&sent[0].1);
    match &query.kind {
        MessageKind::Query { method, args } => {
            assert_eq!(method, "find_node");
            assert_eq!(args.get(b"target".as_slice()), Some(&Value::string("abc")));
        }
        other => panic!("expected query, got {:?}", other),
    }

    let payload = args_with(b"id", Value::string("peer"));
    let response = KrpcMessage::response(query.transaction_id.clone(), payload.clone());
    h.broker.on_datagram(addr(PEER), &response.encode());

    assert_eq!(reply.await, Ok(payload));
    assert_eq!(conn.in_flight(), 0);
}

#[tokio::test]
async fn test_request_fails_with_remote_error() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn.send_request("store_value", Dict::new()).unwrap();
    settle().await;
    let tid = decoded(&h.socket.sent()[0].1).transaction_id;

    let error = KrpcMessage::error(tid, "Protocol Error: value too large");
    conn.on_datagram(&error.encode());

    let err = reply.await.unwrap_err();
    assert_eq!(err, RpcError::Remote("Protocol Error: value too large".into()));
    assert!(err.is_protocol_error());
    assert!(!RpcError::Remote("Server Error".into()).is_protocol_error());
}

#[tokio::test]
async fn test_unknown_message_type_fails_transaction() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn.send_request("ping", Dict::new()).unwrap();
    settle().await;
    let tid = decoded(&h.socket.sent()[0].1).transaction_id;

    let odd = KrpcMessage {
        transaction_id: tid,
        kind: MessageKind::Unknown(Bytes::from_static(b"x")),
    };
    conn.on_datagram(&odd.encode());

    assert_eq!(reply.await, Err(RpcError::UnknownMessageType));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_reply_is_dropped() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn.send_request("ping", Dict::new()).unwrap();
    settle().await;
    let tid = decoded(&h.socket.sent()[0].1).transaction_id;

    tokio::time::sleep(DhtConfig::default().rpc_timeout + Duration::from_millis(1)).await;
    assert_eq!(conn.in_flight(), 0);

    let late = KrpcMessage::response(tid, Dict::new());
    conn.on_datagram(&late.encode());

    assert_eq!(reply.await, Err(RpcError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_reply_then_timer_is_noop() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn.send_request("ping", Dict::new()).unwrap();
    settle().await;
    let tid = decoded(&h.socket.sent()[0].1).transaction_id;

    conn.on_datagram(&KrpcMessage::response(tid, Dict::new()).encode());
    tokio::time::sleep(DhtConfig::default().rpc_timeout * 2).await;

    assert_eq!(reply.await, Ok(Dict::new()));
}

#[tokio::test]
async fn test_reply_cancels_timeout_task() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn.send_request("ping", Dict::new()).unwrap();
    settle().await;
    // Only the timer is left once the datagram is out.
    assert_eq!(conn.background_tasks(), 1);

    let tid = decoded(&h.socket.sent()[0].1).transaction_id;
    conn.on_datagram(&KrpcMessage::response(tid, Dict::new()).encode());
    settle().await;

    assert_eq!(conn.background_tasks(), 0);
    assert_eq!(reply.await, Ok(Dict::new()));
}

#[tokio::test]
async fn test_self_request_is_never_sent() {
    let h = harness();

    assert_eq!(
        h.broker.connection_for(addr(LOCAL)).err(),
        Some(RpcError::SelfNode)
    );

    let sender = RateLimitedSender::new(h.socket.clone(), 0);
    let conn = Connection::new(
        addr(LOCAL),
        addr(LOCAL),
        Arc::new(Registry::new()),
        sender,
        Duration::from_secs(1),
    );
    assert_eq!(
        conn.send_request("ping", Dict::new()).err(),
        Some(RpcError::SelfNode)
    );

    settle().await;
    assert!(h.socket.sent().is_empty());
    assert_eq!(h.broker.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transaction_ids_cycle_and_exhaust() {
    let h = harness();
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let mut replies = Vec::new();
    for _ in 0..256 {
        replies.push(conn.send_request("ping", Dict::new()).unwrap());
    }
    assert_eq!(
        conn.send_request("ping", Dict::new()).err(),
        Some(RpcError::TransactionsExhausted)
    );
    settle().await;

    let mut tids: Vec<u8> = h
        .socket
        .sent()
        .iter()
        .filter_map(|(_, d)| decoded(d).short_transaction_id())
        .collect();
    tids.sort_unstable();
    tids.dedup();
    assert_eq!(tids.len(), 256);

    // Freeing one id makes room for exactly one more request.
    conn.on_datagram(&KrpcMessage::response(Bytes::from_static(&[42]), Dict::new()).encode());
    assert!(conn.send_request("ping", Dict::new()).is_ok());
    assert!(conn.send_request("ping", Dict::new()).is_err());
    drop(replies);
}

#[tokio::test]
async fn test_socket_failure_fails_request() {
    let h = harness_with(RecordingSocket::failing(), &DhtConfig::default());
    let conn = h.broker.connection_for(addr(PEER)).unwrap();

    let reply = conn.send_request("ping", Dict::new()).unwrap();
    match reply.await {
        Err(RpcError::Socket(_)) => {}
        other => panic!("expected socket error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_query_is_answered() {
    let h = harness();

    let query = KrpcMessage::query(9, "echo", args_with(b"k", Value::Integer(1)));
    h.broker.on_datagram(addr(PEER), &query.encode());
    settle().await;

    let sent = h.socket.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, addr(PEER));
    let reply = decoded(&sent[0].1);
    assert_eq!(reply.short_transaction_id(), Some(9));
    match reply.kind {
        MessageKind::Response(payload) => {
            assert_eq!(payload.get(b"k".as_slice()), Some(&Value::Integer(1)));
            assert_eq!(
                payload.get(b"port".as_slice()),
                Some(&Value::Integer(PEER as i64))
            );
        }
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_inbound_faults_produce_error_envelopes() {
    let h = harness();

    for (tid, method) in [(1u8, "missing"), (2, "quiet"), (3, "bad_args"), (4, "broken")] {
        let query = KrpcMessage::query(tid, method, Dict::new());
        h.broker.on_datagram(addr(PEER), &query.encode());
    }
    h.broker.on_datagram(addr(PEER), b"garbage");
    settle().await;

    let replies: Vec<KrpcMessage> = h.socket.sent().iter().map(|(_, d)| decoded(d)).collect();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].kind, MessageKind::Error("Method Unknown".into()));
    assert_eq!(
        replies[1].kind,
        MessageKind::Error("Protocol Error: missing target".into())
    );
    assert_eq!(replies[1].short_transaction_id(), Some(3));
    assert_eq!(replies[2].kind, MessageKind::Error("Server Error".into()));
}

#[tokio::test(start_paused = true)]
async fn test_broker_reuses_and_expires_connections() {
    let h = harness();

    let a1 = h.broker.connection_for(addr(1)).unwrap();
    let a2 = h.broker.connection_for(addr(1)).unwrap();
    assert!(Arc::ptr_eq(&a1, &a2));

    tokio::time::advance(Duration::from_secs(30)).await;
    h.broker.connection_for(addr(2)).unwrap();
    h.broker.connection_for(addr(3)).unwrap();

    tokio::time::advance(Duration::from_secs(15)).await;
    // addr(3) is touched right before the sweep.
    h.broker.connection_for(addr(3)).unwrap();

    assert_eq!(h.broker.expire_connections(), 1);
    assert_eq!(h.broker.connection_count(), 2);

    let a3 = h.broker.connection_for(addr(1)).unwrap();
    assert!(!Arc::ptr_eq(&a1, &a3));
}

#[tokio::test(start_paused = true)]
async fn test_broker_expiry_task_repeats() {
    let h = harness();
    let _expiry = h.broker.spawn_expiry();
    let ttl = DhtConfig::default().connection_ttl;

    h.broker.connection_for(addr(1)).unwrap();
    tokio::time::sleep(ttl * 2 + Duration::from_secs(1)).await;
    assert_eq!(h.broker.connection_count(), 0);

    h.broker.connection_for(addr(2)).unwrap();
    tokio::time::sleep(ttl * 2 + Duration::from_secs(1)).await;
    assert_eq!(h.broker.connection_count(), 0);
}
