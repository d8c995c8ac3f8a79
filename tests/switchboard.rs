use ce_kernel::codec::{self, Value};
use ce_kernel::kv::{Kv, MemKv};
use ce_kernel::registry::{DataType, Query, Registry};
use ce_kernel::rpc::{self, RouterHandle};
use ce_kernel::services::{NullEngine, ServiceManager};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

/// One in-process kernel over in-memory stores, listening on a loopback
/// port.
struct Kernel {
    addr: SocketAddr,
    handle: RouterHandle,
    local: Registry,
    global: Registry,
}

async fn boot(node: &str, global_kv: Arc<MemKv>) -> Kernel {
    let local = Registry::local(Arc::new(MemKv::new()) as Arc<dyn Kv>);
    let global = Registry::global(global_kv as Arc<dyn Kv>);
    local
        .create("kernel/services", DataType::Hash, None, None)
        .await
        .unwrap();
    // the global scope is shared; a peer kernel may have declared it first
    let _ = global
        .create("kernel/nodes", DataType::Hash, None, None)
        .await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let services = Arc::new(ServiceManager::new(
        local.clone(),
        Arc::new(NullEngine),
        "test",
        node,
    ));
    let (handle, command_rx) = rpc::command_channel();
    tokio::spawn(rpc::switchboard(
        node.to_string(),
        listener,
        local.clone(),
        global.clone(),
        services,
        Default::default(),
        handle.clone(),
        command_rx,
    ));
    Kernel {
        addr,
        handle,
        local,
        global,
    }
}

impl Kernel {
    async fn declare_service(&self, name: &str, token: &str, scale: i64) {
        let mut fields = serde_json::Map::new();
        fields.insert(
            name.to_string(),
            serde_json::json!({
                "image": format!("img:{name}"),
                "token": token,
                "scale": scale,
            }),
        );
        self.local
            .set("kernel/services", &Query::fields(fields))
            .await
            .unwrap();
    }

    async fn declare_node(&self, name: &str, token: &str, addr: SocketAddr) {
        let mut fields = serde_json::Map::new();
        fields.insert(
            name.to_string(),
            serde_json::json!({
                "token": token,
                "address": [addr.ip().to_string(), addr.port()],
            }),
        );
        self.global
            .set("kernel/nodes", &Query::fields(fields))
            .await
            .unwrap();
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    /// Connect and authenticate as a service instance. Auth success is
    /// silent; frames on one socket are handled in order, so no
    /// confirmation is needed before sending more.
    async fn auth(addr: SocketAddr, service: &str, instance: i64, token: &str) -> Self {
        let mut client = Client::connect(addr).await;
        client
            .send(&[
                Value::from("connect"),
                Value::from(service),
                Value::Int(instance),
                Value::from(token),
                empty_map(),
            ])
            .await;
        client
    }

    async fn send(&mut self, frame: &[Value]) {
        codec::write_frame(&mut self.stream, frame).await.unwrap();
    }

    async fn recv(&mut self) -> Vec<Value> {
        timeout(Duration::from_secs(5), codec::read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed unexpectedly")
    }

    /// The kernel closed this connection: the next read fails without
    /// delivering a frame.
    async fn expect_closed(&mut self) {
        let read = timeout(Duration::from_secs(5), codec::read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for the close");
        assert!(read.is_err(), "expected a closed connection, got {read:?}");
    }
}

fn empty_map() -> Value {
    Value::Map(BTreeMap::new())
}

fn request(
    node: Value,
    service: &str,
    instance: Value,
    method: &str,
    args: Vec<Value>,
    kwargs: Value,
    rid: Value,
) -> Vec<Value> {
    vec![
        Value::from("request"),
        Value::List(vec![node, Value::from(service), instance]),
        Value::from(method),
        Value::List(args),
        kwargs,
        rid,
    ]
}

fn response(result: Value, error: Value, rid: &str) -> Vec<Value> {
    vec![Value::from("response"), result, error, Value::from(rid)]
}

fn error_name(frame: &[Value]) -> &str {
    frame[2].as_list().unwrap()[0].as_str().unwrap()
}

#[tokio::test]
async fn local_call_roundtrip() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;
    kernel.declare_service("B", "tb", 1).await;
    let mut a = Client::auth(kernel.addr, "A", 1, "ta").await;
    let mut b = Client::auth(kernel.addr, "B", 1, "tb").await;
    sleep(Duration::from_millis(200)).await;

    a.send(&request(
        Value::from("__local__"),
        "B",
        Value::Int(1),
        "add",
        vec![Value::Int(2), Value::Int(3)],
        empty_map(),
        Value::from("r1"),
    ))
    .await;

    // delivered with the origin triple in place of the target
    let delivered = b.recv().await;
    assert_eq!(
        delivered,
        vec![
            Value::from("request"),
            Value::List(vec![Value::from("N1"), Value::from("A"), Value::Int(1)]),
            Value::from("add"),
            Value::List(vec![Value::Int(2), Value::Int(3)]),
            empty_map(),
            Value::from("r1"),
        ]
    );

    b.send(&response(Value::Int(5), Value::Null, "r1")).await;
    assert_eq!(a.recv().await, response(Value::Int(5), Value::Null, "r1"));
}

#[tokio::test]
async fn balanced_calls_walk_instances_round_robin() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("W", "tw", 3).await;
    kernel.declare_service("C", "tc", 1).await;
    let mut w1 = Client::auth(kernel.addr, "W", 1, "tw").await;
    let mut w2 = Client::auth(kernel.addr, "W", 2, "tw").await;
    let mut w3 = Client::auth(kernel.addr, "W", 3, "tw").await;
    let mut caller = Client::auth(kernel.addr, "C", 1, "tc").await;
    sleep(Duration::from_millis(200)).await;

    let balanced = |rid: String| {
        request(
            Value::Null,
            "W",
            Value::Null,
            "work",
            vec![],
            empty_map(),
            Value::from(rid),
        )
    };
    // cursor starts at -1: three requests land on 1, 2, 3, the fourth
    // wraps back to 1
    let mut workers = [w1, w2, w3];
    for (rid, idx) in [("r1", 0), ("r2", 1), ("r3", 2), ("r4", 0)] {
        caller.send(&balanced(rid.to_string())).await;
        let delivered = workers[idx].recv().await;
        assert_eq!(delivered[5], Value::from(rid));
    }
}

#[tokio::test]
async fn cross_node_call_roundtrip() {
    let shared = Arc::new(MemKv::new());
    let k1 = boot("N1", shared.clone()).await;
    let k2 = boot("N2", shared).await;
    k1.declare_node("N1", "tn1", k1.addr).await;
    k1.declare_node("N2", "tn2", k2.addr).await;
    k1.declare_service("A", "ta", 1).await;
    k2.declare_service("B", "tb", 1).await;

    let mut a = Client::auth(k1.addr, "A", 1, "ta").await;
    let mut b = Client::auth(k2.addr, "B", 1, "tb").await;
    sleep(Duration::from_millis(200)).await;
    k1.handle.connect_peer("N2").await.unwrap();

    a.send(&request(
        Value::from("N2"),
        "B",
        Value::Int(1),
        "add",
        vec![Value::Int(2), Value::Int(3)],
        empty_map(),
        Value::from("r7"),
    ))
    .await;

    let delivered = b.recv().await;
    assert_eq!(
        delivered,
        vec![
            Value::from("request"),
            Value::List(vec![Value::from("N1"), Value::from("A"), Value::Int(1)]),
            Value::from("add"),
            Value::List(vec![Value::Int(2), Value::Int(3)]),
            empty_map(),
            Value::from("r7"),
        ]
    );

    b.send(&response(Value::Int(5), Value::Null, "r7")).await;
    assert_eq!(a.recv().await, response(Value::Int(5), Value::Null, "r7"));
}

#[tokio::test]
async fn auth_failure_closes_silently() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;
    kernel.declare_service("C", "tc", 1).await;

    let mut intruder = Client::auth(kernel.addr, "A", 1, "wrong").await;
    intruder.expect_closed().await;

    // instances outside 1..=scale are refused the same way
    let mut outside = Client::auth(kernel.addr, "A", 2, "ta").await;
    outside.expect_closed().await;

    // and the directory never saw A
    let mut caller = Client::auth(kernel.addr, "C", 1, "tc").await;
    sleep(Duration::from_millis(100)).await;
    caller
        .send(&request(
            Value::Null,
            "A",
            Value::Int(1),
            "ping",
            vec![],
            empty_map(),
            Value::from("r9"),
        ))
        .await;
    let reply = caller.recv().await;
    assert_eq!(reply[0], Value::from("response"));
    assert_eq!(reply[1], Value::Null);
    assert_eq!(error_name(&reply), "ce_kernel::rpc::Route");
    assert_eq!(reply[3], Value::from("r9"));
}

#[tokio::test]
async fn fire_and_forget_failure_closes_the_source() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;
    let mut a = Client::auth(kernel.addr, "A", 1, "ta").await;
    sleep(Duration::from_millis(100)).await;

    a.send(&request(
        Value::Null,
        "ghost",
        Value::Int(1),
        "ping",
        vec![],
        empty_map(),
        Value::Null,
    ))
    .await;
    // no error frame: the connection just goes away
    a.expect_closed().await;
}

#[tokio::test]
async fn roles_are_terminal() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;

    // a REG socket may not speak service opcodes
    let mut unauthed = Client::connect(kernel.addr).await;
    unauthed
        .send(&request(
            Value::Null,
            "A",
            Value::Int(1),
            "ping",
            vec![],
            empty_map(),
            Value::from("r1"),
        ))
        .await;
    unauthed.expect_closed().await;

    // a SERVICE socket may not re-authenticate
    let mut a = Client::auth(kernel.addr, "A", 1, "ta").await;
    sleep(Duration::from_millis(100)).await;
    a.send(&[
        Value::from("connect"),
        Value::from("A"),
        Value::Int(1),
        Value::from("ta"),
        empty_map(),
    ])
    .await;
    a.expect_closed().await;

    // nor speak node opcodes
    let mut b = Client::auth(kernel.addr, "A", 1, "ta").await;
    sleep(Duration::from_millis(100)).await;
    b.send(&[
        Value::from("proxy_status"),
        Value::Null,
        Value::from("p1"),
    ])
    .await;
    b.expect_closed().await;
}

#[tokio::test]
async fn reauth_evicts_the_previous_socket() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;
    kernel.declare_service("C", "tc", 1).await;

    let mut first = Client::auth(kernel.addr, "A", 1, "ta").await;
    sleep(Duration::from_millis(100)).await;
    let mut second = Client::auth(kernel.addr, "A", 1, "ta").await;
    first.expect_closed().await;

    let mut caller = Client::auth(kernel.addr, "C", 1, "tc").await;
    sleep(Duration::from_millis(100)).await;
    caller
        .send(&request(
            Value::Null,
            "A",
            Value::Int(1),
            "ping",
            vec![],
            empty_map(),
            Value::from("r1"),
        ))
        .await;
    let delivered = second.recv().await;
    assert_eq!(delivered[0], Value::from("request"));
    assert_eq!(delivered[5], Value::from("r1"));
}

#[tokio::test]
async fn unknown_rid_responses_are_dropped() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;
    kernel.declare_service("B", "tb", 1).await;
    let mut a = Client::auth(kernel.addr, "A", 1, "ta").await;
    let mut b = Client::auth(kernel.addr, "B", 1, "tb").await;
    sleep(Duration::from_millis(200)).await;

    // stale reply: nobody is waiting for this rid
    b.send(&response(Value::Int(1), Value::Null, "stale")).await;

    // the socket survives and keeps serving correlated traffic
    a.send(&request(
        Value::Null,
        "B",
        Value::Int(1),
        "add",
        vec![Value::Int(1), Value::Int(1)],
        empty_map(),
        Value::from("r1"),
    ))
    .await;
    let delivered = b.recv().await;
    assert_eq!(delivered[5], Value::from("r1"));
    b.send(&response(Value::Int(2), Value::Null, "r1")).await;
    assert_eq!(a.recv().await, response(Value::Int(2), Value::Null, "r1"));
}

#[tokio::test]
async fn proxy_to_unknown_hop_reports_status() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_node("NX", "tx", kernel.addr).await;

    // a peer kernel authenticates its socket into the NODE role
    let mut peer = Client::connect(kernel.addr).await;
    peer.send(&[
        Value::from("connect_node"),
        Value::from("NX"),
        Value::from("tx"),
        empty_map(),
    ])
    .await;
    peer.send(&[
        Value::from("proxy"),
        Value::from("NOPE"),
        Value::List(vec![Value::from("NX"), Value::from("A"), Value::Int(1)]),
        Value::List(response(Value::Null, Value::Null, "r1")),
        Value::from("p1"),
    ])
    .await;

    let status = peer.recv().await;
    assert_eq!(status[0], Value::from("proxy_status"));
    assert_eq!(
        status[1].as_list().unwrap()[0],
        Value::from("ce_kernel::rpc::Route")
    );
    assert_eq!(status[2], Value::from("p1"));
}

#[tokio::test]
async fn kernel_api_serves_registry_and_service_ops() {
    let kernel = boot("N1", Arc::new(MemKv::new())).await;
    kernel.declare_service("A", "ta", 1).await;
    let mut a = Client::auth(kernel.addr, "A", 1, "ta").await;
    sleep(Duration::from_millis(100)).await;

    a.send(&request(
        Value::Null,
        "kernel",
        Value::Null,
        "registry.local.create",
        vec![Value::from("cfg")],
        Value::Map(BTreeMap::from([(
            "type".to_string(),
            Value::from("hash"),
        )])),
        Value::from("r1"),
    ))
    .await;
    assert_eq!(a.recv().await, response(Value::Bool(true), Value::Null, "r1"));

    a.send(&request(
        Value::Null,
        "kernel",
        Value::Null,
        "registry.local.set",
        vec![Value::from("cfg")],
        Value::Map(BTreeMap::from([(
            "keys".to_string(),
            Value::Map(BTreeMap::from([("x".to_string(), Value::Int(1))])),
        )])),
        Value::from("r2"),
    ))
    .await;
    assert_eq!(a.recv().await, response(Value::Bool(true), Value::Null, "r2"));

    a.send(&request(
        Value::Null,
        "kernel",
        Value::Null,
        "registry.local.get",
        vec![Value::from("cfg")],
        Value::Map(BTreeMap::from([(
            "keys".to_string(),
            Value::List(vec![Value::from("x"), Value::from("y")]),
        )])),
        Value::from("r3"),
    ))
    .await;
    let reply = a.recv().await;
    assert_eq!(
        reply[1],
        Value::Map(BTreeMap::from([
            ("x".to_string(), Value::Int(1)),
            ("y".to_string(), Value::Null),
        ]))
    );

    // unknown names stay route errors: the dispatch table is closed
    a.send(&request(
        Value::Null,
        "kernel",
        Value::Null,
        "registry.local.rpush",
        vec![Value::from("cfg")],
        empty_map(),
        Value::from("r4"),
    ))
    .await;
    let reply = a.recv().await;
    assert_eq!(error_name(&reply), "ce_kernel::rpc::Route");

    a.send(&request(
        Value::Null,
        "kernel",
        Value::Null,
        "service.list",
        vec![],
        empty_map(),
        Value::from("r5"),
    ))
    .await;
    let reply = a.recv().await;
    let listed = reply[1].as_map().expect("service.list returns a map");
    assert!(listed.contains_key("A"));
}
