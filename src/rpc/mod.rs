use crate::api::{self, ApiContext};
use crate::codec::{self, Value};
use crate::registry::{Query, Registry};
use crate::services::ServiceManager;
use crate::types::*;
use anyhow::Result;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

pub mod types;
pub mod utils;
pub use crate::rpc::{types::*, utils::*};

/// Issues calls into a running switchboard and awaits the correlated
/// response. Cheap to clone. Never use one from the switchboard task
/// itself.
#[derive(Clone)]
pub struct RpcCaller {
    tx: CommandSender,
}

impl RpcCaller {
    pub async fn call(
        &self,
        target: RpcTarget,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, KernelError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Call {
                target,
                method: method.to_string(),
                args,
                kwargs,
                responder,
            })
            .map_err(|_| KernelError::Route("switchboard is not running".to_string()))?;
        rx.await
            .map_err(|_| KernelError::Route("switchboard dropped the call".to_string()))?
    }
}

/// Control handle over a running (or about to run) switchboard.
#[derive(Clone)]
pub struct RouterHandle {
    pub(crate) tx: CommandSender,
}

impl RouterHandle {
    pub fn caller(&self) -> RpcCaller {
        RpcCaller {
            tx: self.tx.clone(),
        }
    }

    pub async fn call(
        &self,
        target: RpcTarget,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, KernelError> {
        self.caller().call(target, method, args, kwargs).await
    }

    /// Dial a peer kernel from the global node directory and install the
    /// socket as NODE.
    pub async fn connect_peer(&self, node: &str) -> Result<(), KernelError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::ConnectPeer {
                node: node.to_string(),
                responder,
            })
            .map_err(|_| KernelError::Route("switchboard is not running".to_string()))?;
        rx.await
            .map_err(|_| KernelError::Route("switchboard dropped the dial".to_string()))?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RouterCommand::Shutdown);
    }
}

pub fn command_channel() -> (RouterHandle, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RouterHandle { tx }, rx)
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Kernel-served requests run off the switchboard task, at most this many
/// at once.
const API_WORKERS: usize = 8;

/// Runs the switchboard until a shutdown command arrives: accepts sockets,
/// owns every connection record, both directories and all pending tables,
/// and dispatches decoded frames by role.
pub async fn switchboard(
    our: NodeId,
    listener: TcpListener,
    registry_local: Registry,
    registry_global: Registry,
    services: Arc<ServiceManager>,
    env: HashMap<String, String>,
    handle: RouterHandle,
    mut rx: CommandReceiver,
) -> Result<()> {
    let api = Arc::new(ApiContext {
        our: our.clone(),
        env,
        registry_local: registry_local.clone().with_rpc(handle.caller()),
        registry_global: registry_global.clone().with_rpc(handle.caller()),
        services,
        router: handle.clone(),
    });
    let mut router = Router {
        our,
        conns: HashMap::new(),
        services: ServiceDirectory::default(),
        nodes: NodeDirectory::default(),
        waiters: HashMap::new(),
        next_conn: 1,
        tx: handle.tx.clone(),
        // the switchboard's own registry handles carry no rpc caller, so an
        // access handler can never call back into this task
        registry_local,
        registry_global,
        api,
        api_permits: Arc::new(tokio::sync::Semaphore::new(API_WORKERS)),
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn = router.install(stream, addr, Role::Reg);
                    debug!("accepted connection {conn} ({addr})");
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            cmd = rx.recv() => match cmd {
                None | Some(RouterCommand::Shutdown) => {
                    router.stop();
                    info!("switchboard stopped");
                    return Ok(());
                }
                Some(cmd) => router.handle(cmd).await,
            },
        }
    }
}

struct Router {
    our: NodeId,
    conns: HashMap<ConnId, Conn>,
    services: ServiceDirectory,
    nodes: NodeDirectory,
    /// Kernel-originated calls waiting for their correlated response.
    waiters: HashMap<String, CallResponder>,
    next_conn: ConnId,
    tx: CommandSender,
    registry_local: Registry,
    registry_global: Registry,
    api: Arc<ApiContext>,
    api_permits: Arc<tokio::sync::Semaphore>,
}

impl Router {
    fn install(&mut self, stream: TcpStream, addr: SocketAddr, role: Role) -> ConnId {
        let conn = self.next_conn;
        self.next_conn += 1;
        let (read_half, write_half) = stream.into_split();
        let (sender, frame_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(conn, read_half, self.tx.clone()));
        let writer = tokio::spawn(write_loop(conn, write_half, frame_rx, self.tx.clone()));
        self.conns.insert(
            conn,
            Conn {
                addr,
                role,
                sender,
                pending: HashMap::new(),
                reader,
                writer,
            },
        );
        conn
    }

    /// Drop a connection and everything it owns. Queued frames and pending
    /// entries die with it.
    fn close(&mut self, conn: ConnId) {
        let Some(record) = self.conns.remove(&conn) else {
            return;
        };
        record.reader.abort();
        record.writer.abort();
        match record.role {
            Role::Reg => info!("closed connection ({})", record.addr),
            Role::Service => {
                if let Some((service, instance)) = self.services.remove_conn(conn) {
                    info!("closed connection with service `{service}`[{instance}]");
                }
            }
            Role::Node => {
                if let Some(node) = self.nodes.remove_conn(conn) {
                    info!("closed connection with node `{node}`");
                }
            }
        }
        // remote requesters just never hear back; kernel-side callers are
        // told their responder went away
        for (rid, pending) in record.pending {
            if let ReplyRoute::Kernel = pending.reply_to {
                if let Some(waiter) = self.waiters.remove(&rid) {
                    let _ = waiter.send(Err(KernelError::Route(format!(
                        "responder of `{rid}` disconnected"
                    ))));
                }
            }
        }
    }

    fn stop(&mut self) {
        let open: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn in open {
            self.close(conn);
        }
    }

    fn enqueue(&mut self, conn: ConnId, frame: Vec<Value>) {
        if let Some(record) = self.conns.get(&conn) {
            if record.sender.send(frame).is_err() {
                debug!("send queue of connection {conn} is gone");
            }
        }
    }

    async fn handle(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::Frame { conn, frame } => self.handle_frame(conn, frame).await,
            RouterCommand::Closed { conn } => self.close(conn),
            RouterCommand::Call {
                target,
                method,
                args,
                kwargs,
                responder,
            } => self.handle_call(target, method, args, kwargs, responder),
            RouterCommand::ConnectPeer { node, responder } => self.spawn_dial(node, responder),
            RouterCommand::InstallPeer { node, stream } => {
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr"));
                let conn = self.install(stream, addr, Role::Node);
                if let Some(evicted) = self.nodes.insert(&node, conn) {
                    self.close(evicted);
                }
                info!("node peering established: `{node}`");
            }
            RouterCommand::ApiResult {
                reply,
                origin,
                rid,
                result,
            } => self.handle_api_result(reply, origin, rid, result),
            RouterCommand::Shutdown => unreachable!("handled by the event loop"),
        }
    }

    async fn handle_frame(&mut self, conn: ConnId, frame: Vec<Value>) {
        let Some(role) = self.conns.get(&conn).map(|c| c.role) else {
            return;
        };
        let parsed = match utils::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("connection {conn}: {e}");
                self.close(conn);
                return;
            }
        };
        match (role, parsed) {
            (
                Role::Reg,
                Frame::Connect {
                    service,
                    instance,
                    token,
                },
            ) => {
                if let Err(e) = self.auth_service(conn, &service, instance, &token).await {
                    info!("refused auth of `{service}`[{instance}]: {e}");
                    self.close(conn);
                }
            }
            (Role::Reg, Frame::ConnectNode { node, token }) => {
                if let Err(e) = self.auth_node(conn, &node, &token).await {
                    info!("refused auth of node `{node}`: {e}");
                    self.close(conn);
                }
            }
            (
                Role::Service,
                Frame::Request {
                    node,
                    service,
                    instance,
                    method,
                    args,
                    kwargs,
                    rid,
                },
            ) => {
                let Some((from_service, from_instance)) = self.services.identity(conn).cloned()
                else {
                    self.close(conn);
                    return;
                };
                let origin = ServiceAddr::new(&self.our, &from_service, from_instance);
                self.handle_request(
                    ReplyRoute::Conn(conn),
                    Some(conn),
                    origin,
                    node,
                    service,
                    instance,
                    method,
                    args,
                    kwargs,
                    rid,
                );
            }
            (Role::Service, Frame::Response { result, error, rid }) => {
                self.handle_response(conn, result, error, rid)
            }
            (
                Role::Node,
                Frame::Proxy {
                    node,
                    origin,
                    inner,
                    proxy_rid,
                },
            ) => self.handle_proxy(conn, node, origin, inner, proxy_rid),
            (Role::Node, Frame::ProxyStatus { error, proxy_rid }) => {
                // informational only; never correlates with a pending rid
                debug!("proxy status for {proxy_rid}: {error:?}");
            }
            (role, frame) => {
                warn!(
                    "connection {conn} ({role:?}) sent an opcode outside its state: {frame:?}"
                );
                self.close(conn);
            }
        }
    }

    /// Route one request, reporting failures per the rid contract: no rid
    /// means the source is closed, a rid means the error tuple travels back
    /// along the path the request came in on.
    #[allow(clippy::too_many_arguments)]
    fn handle_request(
        &mut self,
        reply: ReplyRoute,
        source: Option<ConnId>,
        origin: ServiceAddr,
        node: Option<NodeId>,
        service: String,
        instance: Option<InstanceId>,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        rid: Option<String>,
    ) {
        let Err(e) = self.dispatch_request(
            &reply, &origin, node, &service, instance, &method, &args, &kwargs, &rid,
        ) else {
            return;
        };
        debug!("request for `{service}` failed: {e}");
        match (&rid, &reply) {
            (None, ReplyRoute::Conn(_)) => {
                if let Some(source) = source {
                    self.close(source);
                }
            }
            (None, ReplyRoute::Kernel) => {}
            (Some(rid), ReplyRoute::Kernel) => {
                if let Some(waiter) = self.waiters.remove(rid) {
                    let _ = waiter.send(Err(e));
                }
            }
            (Some(rid), ReplyRoute::Conn(source)) => {
                let source = *source;
                self.reply_along(source, &origin, None, Value::Null, error_value(&e), rid);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_request(
        &mut self,
        reply: &ReplyRoute,
        origin: &ServiceAddr,
        node: Option<NodeId>,
        service: &str,
        instance: Option<InstanceId>,
        method: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
        rid: &Option<String>,
    ) -> Result<(), KernelError> {
        let instance = instance.unwrap_or(BALANCED_INSTANCE);
        let local = match node.as_deref() {
            None | Some(LOCAL_NODE) => true,
            Some(name) => name == self.our,
        };
        if !local {
            let node = node.expect("non-local target carries a node name");
            let hop = self.nodes.lookup(&node)?;
            if let Some(rid) = rid {
                self.conns
                    .get_mut(&hop)
                    .expect("hop just resolved")
                    .pending
                    .insert(
                        rid.clone(),
                        Pending {
                            reply_to: reply.clone(),
                            origin: origin.clone(),
                        },
                    );
            }
            let inner =
                forwarded_request_frame(&node, service, instance, method, args, kwargs, rid);
            let envelope = proxy_frame(&node, origin, inner, &generate_id());
            self.enqueue(hop, envelope);
            return Ok(());
        }
        if service == KERNEL_SERVICE {
            // kernel-served request: parse against the static dispatch
            // table now, execute off the switchboard task
            let op = api::ApiOp::parse(method, args, kwargs)?;
            let ctx = self.api.clone();
            let tx = self.tx.clone();
            let permits = self.api_permits.clone();
            let reply = reply.clone();
            let origin = origin.clone();
            let rid = rid.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let result = api::execute(&ctx, op).await;
                let _ = tx.send(RouterCommand::ApiResult {
                    reply,
                    origin,
                    rid,
                    result,
                });
            });
            return Ok(());
        }
        let target = self.services.lookup(service, instance)?;
        if let Some(rid) = rid {
            self.conns
                .get_mut(&target)
                .expect("target just resolved")
                .pending
                .insert(
                    rid.clone(),
                    Pending {
                        reply_to: reply.clone(),
                        origin: origin.clone(),
                    },
                );
        }
        self.enqueue(target, request_frame(origin, method, args, kwargs, rid));
        Ok(())
    }

    fn handle_response(&mut self, conn: ConnId, result: Value, error: Value, rid: Option<String>) {
        let Some(rid) = rid else {
            debug!("dropping response without a rid");
            return;
        };
        let Some(pending) = self
            .conns
            .get_mut(&conn)
            .and_then(|c| c.pending.remove(&rid))
        else {
            // out-of-date or double reply
            debug!("dropping response with unknown rid `{rid}`");
            return;
        };
        match pending.reply_to {
            ReplyRoute::Kernel => {
                if let Some(waiter) = self.waiters.remove(&rid) {
                    let outcome = if error.is_null() {
                        Ok(result)
                    } else {
                        Err(wire_error(&error))
                    };
                    let _ = waiter.send(outcome);
                }
            }
            ReplyRoute::Conn(origin_conn) => {
                let responder = self.conn_identity(conn);
                self.reply_along(origin_conn, &pending.origin, responder, result, error, &rid);
            }
        }
    }

    /// Deliver a response toward its requester: directly on a SERVICE
    /// socket, wrapped in a proxy envelope on a NODE socket.
    fn reply_along(
        &mut self,
        via: ConnId,
        origin: &ServiceAddr,
        responder: Option<ServiceAddr>,
        result: Value,
        error: Value,
        rid: &str,
    ) {
        let Some(role) = self.conns.get(&via).map(|c| c.role) else {
            debug!("requester of `{rid}` is gone");
            return;
        };
        match role {
            Role::Node => {
                let responder = responder.unwrap_or_else(|| ServiceAddr::kernel(&self.our));
                let inner = response_frame(result, error, rid);
                let envelope = proxy_frame(&origin.node, &responder, inner, &generate_id());
                self.enqueue(via, envelope);
            }
            _ => self.enqueue(via, response_frame(result, error, rid)),
        }
    }

    fn handle_proxy(
        &mut self,
        conn: ConnId,
        node: NodeId,
        origin: ServiceAddr,
        inner: Vec<Value>,
        proxy_rid: String,
    ) {
        if node == self.our {
            // terminal hop: unwrap and dispatch as if the origin were local
            let parsed = match utils::parse(inner) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("connection {conn}: bad proxied command: {e}");
                    self.close(conn);
                    return;
                }
            };
            match parsed {
                Frame::Request {
                    node,
                    service,
                    instance,
                    method,
                    args,
                    kwargs,
                    rid,
                } => self.handle_request(
                    ReplyRoute::Conn(conn),
                    Some(conn),
                    origin,
                    node,
                    service,
                    instance,
                    method,
                    args,
                    kwargs,
                    rid,
                ),
                Frame::Response { result, error, rid } => {
                    self.handle_response(conn, result, error, rid)
                }
                other => {
                    warn!("connection {conn}: proxied command is not routable: {other:?}");
                    self.close(conn);
                }
            }
        } else {
            match self.nodes.lookup(&node) {
                Ok(hop) => {
                    // intermediate hop: forward untouched
                    self.enqueue(hop, proxy_frame(&node, &origin, inner, &proxy_rid));
                }
                Err(e) => self.enqueue(conn, proxy_status_frame(&e, &proxy_rid)),
            }
        }
    }

    fn handle_call(
        &mut self,
        target: RpcTarget,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        responder: CallResponder,
    ) {
        let rid = generate_id();
        self.waiters.insert(rid.clone(), responder);
        let origin = ServiceAddr::kernel(&self.our);
        self.handle_request(
            ReplyRoute::Kernel,
            None,
            origin,
            target.node,
            target.service,
            target.instance,
            method,
            args,
            kwargs,
            Some(rid),
        );
    }

    fn handle_api_result(
        &mut self,
        reply: ReplyRoute,
        origin: ServiceAddr,
        rid: Option<String>,
        result: Result<Value, KernelError>,
    ) {
        match reply {
            ReplyRoute::Kernel => {
                if let Some(waiter) = rid.and_then(|rid| self.waiters.remove(&rid)) {
                    let _ = waiter.send(result);
                }
            }
            ReplyRoute::Conn(conn) => {
                let Some(rid) = rid else {
                    if let Err(e) = result {
                        warn!("fire-and-forget kernel call failed: {e}");
                    }
                    return;
                };
                let (value, error) = match result {
                    Ok(value) => (value, Value::Null),
                    Err(e) => (Value::Null, error_value(&e)),
                };
                self.reply_along(conn, &origin, None, value, error, &rid);
            }
        }
    }

    async fn auth_service(
        &mut self,
        conn: ConnId,
        service: &str,
        instance: InstanceId,
        token: &str,
    ) -> Result<(), KernelError> {
        let listed = self
            .registry_local
            .get("kernel/services", &Query::keys([service]))
            .await?;
        let descriptor = listed
            .get(service)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| KernelError::Route(format!("service `{service}` doesn't exist")))?;
        let descriptor: ServiceDescriptor = serde_json::from_value(descriptor)
            .map_err(|e| KernelError::Kv(format!("corrupt descriptor for `{service}`: {e}")))?;
        if token != descriptor.token {
            return Err(KernelError::Auth("invalid token".to_string()));
        }
        if instance < 1 || instance > descriptor.scale {
            return Err(KernelError::Auth(format!("unexpected instance {instance}")));
        }
        if let Some(evicted) = self.services.insert(service, instance, conn) {
            info!("evicting previous socket of `{service}`[{instance}]");
            self.close(evicted);
        }
        self.conns
            .get_mut(&conn)
            .expect("authing connection exists")
            .role = Role::Service;
        info!("service authed: `{service}`[{instance}]");
        Ok(())
    }

    async fn auth_node(&mut self, conn: ConnId, node: &str, token: &str) -> Result<(), KernelError> {
        let listed = self
            .registry_global
            .get("kernel/nodes", &Query::keys([node]))
            .await?;
        let descriptor = listed
            .get(node)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| KernelError::Route(format!("node `{node}` doesn't exist")))?;
        let descriptor: NodeDescriptor = serde_json::from_value(descriptor)
            .map_err(|e| KernelError::Kv(format!("corrupt descriptor for node `{node}`: {e}")))?;
        if token != descriptor.token {
            return Err(KernelError::Auth("invalid token".to_string()));
        }
        if let Some(evicted) = self.nodes.insert(node, conn) {
            self.close(evicted);
        }
        self.conns
            .get_mut(&conn)
            .expect("authing connection exists")
            .role = Role::Node;
        info!("node authed: `{node}`");
        Ok(())
    }

    fn conn_identity(&self, conn: ConnId) -> Option<ServiceAddr> {
        self.services
            .identity(conn)
            .map(|(service, instance)| ServiceAddr::new(&self.our, service, *instance))
    }

    fn spawn_dial(&mut self, node: NodeId, responder: oneshot::Sender<Result<(), KernelError>>) {
        let registry_global = self.registry_global.clone();
        let our = self.our.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let dialed = dial_peer(&our, &node, &registry_global).await;
            let outcome = match dialed {
                Ok(stream) => tx
                    .send(RouterCommand::InstallPeer { node, stream })
                    .map_err(|_| KernelError::Route("switchboard is not running".to_string())),
                Err(e) => Err(e),
            };
            let _ = responder.send(outcome);
        });
    }
}

/// The wire-side half of peering: resolve both endpoints in the global node
/// directory, connect, and authenticate with our own token. Auth success is
/// silent, so the socket is usable as soon as the frame is written.
async fn dial_peer(
    our: &str,
    node: &str,
    registry_global: &Registry,
) -> Result<TcpStream, KernelError> {
    let listed = registry_global
        .get("kernel/nodes", &Query::keys([node, our]))
        .await?;
    let peer: NodeDescriptor = descriptor_from(&listed, node)?;
    let ours: NodeDescriptor = descriptor_from(&listed, our)?;
    let mut stream = TcpStream::connect((peer.address.0.as_str(), peer.address.1))
        .await
        .map_err(|e| KernelError::Transport(format!("dial of `{node}` failed: {e}")))?;
    codec::write_frame(&mut stream, &connect_node_frame(our, &ours.token)).await?;
    Ok(stream)
}

fn descriptor_from<T: serde::de::DeserializeOwned>(
    listed: &serde_json::Value,
    name: &str,
) -> Result<T, KernelError> {
    let value = listed
        .get(name)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| KernelError::Route(format!("node `{name}` doesn't exist")))?;
    serde_json::from_value(value)
        .map_err(|e| KernelError::Kv(format!("corrupt descriptor for node `{name}`: {e}")))
}

/// Map a wire error tuple back into the taxonomy for a kernel-side caller.
/// Only the access kind matters structurally; everything else is opaque.
fn wire_error(error: &Value) -> KernelError {
    let slots = error.as_list().unwrap_or(&[]);
    let name = slots.first().and_then(Value::as_str).unwrap_or("unknown");
    let message = slots.get(1).and_then(Value::as_str).unwrap_or("");
    if name.ends_with("::Access") {
        KernelError::Access
    } else {
        KernelError::Route(format!("{name}: {message}"))
    }
}

async fn read_loop(conn: ConnId, mut stream: OwnedReadHalf, tx: CommandSender) {
    loop {
        match codec::read_frame(&mut stream).await {
            Ok(frame) => {
                if tx.send(RouterCommand::Frame { conn, frame }).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("connection {conn} read side done: {e}");
                let _ = tx.send(RouterCommand::Closed { conn });
                return;
            }
        }
    }
}

async fn write_loop(
    conn: ConnId,
    mut stream: OwnedWriteHalf,
    mut frames: FrameReceiver,
    tx: CommandSender,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = codec::write_frame(&mut stream, &frame).await {
            debug!("connection {conn} write side done: {e}");
            let _ = tx.send(RouterCommand::Closed { conn });
            return;
        }
    }
}
