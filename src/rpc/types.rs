use crate::codec::Value;
use crate::types::{
    InstanceId, KernelError, NodeId, ServiceAddr, BALANCED_INSTANCE,
};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Identifier of one tracked socket, the fd analog. Never reused within a
/// switchboard's lifetime.
pub type ConnId = u64;

pub type CommandSender = mpsc::UnboundedSender<RouterCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<RouterCommand>;

/// A connection's outbound queue: frames enqueued here are written to the
/// socket in FIFO order by its writer task.
pub type FrameSender = mpsc::UnboundedSender<Vec<Value>>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<Value>>;

pub type CallResponder = oneshot::Sender<Result<Value, KernelError>>;

/// Role of one socket. Assigned on successful authentication, terminal
/// until close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Reg,
    Service,
    Node,
}

/// Where a correlated response should be routed.
#[derive(Clone, Debug)]
pub enum ReplyRoute {
    Conn(ConnId),
    /// A call the kernel itself issued; resolves a waiting oneshot.
    Kernel,
}

/// One pending-response entry, stored on the connection expected to produce
/// the response.
#[derive(Clone, Debug)]
pub struct Pending {
    pub reply_to: ReplyRoute,
    pub origin: ServiceAddr,
}

/// Per-socket record owned by the router task.
pub struct Conn {
    pub addr: SocketAddr,
    pub role: Role,
    pub sender: FrameSender,
    pub pending: HashMap<String, Pending>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Target triple of an outgoing request. `node: None` and the
/// `"__local__"` sentinel both mean this node; `instance: None` means
/// balanced.
#[derive(Clone, Debug)]
pub struct RpcTarget {
    pub node: Option<NodeId>,
    pub service: String,
    pub instance: Option<InstanceId>,
}

impl RpcTarget {
    pub fn local(service: &str, instance: Option<InstanceId>) -> Self {
        RpcTarget {
            node: None,
            service: service.to_string(),
            instance,
        }
    }
}

/// Everything the router task reacts to besides accepted sockets.
pub enum RouterCommand {
    /// One decoded frame from a connection's reader task.
    Frame { conn: ConnId, frame: Vec<Value> },
    /// Hangup or transport failure observed by a reader/writer task.
    Closed { conn: ConnId },
    /// A call originated by the kernel itself (access handlers, admin
    /// internals). The responder resolves with the correlated response.
    Call {
        target: RpcTarget,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        responder: CallResponder,
    },
    /// Dial a peer kernel listed in the global node directory.
    ConnectPeer {
        node: NodeId,
        responder: oneshot::Sender<Result<(), KernelError>>,
    },
    /// A dialed peer socket, already authenticated on the wire, ready to be
    /// installed as NODE.
    InstallPeer {
        node: NodeId,
        stream: tokio::net::TcpStream,
    },
    /// Completion of a kernel-served request.
    ApiResult {
        reply: ReplyRoute,
        origin: ServiceAddr,
        rid: Option<String>,
        result: Result<Value, KernelError>,
    },
    Shutdown,
}

/// `name → {instance → conn}` plus the round-robin balancer state.
#[derive(Default)]
pub struct ServiceDirectory {
    services: HashMap<String, BTreeMap<InstanceId, ConnId>>,
    by_conn: HashMap<ConnId, (String, InstanceId)>,
    cursors: HashMap<String, i64>,
}

impl ServiceDirectory {
    /// Install an authenticated instance. Returns the connection it
    /// displaced, if the same `(service, instance)` was already held.
    pub fn insert(&mut self, service: &str, instance: InstanceId, conn: ConnId) -> Option<ConnId> {
        let slot = self
            .services
            .entry(service.to_string())
            .or_default()
            .insert(instance, conn);
        if let Some(old) = slot {
            self.by_conn.remove(&old);
        }
        self.by_conn
            .insert(conn, (service.to_string(), instance));
        slot
    }

    /// Resolve an instance, advancing the round-robin cursor when the
    /// balanced sentinel is asked for.
    pub fn lookup(&mut self, service: &str, instance: InstanceId) -> Result<ConnId, KernelError> {
        let instances = self
            .services
            .get(service)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| KernelError::Route(format!("service `{service}` doesn't exist")))?;
        if instance == BALANCED_INSTANCE {
            let len = instances.len() as i64;
            let mut cursor = self.cursors.get(service).copied().unwrap_or(-1) + 1;
            if cursor >= len {
                cursor %= len;
            }
            self.cursors.insert(service.to_string(), cursor);
            Ok(*instances
                .values()
                .nth(cursor as usize)
                .expect("balancer cursor in range"))
        } else {
            instances.get(&instance).copied().ok_or_else(|| {
                KernelError::Route(format!("unexpected instance {instance} of `{service}`"))
            })
        }
    }

    pub fn identity(&self, conn: ConnId) -> Option<&(String, InstanceId)> {
        self.by_conn.get(&conn)
    }

    /// Drop a closed connection. The cursor goes with the last instance of
    /// a service.
    pub fn remove_conn(&mut self, conn: ConnId) -> Option<(String, InstanceId)> {
        let (service, instance) = self.by_conn.remove(&conn)?;
        if let Some(instances) = self.services.get_mut(&service) {
            instances.remove(&instance);
            if instances.is_empty() {
                self.services.remove(&service);
                self.cursors.remove(&service);
            }
        }
        Some((service, instance))
    }
}

/// `node_name → conn` for peer kernels.
#[derive(Default)]
pub struct NodeDirectory {
    nodes: HashMap<NodeId, ConnId>,
    by_conn: HashMap<ConnId, NodeId>,
}

impl NodeDirectory {
    pub fn insert(&mut self, node: &str, conn: ConnId) -> Option<ConnId> {
        let old = self.nodes.insert(node.to_string(), conn);
        if let Some(old) = old {
            self.by_conn.remove(&old);
        }
        self.by_conn.insert(conn, node.to_string());
        old
    }

    pub fn lookup(&self, node: &str) -> Result<ConnId, KernelError> {
        self.nodes
            .get(node)
            .copied()
            .ok_or_else(|| KernelError::Route(format!("node `{node}` doesn't exist")))
    }

    pub fn name(&self, conn: ConnId) -> Option<&NodeId> {
        self.by_conn.get(&conn)
    }

    pub fn remove_conn(&mut self, conn: ConnId) -> Option<NodeId> {
        let node = self.by_conn.remove(&conn)?;
        self.nodes.remove(&node);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balancer_walks_instances_in_order() {
        let mut dir = ServiceDirectory::default();
        dir.insert("w", 1, 11);
        dir.insert("w", 2, 12);
        dir.insert("w", 3, 13);
        let picks: Vec<ConnId> = (0..4)
            .map(|_| dir.lookup("w", BALANCED_INSTANCE).unwrap())
            .collect();
        assert_eq!(picks, vec![11, 12, 13, 11]);
    }

    #[test]
    fn balancer_is_fair() {
        let mut dir = ServiceDirectory::default();
        for i in 1..=3 {
            dir.insert("w", i, 10 + i as ConnId);
        }
        let mut counts: HashMap<ConnId, usize> = HashMap::new();
        for _ in 0..10 {
            *counts
                .entry(dir.lookup("w", BALANCED_INSTANCE).unwrap())
                .or_default() += 1;
        }
        // 10 requests over 3 instances: each sees floor or ceil of 10/3
        for count in counts.values() {
            assert!(*count == 3 || *count == 4);
        }
        assert_eq!(counts.values().sum::<usize>(), 10);
    }

    #[test]
    fn balancer_survives_instance_churn() {
        let mut dir = ServiceDirectory::default();
        dir.insert("w", 1, 11);
        dir.insert("w", 2, 12);
        dir.insert("w", 3, 13);
        dir.lookup("w", BALANCED_INSTANCE).unwrap();
        dir.lookup("w", BALANCED_INSTANCE).unwrap();
        dir.remove_conn(13);
        // cursor folds back into the shrunken instance set
        let pick = dir.lookup("w", BALANCED_INSTANCE).unwrap();
        assert!(pick == 11 || pick == 12);
    }

    #[test]
    fn reauth_evicts_previous_holder() {
        let mut dir = ServiceDirectory::default();
        assert_eq!(dir.insert("a", 1, 7), None);
        assert_eq!(dir.insert("a", 1, 9), Some(7));
        assert_eq!(dir.identity(7), None);
        assert_eq!(dir.lookup("a", 1).unwrap(), 9);
    }

    #[test]
    fn removing_last_instance_removes_service() {
        let mut dir = ServiceDirectory::default();
        dir.insert("a", 1, 7);
        assert_eq!(dir.remove_conn(7), Some(("a".to_string(), 1)));
        assert!(dir.lookup("a", 1).is_err());
        assert!(dir.lookup("a", BALANCED_INSTANCE).is_err());
    }

    #[test]
    fn node_directory_replaces_and_removes() {
        let mut dir = NodeDirectory::default();
        assert_eq!(dir.insert("n2", 4), None);
        assert_eq!(dir.insert("n2", 5), Some(4));
        assert_eq!(dir.lookup("n2").unwrap(), 5);
        dir.remove_conn(5);
        assert!(dir.lookup("n2").is_err());
    }
}
