use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A kernel's identity in the node directory.
pub type NodeId = String;

/// Instance number of a worker within a service. Instances are numbered
/// `1..=scale`; `0` is the wire sentinel for "pick a balanced instance".
pub type InstanceId = i64;

pub const BALANCED_INSTANCE: InstanceId = 0;

/// Wire sentinel for "this node" in a request's target triple.
pub const LOCAL_NODE: &str = "__local__";

/// The service name under which the kernel answers requests itself.
pub const KERNEL_SERVICE: &str = "kernel";

/// The `(node, service, instance)` triple carried on the wire to identify
/// one worker. Used both as the origin of a delivered request and as the
/// target of a proxy envelope.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ServiceAddr {
    pub node: NodeId,
    pub service: String,
    pub instance: InstanceId,
}

impl ServiceAddr {
    pub fn new(node: &str, service: &str, instance: InstanceId) -> Self {
        ServiceAddr {
            node: node.to_string(),
            service: service.to_string(),
            instance,
        }
    }

    /// Identity the kernel presents when it originates a call itself.
    pub fn kernel(node: &str) -> Self {
        ServiceAddr::new(node, KERNEL_SERVICE, 0)
    }
}

impl std::fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.service, self.instance, self.node)
    }
}

/// One entry of the `kernel/services` hash: everything the switchboard and
/// the service manager know about a declared service. Mutated only through
/// administrative calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub image: String,
    pub token: String,
    #[serde(default = "default_scale")]
    pub scale: i64,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Per-method permission requirements, keyed by method name.
    #[serde(default)]
    pub methods: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub command: Option<String>,
}

/// One entry of the global `kernel/nodes` hash, used to authorize
/// peer-kernel connections and to dial peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub token: String,
    /// Listen endpoint of the peer's switchboard.
    pub address: (String, u16),
    #[serde(default = "default_scale")]
    pub scale: i64,
}

fn default_scale() -> i64 {
    1
}

/// Error taxonomy of the kernel. Everything recoverable is surfaced as one
/// of these kinds; closing a connection on a transport failure is a control
/// path, not a panic.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Unknown service/node/instance, unknown opcode in a state, or a
    /// malformed operation that can be reported to the caller.
    #[error("{0}")]
    Route(String),
    /// Token mismatch or scale violation during authentication.
    #[error("{0}")]
    Auth(String),
    /// Registry entry was not in `rw` when an operation began.
    #[error("registry entry is locked")]
    Lock,
    /// `meta.id` CAS mismatch or `create` on an existing key.
    #[error("{0}")]
    Consistency(String),
    /// An access handler denied the operation.
    #[error("access denied")]
    Access,
    /// Short read/write or an undecodable frame. Connection-fatal.
    #[error("{0}")]
    Transport(String),
    /// The backing store refused after the one reconnect attempt.
    #[error("{0}")]
    Kv(String),
}

impl KernelError {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Route(_) => "Route",
            KernelError::Auth(_) => "Auth",
            KernelError::Lock => "Lock",
            KernelError::Consistency(_) => "Consistency",
            KernelError::Access => "Access",
            KernelError::Transport(_) => "Transport",
            KernelError::Kv(_) => "Kv",
        }
    }

    /// Module-qualified name carried in the first slot of a wire error
    /// tuple.
    pub fn wire_name(&self) -> &'static str {
        match self {
            KernelError::Route(_) => "ce_kernel::rpc::Route",
            KernelError::Auth(_) => "ce_kernel::rpc::Auth",
            KernelError::Lock => "ce_kernel::registry::Lock",
            KernelError::Consistency(_) => "ce_kernel::registry::Consistency",
            KernelError::Access => "ce_kernel::registry::Access",
            KernelError::Transport(_) => "ce_kernel::rpc::Transport",
            KernelError::Kv(_) => "ce_kernel::kv::Kv",
        }
    }
}
