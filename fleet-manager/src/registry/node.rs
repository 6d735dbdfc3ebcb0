use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fleet_primitives::{Capabilities, Command, HealthStatus, NodeSnapshot, NodeStatus, NodeType};
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of a node's command outbox, per spec §3.
const OUTBOX_CAPACITY: usize = 10;

/// The mutable fields of a `Node` record, guarded by the node's own lock
/// (§5: "each `Node` has its own lock for mutating its own mutable
/// fields"). Never held across I/O.
#[derive(Debug, Clone)]
pub struct NodeFields {
    pub node_type: NodeType,
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub nebula_ip: Option<String>,
    pub region: Option<String>,
    pub availability_zone: Option<String>,
    pub labels: HashMap<String, String>,
    pub capabilities: Capabilities,
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    pub stream_active: bool,
    pub health_status: HealthStatus,
    pub status: Option<NodeStatus>,
}

impl NodeFields {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            node_type: NodeType::Unspecified,
            instance_id: None,
            public_ip: None,
            nebula_ip: None,
            region: None,
            availability_zone: None,
            labels: HashMap::new(),
            capabilities: Capabilities::default(),
            connected: false,
            connected_at: None,
            last_seen: now,
            stream_active: false,
            health_status: HealthStatus::Healthy,
            status: None,
        }
    }
}

/// A live node record. Identity (`node_id`) is immutable; everything else
/// lives behind `fields`. The command outbox is a bounded, single-consumer
/// FIFO (capacity 10) that the currently-attached RPC stream drains; when a
/// stream detaches, `replace_outbox` swaps in a fresh channel and the old
/// one (and anything still queued in it) is dropped.
pub struct NodeHandle {
    pub node_id: String,
    fields: Mutex<NodeFields>,
    outbox_tx: Mutex<mpsc::Sender<Command>>,
}

impl NodeHandle {
    pub fn new(node_id: String, now: DateTime<Utc>) -> (std::sync::Arc<Self>, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let handle = std::sync::Arc::new(Self {
            node_id,
            fields: Mutex::new(NodeFields::new(now)),
            outbox_tx: Mutex::new(tx),
        });
        (handle, rx)
    }

    pub fn with_fields<R>(&self, f: impl FnOnce(&NodeFields) -> R) -> R {
        let guard = self.fields.lock().expect("node lock poisoned");
        f(&guard)
    }

    pub fn mutate<R>(&self, f: impl FnOnce(&mut NodeFields) -> R) -> R {
        let mut guard = self.fields.lock().expect("node lock poisoned");
        f(&mut guard)
    }

    /// Monotonic `last_seen` bump: only a strictly-greater timestamp wins
    /// (§5's ordering guarantee).
    pub fn observe_last_seen(&self, at: DateTime<Utc>) {
        let mut guard = self.fields.lock().expect("node lock poisoned");
        if at > guard.last_seen {
            guard.last_seen = at;
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let guard = self.fields.lock().expect("node lock poisoned");
        NodeSnapshot {
            node_id: self.node_id.clone(),
            node_type: guard.node_type,
            instance_id: guard.instance_id.clone(),
            public_ip: guard.public_ip.clone(),
            nebula_ip: guard.nebula_ip.clone(),
            region: guard.region.clone(),
            availability_zone: guard.availability_zone.clone(),
            labels: guard.labels.clone(),
            capabilities: guard.capabilities,
            connected: guard.connected,
            connected_at: guard.connected_at,
            last_seen: guard.last_seen,
            stream_active: guard.stream_active,
            health_status: guard.health_status,
            status: guard.status.clone(),
        }
    }

    /// Replaces the outbox with a fresh, empty channel, returning the new
    /// receiver for the newly-attached stream to drain. Any commands still
    /// queued in the previous channel are dropped when its sender side is
    /// swapped out and its receiver is (by the caller) no longer polled.
    pub fn replace_outbox(&self) -> mpsc::Receiver<Command> {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        *self.outbox_tx.lock().expect("outbox lock poisoned") = tx;
        rx
    }

    /// Enqueues a command iff a stream is attached and the outbox has
    /// capacity. Non-blocking; logs and returns `false` on a full outbox.
    pub fn try_send_command(&self, command: Command) -> bool {
        let stream_active = self.with_fields(|f| f.stream_active);
        if !stream_active {
            return false;
        }
        let tx = self.outbox_tx.lock().expect("outbox lock poisoned").clone();
        match tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(node_id = %self.node_id, "command outbox full, dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(node_id = %self.node_id, "command outbox closed, dropping command");
                false
            }
        }
    }
}
