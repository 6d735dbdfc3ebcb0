pub mod events;
pub mod node;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use fleet_primitives::{
    Capabilities, Command, CommandType, HealthStatus, NodeSnapshot, NodeStatus, NodeType,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use events::{EventReceiver, EventSender, RegistryEvent};
pub use node::NodeHandle;

use crate::error::RegistryError;

/// Which ingress adapter produced a registration event. Used only for
/// logging and to preserve the "broker never sets `stream_active`" rule —
/// it has no bearing on the merged record's identity.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RegistrationSource {
    Rpc,
    Broker,
}

#[derive(Debug, Clone, Default)]
pub struct RegistrationInput {
    pub node_type: NodeType,
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub nebula_ip: Option<String>,
    pub region: Option<String>,
    pub availability_zone: Option<String>,
    pub labels: HashMap<String, String>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub node_type: Option<NodeType>,
    pub health: Option<HealthStatus>,
}

impl ListFilter {
    fn matches(&self, snapshot: &NodeSnapshot) -> bool {
        if let Some(nt) = self.node_type {
            if snapshot.node_type != nt {
                return false;
            }
        }
        if let Some(h) = self.health {
            if snapshot.health_status != h {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub stale: usize,
    pub dead: usize,
    pub total_gpu_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub nodes: Vec<NodeSnapshot>,
    pub summary: FleetSummary,
}

/// The authoritative in-memory node table. All operations are safe under
/// concurrent invocation; the map itself is guarded by a readers-writer
/// lock that is never held across I/O or callback dispatch (§5).
pub struct Registry {
    nodes: RwLock<HashMap<String, Arc<NodeHandle>>>,
    events: EventSender,
}

impl Registry {
    pub fn new() -> (Arc<Self>, EventReceiver) {
        let (tx, rx) = events::channel();
        (Arc::new(Self { nodes: RwLock::new(HashMap::new()), events: tx }), rx)
    }

    fn emit(&self, event: RegistryEvent) {
        // An unbounded send never blocks; a closed receiver (shutdown in
        // progress) is not an error worth surfacing here.
        let _ = self.events.send(event);
    }

    /// Idempotent upsert shared by both ingress adapters. Fields that can
    /// arrive from either source are last-writer-wins; `stream_active` is
    /// left untouched here regardless of `source` — only the RPC stream
    /// handler's `attach_stream`/`detach_stream` ever mutate it.
    pub fn register(&self, node_id: &str, input: RegistrationInput, source: RegistrationSource) -> NodeSnapshot {
        let now = Utc::now();
        let handle = self.get_or_create(node_id, now);

        let mut became_connected = false;
        handle.mutate(|fields| {
            fields.node_type = input.node_type;
            if input.instance_id.is_some() {
                fields.instance_id = input.instance_id;
            }
            fields.public_ip = input.public_ip;
            fields.nebula_ip = input.nebula_ip;
            fields.region = input.region;
            fields.availability_zone = input.availability_zone;
            fields.labels = input.labels;
            fields.capabilities = input.capabilities;
            if at_least(now, fields.last_seen) {
                fields.last_seen = now;
            }
            if !fields.connected {
                fields.connected = true;
                fields.connected_at = Some(now);
                became_connected = true;
            }
            if fields.health_status == HealthStatus::Dead || fields.health_status == HealthStatus::Stale {
                fields.health_status = HealthStatus::Healthy;
            }
        });

        info!(node_id, source = ?source, "node registered");
        let snapshot = handle.snapshot();
        if became_connected {
            self.emit(RegistryEvent::NodeConnected(snapshot.clone()));
        }
        snapshot
    }

    fn get_or_create(&self, node_id: &str, now: chrono::DateTime<Utc>) -> Arc<NodeHandle> {
        if let Some(existing) = self.nodes.read().expect("registry lock poisoned").get(node_id) {
            return existing.clone();
        }
        let mut guard = self.nodes.write().expect("registry lock poisoned");
        guard
            .entry(node_id.to_string())
            .or_insert_with(|| {
                let (handle, _rx) = NodeHandle::new(node_id.to_string(), now);
                handle
            })
            .clone()
    }

    pub fn deregister(&self, node_id: &str) {
        let removed = self.nodes.write().expect("registry lock poisoned").remove(node_id);
        if let Some(handle) = removed {
            info!(node_id, "node deregistered");
            self.emit(RegistryEvent::NodeDisconnected(handle.snapshot()));
        }
    }

    pub fn disconnect(&self, node_id: &str) -> bool {
        let handle = match self.nodes.read().expect("registry lock poisoned").get(node_id).cloned() {
            Some(h) => h,
            None => return false,
        };
        handle.mutate(|fields| {
            fields.connected = false;
            fields.stream_active = false;
        });
        self.emit(RegistryEvent::NodeDisconnected(handle.snapshot()));
        true
    }

    pub fn heartbeat(&self, node_id: &str) {
        match self.nodes.read().expect("registry lock poisoned").get(node_id).cloned() {
            Some(handle) => handle.observe_last_seen(Utc::now()),
            None => warn!(node_id, "heartbeat for unknown node, discarding"),
        }
    }

    pub fn update_status(&self, node_id: &str, status: NodeStatus) -> Result<(), RegistryError> {
        let handle = self
            .nodes
            .read()
            .expect("registry lock poisoned")
            .get(node_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        let now = Utc::now();
        handle.mutate(|fields| {
            fields.status = Some(status);
            if at_least(now, fields.last_seen) {
                fields.last_seen = now;
            }
        });
        self.emit(RegistryEvent::NodeStatusUpdated(handle.snapshot()));
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.nodes.read().expect("registry lock poisoned").get(node_id).map(|h| h.snapshot())
    }

    pub fn get_handle(&self, node_id: &str) -> Option<Arc<NodeHandle>> {
        self.nodes.read().expect("registry lock poisoned").get(node_id).cloned()
    }

    pub fn list_nodes(&self, filter: &ListFilter) -> Vec<NodeSnapshot> {
        self.nodes
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|h| h.snapshot())
            .filter(|s| filter.matches(s))
            .collect()
    }

    pub fn all_handles(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes.read().expect("registry lock poisoned").values().cloned().collect()
    }

    pub fn fleet_status(&self, filter: &ListFilter) -> FleetStatus {
        let nodes = self.list_nodes(filter);
        let mut summary = FleetSummary::default();
        for node in &nodes {
            summary.total += 1;
            summary.total_gpu_count += node.capabilities.gpu_count as u64;
            match node.health_status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Stale => summary.stale += 1,
                HealthStatus::Dead => summary.dead += 1,
            }
        }
        FleetStatus { nodes, summary }
    }

    pub fn connected_count(&self) -> usize {
        self.nodes
            .read()
            .expect("registry lock poisoned")
            .values()
            .filter(|h| h.with_fields(|f| f.connected))
            .count()
    }

    pub fn send_command(&self, node_id: &str, command: Command) -> bool {
        match self.get_handle(node_id) {
            Some(handle) => handle.try_send_command(command),
            None => {
                warn!(node_id, "send_command for unknown node");
                false
            }
        }
    }

    pub fn send_shutdown_command(&self, node_id: &str, reason: &str) -> bool {
        let mut args = HashMap::new();
        args.insert("reason".to_string(), reason.to_string());
        self.send_command(node_id, Command::new(CommandType::Shutdown, args, 60))
    }

    pub fn broadcast_command(&self, command_factory: impl Fn() -> Command, type_filter: Option<NodeType>) -> usize {
        let mut sent = 0;
        for handle in self.all_handles() {
            if let Some(nt) = type_filter {
                if handle.with_fields(|f| f.node_type) != nt {
                    continue;
                }
            }
            if handle.try_send_command(command_factory()) {
                sent += 1;
            }
        }
        sent
    }

    /// Attaches a freshly-opened RPC stream: marks the node connected and
    /// `stream_active`, and returns a fresh outbox receiver for the stream
    /// writer task to drain. Creates the node record if this is its first
    /// contact via either ingress path.
    pub fn attach_stream(&self, node_id: &str) -> (NodeSnapshot, mpsc::Receiver<Command>) {
        let now = Utc::now();
        let handle = self.get_or_create(node_id, now);
        let mut became_connected = false;
        handle.mutate(|fields| {
            if !fields.connected {
                fields.connected = true;
                fields.connected_at = Some(now);
                became_connected = true;
            }
            fields.stream_active = true;
        });
        let rx = handle.replace_outbox();
        let snapshot = handle.snapshot();
        if became_connected {
            self.emit(RegistryEvent::NodeConnected(snapshot.clone()));
        }
        (snapshot, rx)
    }

    /// Detaches the RPC stream. Does not by itself mark the node
    /// disconnected — a node may remain broker-registered as connected
    /// after its stream drops (§4.4: "Disconnect path conditional").
    pub fn detach_stream(&self, node_id: &str) {
        if let Some(handle) = self.get_handle(node_id) {
            handle.mutate(|fields| fields.stream_active = false);
        }
    }

    /// TTL reconciler entry point: classify every node's liveness against
    /// `stale_threshold`/`dead_threshold` and return the ids that just
    /// crossed into `dead` this tick (so the caller can decide on
    /// auto-terminate). Strictly-greater-than semantics at the boundary
    /// (§8: "at exactly `stale_threshold`, state remains `healthy`").
    pub fn reconcile_ttl(&self, stale_threshold: chrono::Duration, dead_threshold: chrono::Duration) -> Vec<String> {
        let now = Utc::now();
        let mut newly_dead = Vec::new();
        for handle in self.all_handles() {
            let (last_seen, current) = handle.with_fields(|f| (f.last_seen, f.health_status));
            if current == HealthStatus::Dead {
                continue;
            }
            let elapsed = now - last_seen;
            if elapsed > dead_threshold {
                handle.mutate(|f| f.health_status = HealthStatus::Dead);
                newly_dead.push(handle.node_id.clone());
                self.disconnect(&handle.node_id);
            } else if elapsed > stale_threshold {
                if current != HealthStatus::Stale {
                    handle.mutate(|f| f.health_status = HealthStatus::Stale);
                }
            } else if current == HealthStatus::Stale {
                handle.mutate(|f| f.health_status = HealthStatus::Healthy);
            }
        }
        newly_dead
    }
}

fn at_least(candidate: chrono::DateTime<Utc>, current: chrono::DateTime<Utc>) -> bool {
    candidate > current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn register_twice_is_idempotent() {
        let (registry, _rx) = Registry::new();
        let input = RegistrationInput { node_type: NodeType::GpuWorker, ..Default::default() };
        registry.register("n1", input.clone(), RegistrationSource::Broker);
        let snap = registry.register("n1", input, RegistrationSource::Broker);
        assert_eq!(registry.list_nodes(&ListFilter::default()).len(), 1);
        assert!(snap.connected);
    }

    #[test]
    fn broker_registration_never_sets_stream_active() {
        let (registry, _rx) = Registry::new();
        registry.register("n1", RegistrationInput::default(), RegistrationSource::Broker);
        let snap = registry.get_node("n1").unwrap();
        assert!(!snap.stream_active);
    }

    #[test]
    fn deregister_then_register_gets_fresh_connected_at() {
        let (registry, _rx) = Registry::new();
        registry.register("n1", RegistrationInput::default(), RegistrationSource::Broker);
        let first = registry.get_node("n1").unwrap().connected_at;
        registry.deregister("n1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.register("n1", RegistrationInput::default(), RegistrationSource::Broker);
        let second = registry.get_node("n1").unwrap().connected_at;
        assert!(second > first);
    }

    #[test]
    fn disconnect_implies_stream_inactive() {
        let (registry, _rx) = Registry::new();
        let (_, _rx2) = registry.attach_stream("n1");
        registry.disconnect("n1");
        let snap = registry.get_node("n1").unwrap();
        assert!(!snap.connected);
        assert!(!snap.stream_active);
    }

    #[test]
    fn heartbeat_on_unknown_node_is_a_noop() {
        let (registry, _rx) = Registry::new();
        registry.heartbeat("ghost");
        assert!(registry.get_node("ghost").is_none());
    }

    #[test]
    fn send_command_requires_stream_active() {
        let (registry, _rx) = Registry::new();
        registry.register("n1", RegistrationInput::default(), RegistrationSource::Broker);
        let sent = registry.send_command("n1", Command::new(CommandType::Status, Map::new(), 5));
        assert!(!sent);
    }

    #[test]
    fn send_command_succeeds_once_stream_attached() {
        let (registry, _rx) = Registry::new();
        let (_, _outbox_rx) = registry.attach_stream("n1");
        let sent = registry.send_command("n1", Command::new(CommandType::Status, Map::new(), 5));
        assert!(sent);
    }

    #[test]
    fn outbox_full_drops_and_returns_false() {
        let (registry, _rx) = Registry::new();
        let (_, _outbox_rx) = registry.attach_stream("n1");
        // Nothing drains the outbox in this test, so the 11th enqueue must fail.
        for _ in 0..10 {
            assert!(registry.send_command("n1", Command::new(CommandType::Status, Map::new(), 5)));
        }
        assert!(!registry.send_command("n1", Command::new(CommandType::Status, Map::new(), 5)));
    }

    #[test]
    fn reattaching_stream_drops_prior_outbox_contents() {
        let (registry, _rx) = Registry::new();
        let (_, mut rx1) = registry.attach_stream("n1");
        registry.send_command("n1", Command::new(CommandType::Status, Map::new(), 5));
        let (_, mut rx2) = registry.attach_stream("n1");
        // The old sender was dropped by `replace_outbox`, but a buffered
        // message on a closed mpsc channel is still drained before the
        // receiver reports closed — so the prior command is retrievable
        // exactly once, then the channel is empty and closed for good.
        let buffered = rx1.try_recv().unwrap();
        assert_eq!(buffered.kind, CommandType::Status);
        assert!(rx1.try_recv().is_err());
        registry.send_command("n1", Command::new(CommandType::Reboot, Map::new(), 5));
        let received = rx2.try_recv().unwrap();
        assert_eq!(received.kind, CommandType::Reboot);
    }

    #[test]
    fn connected_count_matches_connected_nodes() {
        let (registry, _rx) = Registry::new();
        registry.register("n1", RegistrationInput::default(), RegistrationSource::Broker);
        registry.register("n2", RegistrationInput::default(), RegistrationSource::Broker);
        registry.disconnect("n2");
        assert_eq!(registry.connected_count(), 1);
    }
}
