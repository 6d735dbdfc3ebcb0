use lazy_static::lazy_static;
use prometheus::{GaugeVec, IntCounterVec, Opts, Registry as PromRegistry, TextEncoder};

use crate::registry::{ListFilter, Registry};

lazy_static! {
    pub static ref REGISTRY: PromRegistry = PromRegistry::new();
    pub static ref FLEET_NODES: GaugeVec = GaugeVec::new(
        Opts::new("fleet_nodes_total", "Current node count by health and type"),
        &["health", "type"]
    )
    .unwrap();
    pub static ref COMMANDS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_commands_sent_total", "Commands enqueued to node outboxes"),
        &["type", "result"]
    )
    .unwrap();
    pub static ref BROKER_RECONNECTS: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_broker_reconnects_total", "Broker connection reconnect attempts"),
        &["consumer"]
    )
    .unwrap();
}

pub fn init() {
    REGISTRY.register(Box::new(FLEET_NODES.clone())).ok();
    REGISTRY.register(Box::new(COMMANDS_SENT.clone())).ok();
    REGISTRY.register(Box::new(BROKER_RECONNECTS.clone())).ok();
}

/// Recomputes the `fleet_nodes_total` gauge from scratch against the
/// registry's current snapshot. Cheap enough to run on every reconcile
/// tick and every admin-HTTP scrape.
pub fn observe_fleet(registry: &Registry) {
    FLEET_NODES.reset();
    let nodes = registry.list_nodes(&ListFilter::default());
    let mut counts: std::collections::HashMap<(String, String), i64> = std::collections::HashMap::new();
    for node in &nodes {
        let key = (node.health_status.to_string(), node.node_type.to_string());
        *counts.entry(key).or_insert(0) += 1;
    }
    for ((health, node_type), count) in counts {
        FLEET_NODES.with_label_values(&[&health, &node_type]).set(count as f64);
    }
}

pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}
