use std::sync::Arc;

use fleet_broker::topology::{
    EXCHANGE_HEARTBEAT, EXCHANGE_REGISTRATION, QUEUE_HEARTBEAT_CONTROL_PLANE,
    QUEUE_REGISTRATION_CONTROL_PLANE, ROUTING_KEY_REGISTRATION,
};
use fleet_broker::{BrokerConnection, HeartbeatMessage, RegistrationMessage};
use fleet_primitives::{Capabilities, HealthStatus, NodeType};
use lapin::ExchangeKind;
use tracing::{error, info, instrument, warn};

use crate::registry::{Registry, RegistrationInput, RegistrationSource};

/// Consumes `agents.registration` (direct exchange, exact routing key
/// `ROUTING_KEY_REGISTRATION`) and `agents.heartbeat` (fanout) into the
/// registry. Each consumer owns a dedicated channel, per §4.2's connection
/// policy.
#[instrument(skip_all)]
pub async fn run_registration_consumer(conn: Arc<BrokerConnection>, registry: Arc<Registry>) {
    loop {
        match registration_loop(&conn, &registry).await {
            Ok(()) => {}
            Err(err) => error!(error = %err, "registration consumer loop ended, reconnecting"),
        }
    }
}

async fn registration_loop(conn: &BrokerConnection, registry: &Registry) -> Result<(), fleet_broker::BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            EXCHANGE_REGISTRATION,
            ExchangeKind::Direct,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            lapin::types::FieldTable::default(),
        )
        .await?;
    let mut consumer = fleet_broker::consumer::QueueConsumer::bind(
        channel,
        QUEUE_REGISTRATION_CONTROL_PLANE,
        EXCHANGE_REGISTRATION,
        ROUTING_KEY_REGISTRATION,
        1,
        "fleet-manager.registration",
    )
    .await?;

    while let Some(result) = consumer.next::<RegistrationMessage>().await {
        match result {
            Ok(msg) => apply_registration(registry, msg),
            Err(err) => warn!(error = %err, "malformed registration message, discarded"),
        }
    }
    Ok(())
}

fn apply_registration(registry: &Registry, msg: RegistrationMessage) {
    use fleet_broker::messages::RegistrationAction;
    match msg.action {
        RegistrationAction::Register => {
            let input = RegistrationInput {
                node_type: msg.node_type.parse::<NodeType>().unwrap_or_default(),
                instance_id: None,
                public_ip: msg.public_ip,
                nebula_ip: msg.nebula_ip,
                region: msg.region,
                availability_zone: msg.az,
                labels: Default::default(),
                capabilities: capabilities_from_json(&msg.capabilities),
            };
            registry.register(&msg.node_id, input, RegistrationSource::Broker);
        }
        RegistrationAction::Deregister => {
            registry.deregister(&msg.node_id);
        }
    }
}

fn capabilities_from_json(raw: &std::collections::HashMap<String, serde_json::Value>) -> Capabilities {
    Capabilities {
        gpu_count: raw.get("gpu_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        gpu_memory_bytes: raw.get("gpu_memory_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
        total_memory_bytes: raw.get("total_memory_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
    }
}

#[instrument(skip_all)]
pub async fn run_heartbeat_consumer(conn: Arc<BrokerConnection>, registry: Arc<Registry>) {
    loop {
        match heartbeat_loop(&conn, &registry).await {
            Ok(()) => {}
            Err(err) => error!(error = %err, "heartbeat consumer loop ended, reconnecting"),
        }
    }
}

async fn heartbeat_loop(conn: &BrokerConnection, registry: &Registry) -> Result<(), fleet_broker::BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            EXCHANGE_HEARTBEAT,
            ExchangeKind::Fanout,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            lapin::types::FieldTable::default(),
        )
        .await?;
    let mut consumer = fleet_broker::consumer::QueueConsumer::bind(
        channel,
        QUEUE_HEARTBEAT_CONTROL_PLANE,
        EXCHANGE_HEARTBEAT,
        "",
        1,
        "fleet-manager.heartbeat",
    )
    .await?;

    while let Some(result) = consumer.next::<HeartbeatMessage>().await {
        match result {
            Ok(msg) => apply_heartbeat(registry, msg),
            Err(err) => warn!(error = %err, "malformed heartbeat message, discarded"),
        }
    }
    Ok(())
}

fn apply_heartbeat(registry: &Registry, msg: HeartbeatMessage) {
    use fleet_broker::messages::HeartbeatHealth;
    registry.heartbeat(&msg.node_id);
    if let Some(handle) = registry.get_handle(&msg.node_id) {
        let health = match msg.status {
            HeartbeatHealth::Healthy => HealthStatus::Healthy,
            HeartbeatHealth::Degraded => HealthStatus::Degraded,
            HeartbeatHealth::Unhealthy => HealthStatus::Unhealthy,
        };
        handle.mutate(|f| {
            // Heartbeat self-report only refines a still-live classification;
            // it never resurrects a node the TTL reconciler has already
            // classified as stale/dead (that is re-established by a fresh
            // Register, not a heartbeat).
            if !matches!(f.health_status, HealthStatus::Stale | HealthStatus::Dead) {
                f.health_status = health;
            }
        });
    } else {
        info!(node_id = %msg.node_id, "heartbeat for unknown node");
    }
}
