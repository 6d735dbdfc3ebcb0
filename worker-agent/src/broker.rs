//! Broker-side transport: registration/deregistration, heartbeats, and the
//! model-sharded inference queues this node serves (§4.2, §4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fleet_broker::messages::{
    HeartbeatGpu, HeartbeatHealth, HeartbeatMessage, HeartbeatResources, HeartbeatServices,
    RegistrationAction, RegistrationMessage,
};
use fleet_broker::topology::{
    command_routing_key, inference_queue_name, priority_queue_name, EXCHANGE_COMMANDS, EXCHANGE_HEARTBEAT,
    EXCHANGE_INFERENCE, EXCHANGE_PRIORITY, EXCHANGE_REGISTRATION, INFERENCE_DEFAULT_QUEUE,
    ROUTING_KEY_REGISTRATION,
};
use fleet_broker::{BrokerConnection, BrokerError};
use fleet_primitives::{Command, InferenceRequest, InferenceResponse, NodeStatus, ServiceName, ServiceState};
use lapin::ExchangeKind;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::state::AgentState;

fn service_flag(status: &NodeStatus, name: ServiceName) -> bool {
    status.service(name).map(|r| r.state == ServiceState::Running).unwrap_or(false)
}

fn heartbeat_health(status: &NodeStatus) -> HeartbeatHealth {
    use fleet_primitives::HealthStatus;
    match status.health {
        HealthStatus::Healthy => HeartbeatHealth::Healthy,
        HealthStatus::Degraded => HeartbeatHealth::Degraded,
        _ => HeartbeatHealth::Unhealthy,
    }
}

fn heartbeat_message(node_id: &str, status: &NodeStatus) -> HeartbeatMessage {
    HeartbeatMessage {
        node_id: node_id.to_string(),
        status: heartbeat_health(status),
        services: HeartbeatServices {
            nebula: service_flag(status, ServiceName::Nebula),
            k3s: service_flag(status, ServiceName::K3s),
            ollama: service_flag(status, ServiceName::Ollama),
            liqo: service_flag(status, ServiceName::Liqo),
        },
        resources: HeartbeatResources {
            memory_total_mb: status.resources.memory_total_mb,
            memory_used_mb: status.resources.memory_used_mb,
            cpu_percent: status.resources.cpu_percent,
            gpus: status
                .gpus
                .iter()
                .map(|g| HeartbeatGpu {
                    index: g.index,
                    name: g.name.clone(),
                    memory_used: g.memory_used_mb,
                    memory_total: g.memory_total_mb,
                    utilization: g.utilization,
                    temperature: g.temperature_c,
                })
                .collect(),
            models_loaded: status.models.iter().filter(|m| m.currently_loaded).map(|m| m.name.clone()).collect(),
        },
        timestamp: Utc::now(),
    }
}

async fn publish_registration(
    conn: &BrokerConnection,
    config: &WorkerConfig,
    action: RegistrationAction,
) -> Result<(), BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            EXCHANGE_REGISTRATION,
            ExchangeKind::Direct,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            lapin::types::FieldTable::default(),
        )
        .await?;
    let msg = RegistrationMessage {
        action,
        node_id: config.node_id.clone(),
        node_type: config.node_type.to_string(),
        nebula_ip: config.nebula_ip.clone(),
        public_ip: config.public_ip.clone(),
        region: config.region.clone(),
        az: config.availability_zone.clone(),
        capabilities: Default::default(),
        timestamp: Utc::now(),
    };
    let publisher = fleet_broker::publisher::Publisher::new(channel);
    publisher.publish_json(EXCHANGE_REGISTRATION, ROUTING_KEY_REGISTRATION, &msg, None, None, None).await
}

/// Published once at startup.
pub async fn register(conn: &BrokerConnection, config: &WorkerConfig) -> Result<(), BrokerError> {
    publish_registration(conn, config, RegistrationAction::Register).await
}

/// Published once on graceful shutdown.
pub async fn deregister(conn: &BrokerConnection, config: &WorkerConfig) -> Result<(), BrokerError> {
    publish_registration(conn, config, RegistrationAction::Deregister).await
}

/// Pushes a heartbeat every `config.heartbeat_interval` until the process
/// exits. Each tick takes a fresh status snapshot so the heartbeat always
/// reflects the latest health classification.
pub async fn run_heartbeat_publisher(conn: Arc<BrokerConnection>, config: WorkerConfig, state: Arc<AgentState>) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    loop {
        ticker.tick().await;
        let status = state.snapshot().await;
        let msg = heartbeat_message(&config.node_id, &status);
        if let Err(err) = publish_heartbeat(&conn, &msg).await {
            warn!(error = %err, "heartbeat publish failed");
        }
    }
}

async fn publish_heartbeat(conn: &BrokerConnection, msg: &HeartbeatMessage) -> Result<(), BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            EXCHANGE_HEARTBEAT,
            ExchangeKind::Fanout,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            lapin::types::FieldTable::default(),
        )
        .await?;
    let publisher = fleet_broker::publisher::Publisher::new(channel);
    publisher.publish_json(EXCHANGE_HEARTBEAT, "", msg, None, None, None).await
}

/// Model families this node advertises, derived from `worker_models`
/// (§4.2 rule 1's prefix families, falling back to the default queue).
fn queue_bindings(config: &WorkerConfig) -> Vec<(String, &'static str, String)> {
    const FAMILIES: &[&str] = &["llama3", "mistral", "qwen", "dolphin"];
    let mut families: Vec<&'static str> =
        FAMILIES.iter().copied().filter(|family| config.worker_models.iter().any(|m| m.starts_with(family))).collect();
    if families.is_empty() {
        families.push("default");
    }

    let mut bindings: Vec<(String, &'static str, String)> = families
        .into_iter()
        .map(|family| {
            let queue = if family == "default" { INFERENCE_DEFAULT_QUEUE.to_string() } else { inference_queue_name(family) };
            (queue, EXCHANGE_INFERENCE, family.to_string())
        })
        .collect();
    bindings.push((priority_queue_name("high"), EXCHANGE_PRIORITY, "high".to_string()));
    bindings.push((priority_queue_name("low"), EXCHANGE_PRIORITY, "low".to_string()));
    bindings
}

/// Runs one consumer per bound queue, each forwarding requests to the local
/// inference engine and replying to the request's own reply queue.
pub async fn run_inference_consumers(conn: Arc<BrokerConnection>, config: WorkerConfig, state: Arc<AgentState>) {
    let bindings = queue_bindings(&config);
    let mut handles = Vec::new();
    for (queue, exchange, routing_key) in bindings {
        let conn = conn.clone();
        let config = config.clone();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if let Err(err) = inference_consume_loop(&conn, &queue, exchange, &routing_key, &config, &state).await {
                    error!(error = %err, queue, "inference consumer loop ended, reconnecting");
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn inference_consume_loop(
    conn: &BrokerConnection,
    queue: &str,
    exchange: &str,
    routing_key: &str,
    config: &WorkerConfig,
    state: &AgentState,
) -> Result<(), BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            lapin::types::FieldTable::default(),
        )
        .await?;
    let mut consumer = fleet_broker::consumer::QueueConsumer::bind(
        channel,
        queue,
        exchange,
        routing_key,
        config.worker_concurrency.min(u16::MAX as u32) as u16,
        &format!("worker-agent.{}.{}", config.node_id, routing_key),
    )
    .await?;

    info!(queue, "inference consumer attached");
    while let Some(result) = consumer.next::<InferenceRequest>().await {
        match result {
            Ok(request) => serve_and_reply(conn, config, state, request).await,
            Err(err) => warn!(error = %err, "malformed inference request, discarded"),
        }
    }
    Ok(())
}

/// Best-effort alternative to the RPC command path (§9's Open Question):
/// binds this node's dedicated `agents.commands` queue and runs whatever
/// arrives through the same executor the RPC stream uses. Results aren't
/// reported anywhere on this transport — there is no broker-side result
/// sink defined for it, unlike the RPC stream's `CommandResult` envelope.
pub async fn run_command_consumer(
    conn: Arc<BrokerConnection>,
    config: WorkerConfig,
    state: Arc<AgentState>,
    executor: Arc<Executor>,
) {
    let queue = command_routing_key(&config.node_id);
    loop {
        if let Err(err) = command_consume_loop(&conn, &queue, &config, &state, &executor).await {
            error!(error = %err, queue, "broker command consumer loop ended, reconnecting");
        }
    }
}

async fn command_consume_loop(
    conn: &BrokerConnection,
    queue: &str,
    config: &WorkerConfig,
    state: &AgentState,
    executor: &Executor,
) -> Result<(), BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            EXCHANGE_COMMANDS,
            ExchangeKind::Topic,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            lapin::types::FieldTable::default(),
        )
        .await?;
    let mut consumer = fleet_broker::consumer::QueueConsumer::bind(
        channel,
        queue,
        EXCHANGE_COMMANDS,
        queue,
        1,
        &format!("worker-agent.{}.commands", config.node_id),
    )
    .await?;

    info!(queue, "broker command consumer attached");
    while let Some(result) = consumer.next::<Command>().await {
        match result {
            Ok(command) => {
                let result = executor.execute(command, config, state).await;
                if !result.success {
                    warn!(command_id = %result.command_id, error = ?result.error, "broker-dispatched command failed");
                }
            }
            Err(err) => warn!(error = %err, "malformed broker command, discarded"),
        }
    }
    Ok(())
}

async fn serve_and_reply(conn: &BrokerConnection, config: &WorkerConfig, state: &AgentState, request: InferenceRequest) {
    let reply_to = request.reply_to.clone();
    let response = serve_locally(config, state, request).await;
    if let Err(err) = reply(conn, &reply_to, &response).await {
        warn!(error = %err, "failed to publish inference reply");
    }
}

async fn serve_locally(config: &WorkerConfig, state: &AgentState, request: InferenceRequest) -> InferenceResponse {
    let started = Instant::now();
    let result = crate::inference::generate(&state.http, &config.worker_ollama_url, &request).await;
    state.mark_inference_activity().await;

    match result {
        Ok(text) => InferenceResponse {
            id: request.id,
            model: request.model,
            response: text,
            done: true,
            error: None,
            worker_id: config.node_id.clone(),
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(err) => InferenceResponse {
            id: request.id,
            model: request.model,
            response: String::new(),
            done: true,
            error: Some(err.to_string()),
            worker_id: config.node_id.clone(),
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        },
    }
}

async fn reply(conn: &BrokerConnection, reply_to: &str, response: &InferenceResponse) -> Result<(), BrokerError> {
    let channel = conn.channel().await?;
    let publisher = fleet_broker::publisher::Publisher::new(channel);
    // Publishing to the default exchange with the queue name as routing key
    // delivers directly to that queue, per AMQP's default-exchange rule.
    publisher.publish_json("", reply_to, response, Some(&response.id), None, None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig {
            node_id: "worker-1".into(),
            node_type: fleet_primitives::NodeType::GpuWorker,
            worker_ollama_url: "http://localhost:11434".into(),
            worker_models: vec!["llama3".into(), "qwen2".into()],
            worker_concurrency: 2,
            heartbeat_interval: Duration::from_secs(30),
            rabbitmq_url: None,
            controller_grpc_addr: "http://localhost:7070".into(),
            instance_id: String::new(),
            nebula_ip: None,
            public_ip: None,
            region: None,
            availability_zone: None,
        }
    }

    #[test]
    fn queue_bindings_cover_configured_families_and_both_priority_buckets() {
        let bindings = queue_bindings(&config());
        let queues: Vec<&str> = bindings.iter().map(|(q, _, _)| q.as_str()).collect();
        assert!(queues.contains(&"llm.inference.llama3"));
        assert!(queues.contains(&"llm.inference.qwen"));
        assert!(queues.contains(&"llm.priority.high"));
        assert!(queues.contains(&"llm.priority.low"));
    }

    #[test]
    fn unmatched_models_fall_back_to_default_queue() {
        let mut cfg = config();
        cfg.worker_models = vec!["gpt-oss".into()];
        let bindings = queue_bindings(&cfg);
        assert!(bindings.iter().any(|(q, _, _)| q == fleet_broker::topology::INFERENCE_DEFAULT_QUEUE));
    }
}
