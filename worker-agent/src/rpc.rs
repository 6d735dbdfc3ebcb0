//! RPC-side transport: initial `Register` call, then a long-lived
//! `Connect` stream pushing heartbeats/status and consuming commands
//! (§4.4, §4.5).

use std::sync::Arc;
use std::time::Duration;

use fleet_rpc::proto::{Capabilities, ClientEnvelope, ControlMessage, Heartbeat, RegisterRequest};
use fleet_rpc::{convert, FleetControlClient};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::executor::Executor;
use crate::state::AgentState;

async fn connect_client(addr: &str) -> Result<FleetControlClient<Channel>, tonic::transport::Error> {
    FleetControlClient::connect(addr.to_string()).await
}

async fn register(client: &mut FleetControlClient<Channel>, config: &WorkerConfig) -> Result<(), tonic::Status> {
    let request = RegisterRequest {
        node_id: config.node_id.clone(),
        node_type: config.node_type.to_string(),
        instance_id: config.instance_id.clone(),
        public_ip: config.public_ip.clone().unwrap_or_default(),
        nebula_ip: config.nebula_ip.clone().unwrap_or_default(),
        region: config.region.clone().unwrap_or_default(),
        availability_zone: config.availability_zone.clone().unwrap_or_default(),
        labels: Default::default(),
        capabilities: Some(Capabilities { gpu_count: 0, gpu_memory_bytes: 0, total_memory_bytes: 0 }),
    };
    client.register(Request::new(request)).await?;
    info!(node_id = %config.node_id, "registered with fleet manager via RPC");
    Ok(())
}

/// Runs registration followed by the `Connect` stream, reconnecting with a
/// fixed backoff on any transport error. Runs until the process exits.
pub async fn run(config: WorkerConfig, state: Arc<AgentState>, executor: Arc<Executor>) {
    loop {
        match run_once(&config, &state, &executor).await {
            Ok(()) => warn!("RPC stream ended cleanly, reconnecting"),
            Err(err) => error!(error = %err, "RPC session failed, reconnecting"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn run_once(config: &WorkerConfig, state: &Arc<AgentState>, executor: &Arc<Executor>) -> anyhow::Result<()> {
    let mut client = connect_client(&config.controller_grpc_addr).await?;
    register(&mut client, config).await?;

    let (outbound_tx, outbound_rx) = mpsc::channel::<ClientEnvelope>(32);

    let mut request = Request::new(ReceiverStream::new(outbound_rx));
    request.metadata_mut().insert("x-node-id", config.node_id.parse()?);

    let response = client.connect(request).await?;
    let mut inbound = response.into_inner();

    let heartbeat_task = {
        let config = config.clone();
        let tx = outbound_tx.clone();
        tokio::spawn(async move { push_heartbeats(config, tx).await })
    };

    let status_task = {
        let config = config.clone();
        let state = state.clone();
        let tx = outbound_tx.clone();
        tokio::spawn(async move { push_status(config, state, tx).await })
    };

    loop {
        match inbound.message().await {
            Ok(Some(message)) => handle_control_message(message, config, state, executor, &outbound_tx).await,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "Connect stream read error");
                break;
            }
        }
    }

    heartbeat_task.abort();
    status_task.abort();
    Ok(())
}

async fn push_heartbeats(config: WorkerConfig, tx: mpsc::Sender<ClientEnvelope>) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    loop {
        ticker.tick().await;
        let envelope = ClientEnvelope {
            payload: Some(fleet_rpc::proto::client_envelope::Payload::Heartbeat(Heartbeat {
                node_id: config.node_id.clone(),
                unix_timestamp: chrono::Utc::now().timestamp(),
            })),
        };
        if tx.send(envelope).await.is_err() {
            break;
        }
    }
}

async fn push_status(config: WorkerConfig, state: Arc<AgentState>, tx: mpsc::Sender<ClientEnvelope>) {
    // Pushed on the same cadence as the heartbeat; a full status snapshot is
    // more expensive to collect, so this is the floor rather than a minimum.
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    loop {
        ticker.tick().await;
        let status = state.snapshot().await;
        let proto = convert::status_to_proto(&config.node_id, &status);
        let envelope = ClientEnvelope { payload: Some(fleet_rpc::proto::client_envelope::Payload::Status(proto)) };
        if tx.send(envelope).await.is_err() {
            break;
        }
    }
}

async fn handle_control_message(
    message: ControlMessage,
    config: &WorkerConfig,
    state: &Arc<AgentState>,
    executor: &Arc<Executor>,
    outbound_tx: &mpsc::Sender<ClientEnvelope>,
) {
    use fleet_rpc::proto::control_message::Payload;
    match message.payload {
        Some(Payload::Command(proto)) => {
            let command = match convert::command_from_proto(&proto) {
                Ok(command) => command,
                Err(err) => {
                    warn!(error = %err, "received malformed command, discarding");
                    return;
                }
            };
            let command_id = command.command_id;
            let result = executor.execute(command, config, state).await;
            let envelope = ClientEnvelope {
                payload: Some(fleet_rpc::proto::client_envelope::Payload::CommandResult(
                    convert::command_result_to_proto(&result),
                )),
            };
            if outbound_tx.send(envelope).await.is_err() {
                warn!(%command_id, "could not report command result, stream writer gone");
            }
        }
        Some(Payload::ShutdownNotice(notice)) => {
            info!(reason = %notice.reason, "shutdown notice received from controller");
        }
        Some(Payload::Ping(_)) => {}
        None => warn!("empty ControlMessage received"),
    }
}
