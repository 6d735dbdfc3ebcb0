use std::sync::Arc;

use fleet_primitives::{Capabilities, NodeType};
use fleet_rpc::proto::{
    Ack, ClientEnvelope, CommandDispatchResult, CommandResultProto, ControlMessage,
    FleetStatusFilter, FleetStatusResponse, FleetSummary, NodeStatusProto, NodeSummary,
    RegisterRequest, RegisterResponse, TargetedCommand,
};
use fleet_rpc::{convert, FleetControl};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument, warn};

use crate::metrics;
use crate::registry::{ListFilter, Registry, RegistrationInput, RegistrationSource};

pub struct FleetControlService {
    registry: Arc<Registry>,
}

impl FleetControlService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

fn node_id_from_metadata(request: &Request<Streaming<ClientEnvelope>>) -> Result<String, Status> {
    request
        .metadata()
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| Status::invalid_argument("missing x-node-id metadata on Connect stream"))
}

#[tonic::async_trait]
impl FleetControl for FleetControlService {
    #[instrument(skip_all, fields(node_id = %request.get_ref().node_id))]
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let node_type = req.node_type.parse::<NodeType>().unwrap_or_default();
        let input = RegistrationInput {
            node_type,
            instance_id: non_empty(req.instance_id),
            public_ip: non_empty(req.public_ip),
            nebula_ip: non_empty(req.nebula_ip),
            region: non_empty(req.region),
            availability_zone: non_empty(req.availability_zone),
            labels: req.labels,
            capabilities: req
                .capabilities
                .map(|c| Capabilities {
                    gpu_count: c.gpu_count,
                    gpu_memory_bytes: c.gpu_memory_bytes,
                    total_memory_bytes: c.total_memory_bytes,
                })
                .unwrap_or_default(),
        };
        self.registry.register(&req.node_id, input, RegistrationSource::Rpc);
        info!("node registered via RPC");
        Ok(Response::new(RegisterResponse { node_id: req.node_id, accepted: true }))
    }

    type ConnectStream = ReceiverStream<Result<ControlMessage, Status>>;

    #[instrument(skip_all)]
    async fn connect(
        &self,
        request: Request<Streaming<ClientEnvelope>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let node_id = node_id_from_metadata(&request)?;
        let mut inbound = request.into_inner();
        let (snapshot, mut outbox_rx) = self.registry.attach_stream(&node_id);
        info!(node_id = %snapshot.node_id, "RPC stream attached");

        let (tx, rx) = tokio::sync::mpsc::channel(16);

        let registry = self.registry.clone();
        let writer_node_id = node_id.clone();
        let writer_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(command) = outbox_rx.recv().await {
                let msg = ControlMessage {
                    payload: Some(fleet_rpc::proto::control_message::Payload::Command(convert::command_to_proto(
                        &command,
                    ))),
                };
                if writer_tx.send(Ok(msg)).await.is_err() {
                    break;
                }
            }
            registry.detach_stream(&writer_node_id);
        });

        let reader_node_id = node_id.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(envelope)) => handle_envelope(&registry, &reader_node_id, envelope),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(node_id = %reader_node_id, error = %err, "Connect stream read error");
                        break;
                    }
                }
            }
            registry.detach_stream(&reader_node_id);
            registry.disconnect(&reader_node_id);
            info!(node_id = %reader_node_id, "RPC stream detached");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[instrument(skip_all, fields(node_id = %request.get_ref().node_id))]
    async fn send_status(&self, request: Request<NodeStatusProto>) -> Result<Response<Ack>, Status> {
        let proto = request.into_inner();
        let status = convert::status_from_proto(&proto);
        match self.registry.update_status(&proto.node_id, status) {
            Ok(()) => Ok(Response::new(Ack { ok: true })),
            Err(err) => Err(Status::not_found(err.to_string())),
        }
    }

    async fn get_fleet_status(
        &self,
        request: Request<FleetStatusFilter>,
    ) -> Result<Response<FleetStatusResponse>, Status> {
        let filter_proto = request.into_inner();
        let filter = ListFilter {
            node_type: non_empty(filter_proto.node_type).and_then(|s| s.parse().ok()),
            health: non_empty(filter_proto.health).and_then(|s| parse_health(&s)),
        };
        let status = self.registry.fleet_status(&filter);
        metrics::observe_fleet(&self.registry);

        let nodes = status
            .nodes
            .iter()
            .map(|n| NodeSummary {
                node_id: n.node_id.clone(),
                node_type: n.node_type.to_string(),
                health: n.health_status.to_string(),
                connected: n.connected,
                stream_active: n.stream_active,
            })
            .collect();

        Ok(Response::new(FleetStatusResponse {
            nodes,
            summary: Some(FleetSummary {
                total: status.summary.total as u32,
                healthy: status.summary.healthy as u32,
                degraded: status.summary.degraded as u32,
                unhealthy: status.summary.unhealthy as u32,
                stale: status.summary.stale as u32,
                dead: status.summary.dead as u32,
                total_gpu_count: status.summary.total_gpu_count,
            }),
        }))
    }

    #[instrument(skip_all, fields(node_id = %request.get_ref().node_id))]
    async fn send_command(
        &self,
        request: Request<TargetedCommand>,
    ) -> Result<Response<CommandDispatchResult>, Status> {
        let req = request.into_inner();
        let command_proto =
            req.command.ok_or_else(|| Status::invalid_argument("missing command"))?;
        let command = convert::command_from_proto(&command_proto)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        let kind_label = format!("{:?}", command.kind).to_lowercase();
        let enqueued = self.registry.send_command(&req.node_id, command);
        metrics::COMMANDS_SENT
            .with_label_values(&[&kind_label, if enqueued { "enqueued" } else { "rejected" }])
            .inc();
        Ok(Response::new(CommandDispatchResult { enqueued }))
    }
}

fn handle_envelope(registry: &Registry, node_id: &str, envelope: ClientEnvelope) {
    use fleet_rpc::proto::client_envelope::Payload;
    match envelope.payload {
        Some(Payload::Heartbeat(_)) => registry.heartbeat(node_id),
        Some(Payload::Status(status)) => {
            let parsed = convert::status_from_proto(&status);
            if let Err(err) = registry.update_status(node_id, parsed) {
                warn!(node_id, error = %err, "status push for unknown node");
            }
        }
        Some(Payload::CommandResult(result)) => log_command_result(node_id, result),
        None => warn!(node_id, "empty ClientEnvelope received"),
    }
}

fn log_command_result(node_id: &str, result: CommandResultProto) {
    if result.success {
        info!(node_id, command_id = %result.command_id, "command completed");
    } else {
        warn!(node_id, command_id = %result.command_id, error = %result.error, "command failed");
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_health(s: &str) -> Option<fleet_primitives::HealthStatus> {
    use fleet_primitives::HealthStatus::*;
    Some(match s {
        "healthy" => Healthy,
        "degraded" => Degraded,
        "unhealthy" => Unhealthy,
        "stale" => Stale,
        "dead" => Dead,
        _ => return None,
    })
}
