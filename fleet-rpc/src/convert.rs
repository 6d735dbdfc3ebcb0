//! Conversions between the wire (`proto`) shapes and `fleet-primitives`'
//! in-process types. Kept in one place so neither the server (fleet-manager)
//! nor the client (worker-agent) has to hand-roll field-by-field mapping.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use fleet_primitives::{
    Command, CommandResult, CommandType, GpuStatus, HealthStatus, LoadedModel, NodeStatus,
    Resources, ServiceName, ServiceReport, ServiceState,
};
use uuid::Uuid;

use crate::proto;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid command id: {0}")]
    InvalidCommandId(#[from] uuid::Error),

    #[error("unknown command type: {0}")]
    UnknownCommandType(#[from] fleet_primitives::PrimitiveError),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

fn health_to_str(h: HealthStatus) -> String {
    h.to_string()
}

fn health_from_str(s: &str) -> HealthStatus {
    match s {
        "healthy" => HealthStatus::Healthy,
        "degraded" => HealthStatus::Degraded,
        "unhealthy" => HealthStatus::Unhealthy,
        "stale" => HealthStatus::Stale,
        "dead" => HealthStatus::Dead,
        _ => HealthStatus::Unhealthy,
    }
}

fn service_name_key(name: ServiceName) -> &'static str {
    match name {
        ServiceName::Nebula => "nebula",
        ServiceName::K3s => "k3s",
        ServiceName::Ollama => "ollama",
        ServiceName::Liqo => "liqo",
    }
}

fn service_name_from_key(key: &str) -> Option<ServiceName> {
    match key {
        "nebula" => Some(ServiceName::Nebula),
        "k3s" => Some(ServiceName::K3s),
        "ollama" => Some(ServiceName::Ollama),
        "liqo" => Some(ServiceName::Liqo),
        _ => None,
    }
}

fn service_state_str(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Running => "running",
        ServiceState::Stopped => "stopped",
        ServiceState::Starting => "starting",
        ServiceState::NotInstalled => "not_installed",
    }
}

fn service_state_from_str(s: &str) -> ServiceState {
    match s {
        "running" => ServiceState::Running,
        "starting" => ServiceState::Starting,
        "not_installed" => ServiceState::NotInstalled,
        _ => ServiceState::Stopped,
    }
}

fn unix_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

pub fn status_to_proto(node_id: &str, status: &NodeStatus) -> proto::NodeStatusProto {
    let mut services = HashMap::new();
    for (name, report) in &status.services {
        services.insert(
            service_name_key(*name).to_string(),
            proto::ServiceReportProto {
                state: service_state_str(report.state).to_string(),
                message: report.message.clone(),
            },
        );
    }

    proto::NodeStatusProto {
        node_id: node_id.to_string(),
        health: health_to_str(status.health),
        uptime_seconds: status.uptime_seconds,
        idle_seconds: status.idle_seconds,
        services,
        resources: Some(proto::ResourcesProto {
            cpu_percent: status.resources.cpu_percent,
            memory_used_mb: status.resources.memory_used_mb,
            memory_total_mb: status.resources.memory_total_mb,
        }),
        gpus: status
            .gpus
            .iter()
            .map(|g| proto::GpuStatusProto {
                index: g.index,
                name: g.name.clone(),
                memory_used_mb: g.memory_used_mb,
                memory_total_mb: g.memory_total_mb,
                utilization: g.utilization,
                temperature_c: g.temperature_c,
            })
            .collect(),
        models: status
            .models
            .iter()
            .map(|m| proto::LoadedModelProto {
                name: m.name.clone(),
                size_bytes: m.size_bytes,
                currently_loaded: m.currently_loaded,
            })
            .collect(),
        unix_timestamp: status.timestamp.timestamp(),
    }
}

pub fn status_from_proto(proto: &proto::NodeStatusProto) -> NodeStatus {
    let mut services: Vec<(ServiceName, ServiceReport)> = Vec::new();
    for (key, report) in &proto.services {
        if let Some(name) = service_name_from_key(key) {
            services.push((
                name,
                ServiceReport { state: service_state_from_str(&report.state), message: report.message.clone() },
            ));
        }
    }

    NodeStatus {
        health: health_from_str(&proto.health),
        uptime_seconds: proto.uptime_seconds,
        idle_seconds: proto.idle_seconds,
        services,
        resources: proto
            .resources
            .as_ref()
            .map(|r| Resources {
                cpu_percent: r.cpu_percent,
                memory_used_mb: r.memory_used_mb,
                memory_total_mb: r.memory_total_mb,
            })
            .unwrap_or_default(),
        gpus: proto
            .gpus
            .iter()
            .map(|g| GpuStatus {
                index: g.index,
                name: g.name.clone(),
                memory_used_mb: g.memory_used_mb,
                memory_total_mb: g.memory_total_mb,
                utilization: g.utilization,
                temperature_c: g.temperature_c,
            })
            .collect(),
        models: proto
            .models
            .iter()
            .map(|m| LoadedModel { name: m.name.clone(), size_bytes: m.size_bytes, currently_loaded: m.currently_loaded })
            .collect(),
        timestamp: unix_to_datetime(proto.unix_timestamp),
    }
}

fn command_type_str(kind: CommandType) -> &'static str {
    match kind {
        CommandType::Shutdown => "shutdown",
        CommandType::Reboot => "reboot",
        CommandType::Drain => "drain",
        CommandType::PullModel => "pull_model",
        CommandType::UnloadModel => "unload_model",
        CommandType::Exec => "exec",
        CommandType::RestartService => "restart_service",
        CommandType::Status => "status",
    }
}

pub fn command_to_proto(command: &Command) -> proto::CommandProto {
    proto::CommandProto {
        command_id: command.command_id.to_string(),
        r#type: command_type_str(command.kind).to_string(),
        args: command.args.clone(),
        timeout_seconds: command.timeout_seconds,
    }
}

pub fn command_from_proto(proto: &proto::CommandProto) -> Result<Command, ConvertError> {
    Ok(Command {
        command_id: Uuid::from_str(&proto.command_id)?,
        kind: CommandType::from_str(&proto.r#type)?,
        args: proto.args.clone(),
        timeout_seconds: proto.timeout_seconds,
    })
}

pub fn command_result_to_proto(result: &CommandResult) -> proto::CommandResultProto {
    proto::CommandResultProto {
        command_id: result.command_id.to_string(),
        success: result.success,
        exit_code: result.exit_code.unwrap_or(-1),
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        error: result.error.clone().unwrap_or_default(),
        duration_ms: result.duration_ms,
    }
}

pub fn command_result_from_proto(proto: &proto::CommandResultProto) -> Result<CommandResult, ConvertError> {
    Ok(CommandResult {
        command_id: Uuid::from_str(&proto.command_id)?,
        success: proto.success,
        exit_code: if proto.exit_code == -1 { None } else { Some(proto.exit_code) },
        stdout: proto.stdout.clone(),
        stderr: proto.stderr.clone(),
        error: if proto.error.is_empty() { None } else { Some(proto.error.clone()) },
        duration_ms: proto.duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    #[test]
    fn command_round_trips_through_proto() {
        let cmd = Command::new(CommandType::Shutdown, Map::new(), 30);
        let proto = command_to_proto(&cmd);
        let back = command_from_proto(&proto).unwrap();
        assert_eq!(back.command_id, cmd.command_id);
        assert_eq!(back.kind, CommandType::Shutdown);
    }

    #[test]
    fn command_result_round_trips_preserving_absent_exit_code() {
        let result = CommandResult::failure(Uuid::new_v4(), "boom", 12);
        let proto = command_result_to_proto(&result);
        let back = command_result_from_proto(&proto).unwrap();
        assert_eq!(back.exit_code, None);
        assert_eq!(back.error.as_deref(), Some("boom"));
    }
}
