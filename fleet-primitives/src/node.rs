use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PrimitiveError;
use crate::status::NodeStatus;

/// Kind of worker, mirrors the overlay topology's node roles.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Lighthouse,
    GpuWorker,
    CpuWorker,
    Unspecified,
}

impl Default for NodeType {
    fn default() -> Self {
        NodeType::Unspecified
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Lighthouse => "lighthouse",
            NodeType::GpuWorker => "gpu_worker",
            NodeType::CpuWorker => "cpu_worker",
            NodeType::Unspecified => "unspecified",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NodeType {
    type Err = PrimitiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lighthouse" => Ok(NodeType::Lighthouse),
            "gpu_worker" | "gpu-worker" => Ok(NodeType::GpuWorker),
            "cpu_worker" | "cpu-worker" => Ok(NodeType::CpuWorker),
            "unspecified" | "" => Ok(NodeType::Unspecified),
            other => Err(PrimitiveError::UnknownNodeType(other.to_string())),
        }
    }
}

/// Liveness classification, derived by the TTL reconciler — distinct from the
/// agent's self-reported health carried in `NodeStatus`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Stale,
    Dead,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Stale => "stale",
            HealthStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub gpu_count: u32,
    pub gpu_memory_bytes: u64,
    pub total_memory_bytes: u64,
}

/// A serializable snapshot of a registered node, suitable for HTTP/RPC
/// responses. The live, mutable `Node` record (with its outbox sender and
/// per-field locks) lives in `fleet-manager::registry` — this type is its
/// read-only projection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn node_type_round_trips_through_display_and_from_str() {
        for nt in [
            NodeType::Lighthouse,
            NodeType::GpuWorker,
            NodeType::CpuWorker,
            NodeType::Unspecified,
        ] {
            let s = nt.to_string();
            assert_eq!(NodeType::from_str(&s).unwrap(), nt);
        }
    }

    #[test]
    fn node_type_accepts_hyphenated_broker_spelling() {
        assert_eq!(NodeType::from_str("gpu-worker").unwrap(), NodeType::GpuWorker);
    }

    #[test]
    fn unknown_node_type_is_rejected() {
        assert!(NodeType::from_str("toaster").is_err());
    }
}
