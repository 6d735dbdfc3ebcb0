use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationAction {
    Register,
    Deregister,
}

/// Wire shape from §4.2 — deliberately its own type rather than a reuse of
/// `fleet_primitives::NodeSnapshot`: the broker's capability map is a
/// loosely-typed `gpu: bool`-style bag, not the fixed `Capabilities` struct
/// the RPC path carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationMessage {
    pub action: RegistrationAction,
    pub node_id: String,
    pub node_type: String,
    pub nebula_ip: Option<String>,
    pub public_ip: Option<String>,
    pub region: Option<String>,
    pub az: Option<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatServices {
    pub nebula: bool,
    pub k3s: bool,
    pub ollama: bool,
    pub liqo: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatGpu {
    pub index: u32,
    pub name: String,
    pub memory_used: u64,
    pub memory_total: u64,
    pub utilization: f32,
    pub temperature: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResources {
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub cpu_percent: f32,
    #[serde(default)]
    pub gpus: Vec<HeartbeatGpu>,
    #[serde(default)]
    pub models_loaded: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub node_id: String,
    pub status: HeartbeatHealth,
    pub services: HeartbeatServices,
    pub resources: HeartbeatResources,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_message_round_trips_through_json() {
        let msg = RegistrationMessage {
            action: RegistrationAction::Register,
            node_id: "node-1".into(),
            node_type: "gpu-worker".into(),
            nebula_ip: Some("10.10.0.5".into()),
            public_ip: Some("203.0.113.5".into()),
            region: Some("us-east".into()),
            az: Some("us-east-1a".into()),
            capabilities: HashMap::new(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RegistrationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_id, msg.node_id);
        assert_eq!(back.action, RegistrationAction::Register);
    }

    #[test]
    fn heartbeat_message_round_trips_through_json() {
        let msg = HeartbeatMessage {
            node_id: "node-1".into(),
            status: HeartbeatHealth::Healthy,
            services: HeartbeatServices { nebula: true, k3s: true, ollama: true, liqo: false },
            resources: HeartbeatResources {
                memory_total_mb: 65536,
                memory_used_mb: 2048,
                cpu_percent: 4.2,
                gpus: vec![],
                models_loaded: vec!["llama3.2:8b".into()],
            },
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: HeartbeatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, HeartbeatHealth::Healthy);
        assert_eq!(back.resources.models_loaded, vec!["llama3.2:8b".to_string()]);
    }

    #[test]
    fn malformed_json_fails_to_parse_rather_than_panicking() {
        let result: Result<HeartbeatMessage, _> = serde_json::from_str("{not json");
        assert!(result.is_err());
    }
}
