use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::HealthStatus;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    Nebula,
    K3s,
    Ollama,
    Liqo,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    Starting,
    NotInstalled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceReport {
    pub state: ServiceState,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: u32,
    pub name: String,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub utilization: f32,
    pub temperature_c: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadedModel {
    pub name: String,
    pub size_bytes: u64,
    pub currently_loaded: bool,
}

/// A full status snapshot as produced by the worker agent, carried either
/// over the RPC stream or (as a heartbeat-adjacent subset) over the broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub health: HealthStatus,
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
    pub services: Vec<(ServiceName, ServiceReport)>,
    pub resources: Resources,
    pub gpus: Vec<GpuStatus>,
    pub models: Vec<LoadedModel>,
    pub timestamp: DateTime<Utc>,
}

impl NodeStatus {
    pub fn service(&self, name: ServiceName) -> Option<&ServiceReport> {
        self.services.iter().find(|(n, _)| *n == name).map(|(_, r)| r)
    }

    /// Derives overall health per §4.5: an unmet critical service is
    /// `unhealthy`; a degraded non-critical one is `degraded`; otherwise
    /// `healthy`. `critical` names the services whose absence is fatal to
    /// serving inference traffic (by default, just `ollama`).
    pub fn derive_health(services: &[(ServiceName, ServiceReport)], critical: &[ServiceName]) -> HealthStatus {
        let mut degraded = false;
        for (name, report) in services {
            let unmet = !matches!(report.state, ServiceState::Running);
            if unmet && critical.contains(name) {
                return HealthStatus::Unhealthy;
            }
            if unmet {
                degraded = true;
            }
        }
        if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: ServiceState) -> ServiceReport {
        ServiceReport { state, message: String::new() }
    }

    #[test]
    fn all_running_is_healthy() {
        let services = vec![
            (ServiceName::Ollama, report(ServiceState::Running)),
            (ServiceName::Nebula, report(ServiceState::Running)),
        ];
        assert_eq!(
            NodeStatus::derive_health(&services, &[ServiceName::Ollama]),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn critical_service_down_is_unhealthy() {
        let services = vec![(ServiceName::Ollama, report(ServiceState::Stopped))];
        assert_eq!(
            NodeStatus::derive_health(&services, &[ServiceName::Ollama]),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn noncritical_service_down_is_degraded() {
        let services = vec![
            (ServiceName::Ollama, report(ServiceState::Running)),
            (ServiceName::Liqo, report(ServiceState::Stopped)),
        ];
        assert_eq!(
            NodeStatus::derive_health(&services, &[ServiceName::Ollama]),
            HealthStatus::Degraded
        );
    }
}
