//! Thin client for the fleet manager's admin HTTP API, used to resolve a
//! remote backend URL dynamically and to decide whether `auto` routing has
//! a healthy remote worker to fall back to.

use fleet_primitives::NodeSnapshot;
use tracing::warn;

#[derive(Clone)]
pub struct FleetClient {
    http: reqwest::Client,
    base_url: String,
}

impl FleetClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder().timeout(std::time::Duration::from_secs(5)).build().expect("reqwest client"),
            base_url: base_url.into(),
        }
    }

    async fn list_nodes(&self, health: Option<&str>) -> Vec<NodeSnapshot> {
        let mut url = format!("{}/nodes", self.base_url.trim_end_matches('/'));
        if let Some(h) = health {
            url.push_str("?health=");
            url.push_str(h);
        }
        match self.http.get(&url).send().await {
            Ok(resp) => match resp.json::<Vec<NodeSnapshot>>().await {
                Ok(nodes) => nodes,
                Err(err) => {
                    warn!(error = %err, "failed to parse fleet manager /nodes response");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to reach fleet manager admin API");
                Vec::new()
            }
        }
    }

    /// The best healthy remote worker per §4.1's tie-break: health-healthy
    /// first, then `gpu_count` descending.
    pub async fn best_remote_worker(&self) -> Option<NodeSnapshot> {
        let mut nodes = self.list_nodes(None).await;
        nodes.retain(|n| n.connected);
        nodes.sort_by(|a, b| {
            let a_healthy = a.health_status == fleet_primitives::HealthStatus::Healthy;
            let b_healthy = b.health_status == fleet_primitives::HealthStatus::Healthy;
            b_healthy.cmp(&a_healthy).then(b.capabilities.gpu_count.cmp(&a.capabilities.gpu_count))
        });
        nodes.into_iter().next()
    }

    pub async fn has_healthy_remote_worker(&self) -> bool {
        !self.list_nodes(Some("healthy")).await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_nodes_url_with_health_filter() {
        let client = FleetClient::new("http://fleet:8090");
        assert_eq!(client.base_url, "http://fleet:8090");
    }
}
