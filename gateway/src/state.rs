use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_broker::BrokerConnection;
use tokio::sync::RwLock as AsyncRwLock;
use uuid::Uuid;

use crate::backend::Backend;
use crate::broker::ReplyCorrelator;
use crate::config::{GatewayConfig, RoutingMode};
use crate::fleet_client::FleetClient;
use crate::provision::ProvisioningCapability;

/// Identifies one of the gateway's three backends. `Mac` has no dedicated
/// config option in spec §6's table; it is only reachable by forcing
/// `routing_mode=mac`, and is left unconfigured (base_url `None`) unless an
/// operator sets `MAC_OLLAMA_URL` — see `GatewayState::new`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendId {
    Local,
    Remote,
    Mac,
}

impl BackendId {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendId::Local => "local",
            BackendId::Remote => "remote",
            BackendId::Mac => "mac",
        }
    }
}

/// Gateway-wide counters from spec §3 ("Gateway State"), distinct from the
/// per-backend Prometheus series in `metrics.rs`.
#[derive(Default)]
pub struct GatewayCounters {
    pub local_routed: AtomicU64,
    pub remote_routed: AtomicU64,
}

impl GatewayCounters {
    pub fn record(&self, backend: BackendId) {
        match backend {
            BackendId::Local => self.local_routed.fetch_add(1, Ordering::Relaxed),
            BackendId::Remote => self.remote_routed.fetch_add(1, Ordering::Relaxed),
            BackendId::Mac => 0, // no dedicated counter for mac in §3; tracked via per-backend metrics only
        };
    }
}

pub struct GatewayState {
    pub config: GatewayConfig,
    pub local: Backend,
    pub remote: Backend,
    pub mac: Backend,
    pub counters: GatewayCounters,
    pub http_client: reqwest::Client,
    pub fleet_client: Option<FleetClient>,
    pub provisioner: Arc<dyn ProvisioningCapability>,
    pub reply_correlator: Arc<ReplyCorrelator>,
    /// Present only when `broker_mode` is enabled; the connection used for
    /// publishing inference requests and the gateway's own reply queue
    /// name. Set via `with_broker` before the state is shared behind `Arc`.
    pub broker_conn: Option<Arc<BrokerConnection>>,
    pub reply_queue: Option<String>,
    /// Runtime-mutable defaults for `/_/ttl`, `/_/pause`, `/_/resume`.
    pub idle_timeout: AsyncRwLock<Duration>,
    pub instance_id: String,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, provisioner: Arc<dyn ProvisioningCapability>) -> Self {
        let local = Backend::new("local", config.ollama_url.clone(), config.ollama_url.is_some());
        let remote = Backend::new("remote", config.remote_ollama_url.clone(), false);
        let mac = Backend::new("mac", std::env::var("MAC_OLLAMA_URL").ok(), false);
        let fleet_client = config.fleet_api_url.clone().map(FleetClient::new);
        let idle_timeout = AsyncRwLock::new(config.idle_timeout);

        Self {
            local,
            remote,
            mac,
            counters: GatewayCounters::default(),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .expect("reqwest client"),
            fleet_client,
            provisioner,
            reply_correlator: Arc::new(ReplyCorrelator::new()),
            broker_conn: None,
            reply_queue: None,
            idle_timeout,
            instance_id: Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Attaches a broker connection and reply queue before the state is
    /// wrapped in `Arc` and shared across tasks.
    pub fn with_broker(mut self, conn: Arc<BrokerConnection>, reply_queue: String) -> Self {
        self.broker_conn = Some(conn);
        self.reply_queue = Some(reply_queue);
        self
    }

    pub fn backend(&self, id: BackendId) -> &Backend {
        match id {
            BackendId::Local => &self.local,
            BackendId::Remote => &self.remote,
            BackendId::Mac => &self.mac,
        }
    }

    pub fn default_routing_mode(&self) -> RoutingMode {
        self.config.routing_mode
    }

    pub async fn idle_timeout(&self) -> Duration {
        *self.idle_timeout.read().await
    }

    pub async fn set_idle_timeout(&self, duration: Duration) {
        *self.idle_timeout.write().await = duration;
    }
}
