use lazy_static::lazy_static;
use prometheus::{CounterVec, GaugeVec, Opts, Registry as PromRegistry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: PromRegistry = PromRegistry::new();
    pub static ref REQUESTS_TOTAL: CounterVec =
        CounterVec::new(Opts::new("llm_proxy_requests_total", "Proxied requests by backend"), &["backend"]).unwrap();
    pub static ref REQUESTS_BLOCKED: CounterVec = CounterVec::new(
        Opts::new("llm_proxy_requests_blocked_total", "Requests held on the cold-start barrier"),
        &["backend"]
    )
    .unwrap();
    pub static ref COLD_STARTS: CounterVec =
        CounterVec::new(Opts::new("llm_proxy_cold_starts_total", "stopped -> running transitions"), &["backend"])
            .unwrap();
    pub static ref WORKER_STATE: GaugeVec = GaugeVec::new(
        Opts::new("llm_proxy_worker_state", "1 for the backend's current lifecycle state"),
        &["backend", "state"]
    )
    .unwrap();
    pub static ref IDLE_SECONDS: GaugeVec =
        GaugeVec::new(Opts::new("llm_proxy_idle_seconds", "Seconds since the backend's last request"), &["backend"])
            .unwrap();
}

pub fn init() {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(REQUESTS_BLOCKED.clone())).ok();
    REGISTRY.register(Box::new(COLD_STARTS.clone())).ok();
    REGISTRY.register(Box::new(WORKER_STATE.clone())).ok();
    REGISTRY.register(Box::new(IDLE_SECONDS.clone())).ok();
}

/// Sets the one-hot `llm_proxy_worker_state` gauge for `backend`, zeroing
/// every other state label so exactly one series reads `1`.
pub fn set_worker_state(backend: &str, states: &[&str], current: &str) {
    for state in states {
        WORKER_STATE.with_label_values(&[backend, state]).set(if *state == current { 1.0 } else { 0.0 });
    }
}

pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}
