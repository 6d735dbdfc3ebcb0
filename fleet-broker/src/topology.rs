//! Logical exchange/queue topology from §4.2, independent of broker brand.

pub const EXCHANGE_REGISTRATION: &str = "agents.registration";
pub const EXCHANGE_HEARTBEAT: &str = "agents.heartbeat";
pub const EXCHANGE_COMMANDS: &str = "agents.commands";
pub const EXCHANGE_INFERENCE: &str = "llm.inference";
pub const EXCHANGE_PRIORITY: &str = "llm.priority";
pub const EXCHANGE_WORKERS: &str = "llm.workers";
pub const EXCHANGE_DLX: &str = "llm.dlx";

pub const QUEUE_REGISTRATION_CONTROL_PLANE: &str = "registration.control-plane";
pub const QUEUE_HEARTBEAT_CONTROL_PLANE: &str = "heartbeat.control-plane";

/// Routing key every worker publishes registration/deregistration under.
/// `agents.registration` is a direct exchange, so publisher and binder must
/// agree on one exact key — there is no wildcard match as on a topic
/// exchange.
pub const ROUTING_KEY_REGISTRATION: &str = "register";

/// Five-minute TTL on published inference requests, per §4.2.
pub const INFERENCE_MESSAGE_TTL_MS: u64 = 5 * 60 * 1000;

/// Routing key for a worker's dedicated command queue.
pub fn command_routing_key(node_id: &str) -> String {
    format!("node.{node_id}")
}

/// Per-family inference queue name, or the `default` queue for unrecognized
/// families.
pub fn inference_queue_name(family: &str) -> String {
    format!("llm.inference.{family}")
}

pub const INFERENCE_DEFAULT_QUEUE: &str = "llm.inference.default";

pub fn priority_queue_name(bucket: &str) -> String {
    format!("llm.priority.{bucket}")
}
