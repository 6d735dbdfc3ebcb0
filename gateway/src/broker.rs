//! Broker-mediated inference routing (§4.2): publish rules, the gateway's
//! exclusive reply queue, and correlation-id-keyed reply dispatch.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use fleet_broker::topology::{EXCHANGE_INFERENCE, EXCHANGE_PRIORITY, INFERENCE_MESSAGE_TTL_MS};
use fleet_broker::{BrokerConnection, BrokerError};
use fleet_primitives::{InferenceRequest, InferenceResponse, Priority};
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::ProxyError;

/// Owns the map from correlation id to the waiter's reply channel. Entries
/// are added before publish and removed on the *caller's* exit path
/// (whichever comes first: reply or cancellation), per §9's "reply
/// correlation as explicit ownership" design note.
#[derive(Default)]
pub struct ReplyCorrelator {
    waiters: Mutex<HashMap<String, oneshot::Sender<InferenceResponse>>>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<InferenceResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("correlator lock poisoned").insert(correlation_id.to_string(), tx);
        rx
    }

    /// Dispatches a reply to its waiter. Returns `false` (and logs) when
    /// the correlation id is unknown — already replied, already cancelled,
    /// or never registered.
    pub fn resolve(&self, correlation_id: &str, response: InferenceResponse) -> bool {
        let sender = self.waiters.lock().expect("correlator lock poisoned").remove(correlation_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                warn!(correlation_id, "reply for unknown or already-resolved correlation id, discarding");
                false
            }
        }
    }

    /// Removes a waiter without resolving it — called on the caller's
    /// cancellation/timeout path so a late reply finds nothing to deliver
    /// to (it is then dropped with a warning by `resolve`).
    pub fn deregister(&self, correlation_id: &str) {
        self.waiters.lock().expect("correlator lock poisoned").remove(correlation_id);
    }
}

/// §4.2 rule 2-4: priority strictly above 5 is `high`, strictly between 0
/// and 5 is `low`; 0 and 5 both fall through to the plain family exchange
/// (retained verbatim per spec §9's Open Question resolution).
fn routing_target(request: &InferenceRequest) -> (&'static str, String) {
    match request.priority.bucket() {
        Some(bucket) => (EXCHANGE_PRIORITY, bucket.to_string()),
        None => (EXCHANGE_INFERENCE, request.model_family().to_string()),
    }
}

/// Publishes an inference request per the routing rules and awaits its
/// correlated reply, respecting `ctx_timeout` as the caller's deadline.
pub async fn publish_and_await(
    conn: &BrokerConnection,
    correlator: &ReplyCorrelator,
    reply_queue: &str,
    mut request: InferenceRequest,
    ctx_timeout: Duration,
) -> Result<InferenceResponse, ProxyError> {
    request.reply_to = reply_queue.to_string();
    request.timestamp = Utc::now();
    let correlation_id = request.id.clone();

    let rx = correlator.register(&correlation_id);
    let (exchange, routing_key) = routing_target(&request);

    let publish_result = publish(conn, exchange, &routing_key, &request).await;
    if let Err(err) = publish_result {
        correlator.deregister(&correlation_id);
        return Err(ProxyError::BackendUnavailable(err.to_string()));
    }

    match tokio::time::timeout(ctx_timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => {
            // Sender dropped without a reply (correlator deregistered
            // concurrently, e.g. process shutdown).
            Err(ProxyError::BackendUnavailable("reply channel closed".to_string()))
        }
        Err(_) => {
            correlator.deregister(&correlation_id);
            Err(ProxyError::ColdStartTimeout)
        }
    }
}

async fn publish(
    conn: &BrokerConnection,
    exchange: &str,
    routing_key: &str,
    request: &InferenceRequest,
) -> Result<(), BrokerError> {
    let channel = conn.channel().await?;
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Direct,
            lapin::options::ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    let publisher = fleet_broker::publisher::Publisher::new(channel);
    publisher
        .publish_json(
            exchange,
            routing_key,
            request,
            Some(&request.id),
            Some(&request.reply_to),
            Some(INFERENCE_MESSAGE_TTL_MS),
        )
        .await
}

/// Declares the gateway's exclusive, auto-delete reply queue and returns
/// its broker-assigned name. Called once at startup.
pub async fn declare_reply_queue(conn: &BrokerConnection) -> Result<String, BrokerError> {
    let channel = conn.channel().await?;
    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    Ok(queue.name().to_string())
}

/// Drains the gateway's reply queue, dispatching each decoded
/// `InferenceResponse` to its correlation-id waiter. Unknown correlation
/// ids are logged and discarded (§4.2's reply correlation rule).
pub async fn run_reply_consumer(conn: std::sync::Arc<BrokerConnection>, queue: String, correlator: std::sync::Arc<ReplyCorrelator>) {
    loop {
        if let Err(err) = reply_consume_loop(&conn, &queue, &correlator).await {
            warn!(error = %err, "reply consumer loop ended, reconnecting");
        }
    }
}

async fn reply_consume_loop(
    conn: &BrokerConnection,
    queue: &str,
    correlator: &ReplyCorrelator,
) -> Result<(), BrokerError> {
    use futures::StreamExt;
    use lapin::options::BasicAckOptions;

    let channel = conn.channel().await?;
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions { exclusive: true, auto_delete: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    let mut consumer =
        channel.basic_consume(queue, "gateway.reply-consumer", BasicConsumeOptions::default(), FieldTable::default()).await?;

    info!(queue, "reply consumer attached");
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        match serde_json::from_slice::<InferenceResponse>(&delivery.data) {
            Ok(response) => {
                correlator.resolve(&response.id, response);
            }
            Err(err) => warn!(error = %err, "malformed inference response, discarding"),
        }
        delivery.ack(BasicAckOptions::default()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_primitives::InferenceRequest;
    use std::collections::HashMap as Map;

    fn request(priority: u8) -> InferenceRequest {
        InferenceRequest {
            id: "req-1".into(),
            model: "llama3.2:8b".into(),
            prompt: "hi".into(),
            stream: false,
            options: Map::new(),
            priority: Priority::new(priority).unwrap(),
            reply_to: "gateway-reply".into(),
            timestamp: Utc::now(),
            headers: Map::new(),
        }
    }

    #[test]
    fn priority_above_five_routes_to_priority_high() {
        let (exchange, key) = routing_target(&request(8));
        assert_eq!(exchange, EXCHANGE_PRIORITY);
        assert_eq!(key, "high");
    }

    #[test]
    fn priority_zero_routes_to_family_exchange() {
        let (exchange, key) = routing_target(&request(0));
        assert_eq!(exchange, EXCHANGE_INFERENCE);
        assert_eq!(key, "llama3");
    }

    #[test]
    fn priority_five_routes_to_family_exchange_not_priority() {
        let (exchange, _) = routing_target(&request(5));
        assert_eq!(exchange, EXCHANGE_INFERENCE);
    }

    #[tokio::test]
    async fn resolving_unknown_correlation_id_returns_false() {
        let correlator = ReplyCorrelator::new();
        let response = InferenceResponse {
            id: "ghost".into(),
            model: "llama3".into(),
            response: String::new(),
            done: true,
            error: None,
            worker_id: "w1".into(),
            timestamp: Utc::now(),
            duration_ms: 1,
        };
        assert!(!correlator.resolve("ghost", response));
    }

    #[tokio::test]
    async fn deregister_then_late_reply_is_dropped() {
        let correlator = ReplyCorrelator::new();
        let _rx = correlator.register("req-1");
        correlator.deregister("req-1");
        let response = InferenceResponse {
            id: "req-1".into(),
            model: "llama3".into(),
            response: String::new(),
            done: true,
            error: None,
            worker_id: "w1".into(),
            timestamp: Utc::now(),
            duration_ms: 1,
        };
        assert!(!correlator.resolve("req-1", response));
    }
}
