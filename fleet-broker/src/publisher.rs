use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use serde::Serialize;

use crate::error::BrokerError;

/// Thin wrapper around a task-owned `Channel` for publishing durable,
/// persistent JSON messages. Never shared across tasks.
pub struct Publisher {
    channel: Channel,
}

impl Publisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Publishes a persistent JSON message. `expiration_ms` sets the
    /// message TTL (§4.2: inference requests carry a 5-minute TTL).
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        correlation_id: Option<&str>,
        reply_to: Option<&str>,
        expiration_ms: Option<u64>,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(payload)?;
        let mut props = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent
        if let Some(cid) = correlation_id {
            props = props.with_correlation_id(cid.into());
        }
        if let Some(rt) = reply_to {
            props = props.with_reply_to(rt.into());
        }
        if let Some(ttl) = expiration_ms {
            props = props.with_expiration(ttl.to_string().into());
        }

        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &body, props)
            .await?
            .await?;
        Ok(())
    }
}
