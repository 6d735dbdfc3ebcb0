use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::BrokerError;

/// A task-owned durable queue consumer. `concurrency` is used verbatim as
/// the channel's prefetch count, per §4.2's "set per-channel QoS equal to
/// concurrency" rule.
pub struct QueueConsumer {
    channel: Channel,
    consumer: Consumer,
}

impl QueueConsumer {
    pub async fn bind(
        channel: Channel,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        concurrency: u16,
        consumer_tag: &str,
    ) -> Result<Self, BrokerError> {
        channel
            .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;
        channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        channel.basic_qos(concurrency, BasicQosOptions::default()).await?;

        let consumer = channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        Ok(Self { channel, consumer })
    }

    /// Receives and deserializes the next message, ACKing on success and
    /// NACKing-without-requeue on malformed payloads (§7: "log warning,
    /// discard; no poison-queue loops").
    pub async fn next<T: DeserializeOwned>(&mut self) -> Option<Result<T, BrokerError>> {
        let delivery = self.consumer.next().await?;
        let delivery = match delivery {
            Ok(d) => d,
            Err(err) => return Some(Err(BrokerError::Connection(err))),
        };

        match serde_json::from_slice::<T>(&delivery.data) {
            Ok(value) => {
                if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                    return Some(Err(BrokerError::Connection(err)));
                }
                Some(Ok(value))
            }
            Err(err) => {
                warn!(error = %err, "discarding malformed broker message");
                if let Err(nack_err) =
                    delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await
                {
                    return Some(Err(BrokerError::Connection(nack_err)));
                }
                Some(Err(BrokerError::Serialization(err)))
            }
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}
