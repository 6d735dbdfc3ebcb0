//! The broker transport: exchange/queue topology, message DTOs, a
//! reconnecting publisher, and a reconnecting consumer.
//!
//! Every consumer and publisher task owns a dedicated `lapin::Channel` —
//! channels are never shared across tasks, per the spec's connection
//! policy.

pub mod backoff;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod messages;
pub mod publisher;
pub mod topology;

pub use backoff::Backoff;
pub use connection::BrokerConnection;
pub use error::BrokerError;
pub use messages::{HeartbeatMessage, RegistrationMessage};
