//! Shared domain types for the fleet controller.
//!
//! This crate is intentionally free of I/O and async: it only defines the
//! wire/record shapes that `fleet-broker`, `fleet-rpc`, `fleet-manager`,
//! `gateway`, and `worker-agent` all need to agree on.

pub mod command;
pub mod error;
pub mod inference;
pub mod node;
pub mod status;

pub use command::{Command, CommandResult, CommandType};
pub use error::PrimitiveError;
pub use inference::{InferenceRequest, InferenceResponse, Priority};
pub use node::{Capabilities, HealthStatus, NodeSnapshot, NodeType};
pub use status::{GpuStatus, LoadedModel, NodeStatus, Resources, ServiceName, ServiceReport, ServiceState};
