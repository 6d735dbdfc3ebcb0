use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PrimitiveError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Shutdown,
    Reboot,
    Drain,
    PullModel,
    UnloadModel,
    Exec,
    RestartService,
    Status,
}

impl std::str::FromStr for CommandType {
    type Err = PrimitiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shutdown" => Ok(CommandType::Shutdown),
            "reboot" => Ok(CommandType::Reboot),
            "drain" => Ok(CommandType::Drain),
            "pull_model" => Ok(CommandType::PullModel),
            "unload_model" => Ok(CommandType::UnloadModel),
            "exec" => Ok(CommandType::Exec),
            "restart_service" => Ok(CommandType::RestartService),
            "status" => Ok(CommandType::Status),
            other => Err(PrimitiveError::UnknownCommandType(other.to_string())),
        }
    }
}

/// A work unit sent to a node, over either the RPC stream or (best-effort)
/// the broker's `agents.commands` topic exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub args: HashMap<String, String>,
    pub timeout_seconds: u64,
}

impl Command {
    pub fn new(kind: CommandType, args: HashMap<String, String>, timeout_seconds: u64) -> Self {
        Self { command_id: Uuid::new_v4(), kind, args, timeout_seconds }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn failure(command_id: Uuid, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            command_id,
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}
