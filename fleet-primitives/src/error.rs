#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("priority {0} out of range [0, 10]")]
    PriorityOutOfRange(u8),

    #[error("unknown command type: {0}")]
    UnknownCommandType(String),
}
