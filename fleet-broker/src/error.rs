#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(#[from] lapin::Error),

    #[error("message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publish cancelled before confirmation")]
    PublishCancelled,

    #[error("no broker connection configured")]
    NotConfigured,
}
