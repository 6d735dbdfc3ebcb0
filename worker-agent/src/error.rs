use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {source}")]
    InvalidDuration { field: &'static str, #[source] source: humantime::DurationError },
    #[error("{field} must be positive")]
    MustBePositive { field: &'static str },
    #[error("worker_models must list at least one model")]
    EmptyModelList,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("broker error: {0}")]
    Broker(#[from] fleet_broker::BrokerError),
    #[error("rpc transport error: {0}")]
    Rpc(#[from] tonic::transport::Error),
    #[error("rpc call failed: {0}")]
    RpcStatus(#[from] tonic::Status),
    #[error("command conversion failed: {0}")]
    Convert(#[from] fleet_rpc::convert::ConvertError),
}
