use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {source}")]
    InvalidDuration { field: &'static str, #[source] source: humantime::DurationError },

    #[error("invalid bind address for {field}: {source}")]
    InvalidAddr { field: &'static str, #[source] source: std::net::AddrParseError },

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("unknown routing mode: {0}")]
    UnknownRoutingMode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("cold start timed out waiting for backend to warm up")]
    ColdStartTimeout,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("no healthy backend for routing mode {0}")]
    NoBackend(String),

    #[error("provisioning capability failed: {0}")]
    ProvisionFailed(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::ColdStartTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::NoBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ProvisionFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("invalid ttl: {0}")]
    InvalidTtl(#[from] humantime::DurationError),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminError::InvalidTtl(_) => StatusCode::BAD_REQUEST,
            AdminError::UnknownBackend(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
