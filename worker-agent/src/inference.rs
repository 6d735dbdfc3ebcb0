//! Local inference engine bridge used when a broker-routed request lands on
//! this node (§4.5): forwards the prompt to the configured engine and
//! collects its non-streaming response.

use std::time::Duration;

use fleet_primitives::InferenceRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference engine unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("inference engine returned an error: {0}")]
    Upstream(String),
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

pub async fn generate(client: &reqwest::Client, base_url: &str, request: &InferenceRequest) -> Result<String, InferenceError> {
    let options = request.options.clone().into_iter().collect();
    let body = GenerateRequest { model: &request.model, prompt: &request.prompt, stream: false, options };

    let resp = client.post(format!("{base_url}/api/generate")).json(&body).timeout(GENERATE_TIMEOUT).send().await?;
    let parsed: GenerateResponse = resp.json().await?;

    if let Some(error) = parsed.error {
        return Err(InferenceError::Upstream(error));
    }
    Ok(parsed.response)
}
