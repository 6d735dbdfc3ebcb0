use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PrimitiveError;

/// Validated `0..=10` priority tag. `0` and `5` are the "default exchange"
/// buckets (see `InferenceRequest::routes_via_priority_exchange`); the spec
/// retains this verbatim rather than "fixing" it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub fn new(value: u8) -> Result<Self, PrimitiveError> {
        if value > 10 {
            return Err(PrimitiveError::PriorityOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// §4.2 inference routing rule 2/3: strictly above 5 is "high", strictly
    /// between 0 and 5 is "low". 0 and 5 themselves fall through to the
    /// plain `llm.inference` exchange.
    pub fn bucket(self) -> Option<&'static str> {
        if self.0 > 5 {
            Some("high")
        } else if self.0 > 0 && self.0 < 5 {
            Some("low")
        } else {
            None
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    pub priority: Priority,
    pub reply_to: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl InferenceRequest {
    /// Model-family prefix match per §4.2 rule 1.
    pub fn model_family(&self) -> &'static str {
        const FAMILIES: &[&str] = &["llama3", "mistral", "qwen", "dolphin"];
        for family in FAMILIES {
            if self.model.starts_with(family) {
                return family;
            }
        }
        "default"
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub id: String,
    pub model: String,
    pub response: String,
    pub done: bool,
    pub error: Option<String>,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_zero_and_five_have_no_bucket() {
        assert_eq!(Priority::new(0).unwrap().bucket(), None);
        assert_eq!(Priority::new(5).unwrap().bucket(), None);
    }

    #[test]
    fn priority_above_five_is_high() {
        assert_eq!(Priority::new(8).unwrap().bucket(), Some("high"));
    }

    #[test]
    fn priority_between_zero_and_five_is_low() {
        assert_eq!(Priority::new(3).unwrap().bucket(), Some("low"));
    }

    #[test]
    fn priority_above_ten_is_rejected() {
        assert!(Priority::new(11).is_err());
    }

    #[test]
    fn model_family_prefix_match() {
        let req = InferenceRequest {
            id: "x".into(),
            model: "llama3.2:8b".into(),
            prompt: String::new(),
            stream: false,
            options: HashMap::new(),
            priority: Priority::default(),
            reply_to: "q".into(),
            timestamp: Utc::now(),
            headers: HashMap::new(),
        };
        assert_eq!(req.model_family(), "llama3");
    }

    #[test]
    fn unrecognized_model_family_is_default() {
        let req = InferenceRequest {
            id: "x".into(),
            model: "gpt-oss".into(),
            prompt: String::new(),
            stream: false,
            options: HashMap::new(),
            priority: Priority::default(),
            reply_to: "q".into(),
            timestamp: Utc::now(),
            headers: HashMap::new(),
        };
        assert_eq!(req.model_family(), "default");
    }
}
