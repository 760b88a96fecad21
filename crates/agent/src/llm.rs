use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::domain::run::TokenUsage;
use serde_json::Value;
use thiserror::Error;

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmRequest {
    pub system_prompt: String,
    /// Taxonomy and house rules sent as the developer message. May be empty.
    pub developer_context: String,
    pub user_payload: String,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LlmResponse {
    pub raw_text: String,
    /// `None` when the text is not JSON. Gate1 reports that case.
    pub parsed_json: Option<Value>,
    pub model_used: String,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn from_text(raw_text: String, model_used: String, usage: TokenUsage) -> Self {
        let parsed_json = serde_json::from_str(&raw_text).ok();
        Self { raw_text, parsed_json, model_used, usage }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm api key is not configured")]
    MissingApiKey,
    #[error("llm endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm call timed out")]
    Timeout,
    #[error("llm connection failed: {0}")]
    Connection(String),
    #[error("invalid llm response: {0}")]
    InvalidResponse(String),
    #[error("llm client setup failed: {0}")]
    Client(String),
    #[error("llm call gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Rate limits, retryable 5xx, timeouts and connection failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => RETRYABLE_STATUS.contains(status),
            Self::Timeout | Self::Connection(_) => true,
            Self::RetriesExhausted { .. } => true,
            Self::MissingApiKey | Self::InvalidResponse(_) | Self::Client(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = error.status() {
            return Self::Status { status: status.as_u16(), body: error.to_string() };
        }
        if error.is_connect() || error.is_request() {
            return Self::Connection(error.to_string());
        }
        if error.is_builder() {
            return Self::Client(error.to_string());
        }
        Self::InvalidResponse(error.to_string())
    }
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}

#[async_trait]
impl<G> LlmGateway for Arc<G>
where
    G: LlmGateway + ?Sized,
{
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).call(request).await
    }
}

#[cfg(test)]
mod tests {
    use huddle_core::domain::run::TokenUsage;

    use super::{LlmError, LlmResponse};

    #[test]
    fn retryable_statuses_match_upstream_policy() {
        for status in [429, 500, 502, 503, 504] {
            assert!(LlmError::Status { status, body: String::new() }.is_retryable(), "{status}");
        }
        for status in [400, 401, 404, 422, 501] {
            assert!(!LlmError::Status { status, body: String::new() }.is_retryable(), "{status}");
        }
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::Connection("reset".to_string()).is_retryable());
        assert!(!LlmError::MissingApiKey.is_retryable());
    }

    #[test]
    fn non_json_text_is_kept_without_parse() {
        let prose = LlmResponse::from_text("Sure! Here is".to_string(), "m".to_string(), TokenUsage::default());
        assert!(prose.parsed_json.is_none());
        assert_eq!(prose.raw_text, "Sure! Here is");

        let json = LlmResponse::from_text("{\"a\":1}".to_string(), "m".to_string(), TokenUsage::default());
        assert_eq!(json.parsed_json, Some(serde_json::json!({"a": 1})));
    }
}
