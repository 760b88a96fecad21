use std::time::{Duration, Instant};

use async_trait::async_trait;
use huddle_core::config::LlmConfig;
use huddle_core::domain::run::TokenUsage;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::llm::{LlmError, LlmGateway, LlmRequest, LlmResponse};

const ERROR_BODY_LIMIT: usize = 512;

/// Chat-completions client for OpenAI-compatible endpoints. One attempt per
/// call; wrap it in [`crate::GuardedGateway`] for retries.
pub struct OpenAiGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl OpenAiGateway {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .as_ref()
            .map(|key| key.expose_secret().trim())
            .filter(|key| !key.is_empty())
            .map(|key| SecretString::from(key.to_string()))
            .ok_or(LlmError::MissingApiKey)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|error| LlmError::Client(error.to_string()))?;

        Ok(Self { client, endpoint: completions_url(&config.base_url), api_key })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&ChatRequest::from_request(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body: truncate(&body) });
        }

        let completion: ChatCompletion = response.json().await?;
        let result = completion.into_response(&request.model)?;

        tracing::info!(
            event_name = "llm.call.completed",
            model = %result.model_used,
            input_tokens = result.usage.input_tokens,
            output_tokens = result.usage.output_tokens,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            json = result.parsed_json.is_some(),
            "llm call completed"
        );
        Ok(result)
    }
}

fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

fn truncate(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> ChatRequest<'a> {
    fn from_request(request: &'a LlmRequest) -> Self {
        let mut messages = vec![ChatMessage { role: "system", content: &request.system_prompt }];
        if !request.developer_context.trim().is_empty() {
            messages.push(ChatMessage { role: "developer", content: &request.developer_context });
        }
        messages.push(ChatMessage { role: "user", content: &request.user_payload });

        Self {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl ChatCompletion {
    fn into_response(self, requested_model: &str) -> Result<LlmResponse, LlmError> {
        let Some(choice) = self.choices.into_iter().next() else {
            return Err(LlmError::InvalidResponse("completion has no choices".to_string()));
        };
        let usage = self
            .usage
            .map(|usage| TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            })
            .unwrap_or_default();
        let model = self.model.unwrap_or_else(|| requested_model.to_string());

        Ok(LlmResponse::from_text(choice.message.content.unwrap_or_default(), model, usage))
    }
}
