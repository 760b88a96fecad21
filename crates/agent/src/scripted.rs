use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use huddle_core::domain::run::TokenUsage;

use crate::llm::{LlmError, LlmGateway, LlmRequest, LlmResponse};

const SCRIPTED_MODEL: &str = "scripted";

/// Replays queued outcomes in order and records every request it receives.
/// Once the queue is empty the fallback text, if any, is returned forever.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<LlmRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every call with `raw_text`.
    pub fn always(raw_text: impl Into<String>) -> Self {
        Self { fallback: Some(raw_text.into()), ..Self::default() }
    }

    pub fn then_text(self, raw_text: impl Into<String>) -> Self {
        self.push(Ok(raw_text.into()));
        self
    }

    pub fn then_error(self, error: LlmError) -> Self {
        self.push(Err(error));
        self
    }

    fn push(&self, outcome: Result<String, LlmError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    pub fn calls(&self) -> Vec<LlmRequest> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        let text = match next {
            Some(outcome) => outcome?,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string()))?,
        };

        let usage = TokenUsage {
            input_tokens: u64::try_from(request.user_payload.len()).unwrap_or(u64::MAX),
            output_tokens: u64::try_from(text.len()).unwrap_or(u64::MAX),
        };
        Ok(LlmResponse::from_text(text, SCRIPTED_MODEL.to_string(), usage))
    }
}
