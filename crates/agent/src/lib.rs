//! LLM gateway for the analysis pipeline.
//!
//! The model is treated as an untrusted generator: the gateway returns raw
//! text and token usage, and acceptance is decided downstream by Gate1.
//!
//! - [`llm`] defines the [`LlmGateway`] seam and its request/response types.
//! - [`openai`] talks to an OpenAI-compatible chat-completions endpoint.
//! - [`guarded`] caps concurrent calls and retries transient failures.
//! - [`scripted`] replays canned responses for tests and dry runs.

pub mod guarded;
pub mod llm;
pub mod openai;
pub mod scripted;

pub use guarded::GuardedGateway;
pub use llm::{LlmError, LlmGateway, LlmRequest, LlmResponse};
pub use openai::OpenAiGateway;
pub use scripted::ScriptedGateway;
