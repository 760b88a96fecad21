use std::path::{Path, PathBuf};

use huddle_core::config::{AnalysisConfig, LlmConfig};
use huddle_core::domain::coachee::PromptConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("could not read prompt file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("prompt file `{path}` is empty")]
    Empty { path: PathBuf },
}

/// Everything a model call needs besides the user payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptSet {
    pub config_version: String,
    pub system_prompt: String,
    /// Sent as the developer message; blank means none.
    pub developer_message: String,
    pub model: String,
    pub max_tokens: u32,
}

impl PromptSet {
    pub fn load(analysis: &AnalysisConfig, llm: &LlmConfig) -> Result<Self, PromptError> {
        let system_prompt = read_prompt(&analysis.system_prompt_path)?;
        let developer_message = match &analysis.developer_message_path {
            Some(path) => read_prompt(path)?,
            None => String::new(),
        };

        Ok(Self {
            config_version: analysis.config_version.clone(),
            system_prompt,
            developer_message,
            model: llm.model.clone(),
            max_tokens: llm.max_tokens,
        })
    }

    /// Layers a stored prompt config over the file-based defaults. Blank
    /// stored prompts keep the defaults.
    pub fn with_override(&self, stored: &PromptConfig) -> Self {
        let pick = |stored: &Option<String>, fallback: &str| {
            stored
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map_or_else(|| fallback.to_string(), str::to_string)
        };

        Self {
            config_version: stored.config_version.clone(),
            system_prompt: pick(&stored.system_prompt, &self.system_prompt),
            developer_message: pick(&stored.developer_message, &self.developer_message),
            model: pick(&stored.model, &self.model),
            max_tokens: stored.max_tokens.filter(|tokens| *tokens > 0).unwrap_or(self.max_tokens),
        }
    }
}

fn read_prompt(path: &Path) -> Result<String, PromptError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| PromptError::Read { path: path.to_path_buf(), source })?;
    if text.trim().is_empty() {
        return Err(PromptError::Empty { path: path.to_path_buf() });
    }
    Ok(text)
}
