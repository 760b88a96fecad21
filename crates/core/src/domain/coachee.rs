use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub active_baseline_pack_id: Option<String>,
    /// Denormalized pointer to the coachee's running experiment record.
    #[serde(default)]
    pub active_experiment_id: Option<String>,
}

/// A versioned prompt bundle stored alongside the records. The active entry,
/// when present, replaces the prompt files named in the process config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptConfig {
    pub config_version: String,
    pub schema_version: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub developer_message: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub active: bool,
}
