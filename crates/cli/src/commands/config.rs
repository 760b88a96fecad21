use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use huddle_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// One reported setting: dotted key, rendered value, and the env var that
/// can override it.
struct Entry {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

fn entry(key: &'static str, value: impl ToString, env_key: &'static str) -> Entry {
    Entry { key, value: value.to_string(), env_key }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = file_path.as_deref().and_then(load_config_file_doc);

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries(&config) {
        let source = field_source(entry.key, entry.env_key, file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", entry.key, entry.value));
    }
    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<Entry> {
    let api_key = if config.has_llm_api_key() { "<redacted>" } else { "<unset>" };
    let developer_message = config
        .analysis
        .developer_message_path
        .as_ref()
        .map_or_else(|| "<unset>".to_string(), |path| path.display().to_string());

    vec![
        entry("database.url", &config.database.url, "HUDDLE_DATABASE_URL"),
        entry("database.max_connections", config.database.max_connections, "HUDDLE_DATABASE_MAX_CONNECTIONS"),
        entry("database.timeout_secs", config.database.timeout_secs, "HUDDLE_DATABASE_TIMEOUT_SECS"),
        entry("llm.base_url", &config.llm.base_url, "HUDDLE_LLM_BASE_URL"),
        entry("llm.api_key", api_key, "HUDDLE_LLM_API_KEY"),
        entry("llm.model", &config.llm.model, "HUDDLE_LLM_MODEL"),
        entry("llm.max_tokens", config.llm.max_tokens, "HUDDLE_LLM_MAX_TOKENS"),
        entry("llm.connect_timeout_secs", config.llm.connect_timeout_secs, "HUDDLE_LLM_CONNECT_TIMEOUT_SECS"),
        entry("llm.read_timeout_secs", config.llm.read_timeout_secs, "HUDDLE_LLM_READ_TIMEOUT_SECS"),
        entry("llm.max_concurrency", config.llm.max_concurrency, "HUDDLE_LLM_MAX_CONCURRENCY"),
        entry("retry.attempts", config.retry.attempts, "HUDDLE_RETRY_ATTEMPTS"),
        entry("retry.base_delay_ms", config.retry.base_delay_ms, "HUDDLE_RETRY_BASE_DELAY_MS"),
        entry("retry.max_delay_ms", config.retry.max_delay_ms, "HUDDLE_RETRY_MAX_DELAY_MS"),
        entry("worker.concurrency", config.worker.concurrency, "HUDDLE_WORKER_CONCURRENCY"),
        entry("worker.poll_interval_secs", config.worker.poll_interval_secs, "HUDDLE_WORKER_POLL_INTERVAL_SECS"),
        entry("analysis.config_version", &config.analysis.config_version, "HUDDLE_ANALYSIS_CONFIG_VERSION"),
        entry("analysis.contract_path", config.analysis.contract_path.display(), "HUDDLE_ANALYSIS_CONTRACT_PATH"),
        entry(
            "analysis.system_prompt_path",
            config.analysis.system_prompt_path.display(),
            "HUDDLE_ANALYSIS_SYSTEM_PROMPT_PATH",
        ),
        entry("analysis.developer_message_path", developer_message, ""),
        entry("logging.level", &config.logging.level, "HUDDLE_LOGGING_LEVEL"),
        entry("logging.format", config.logging.format.as_str(), "HUDDLE_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("huddle.toml"), PathBuf::from("config/huddle.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: &Path) -> Option<Value> {
    fs::read_to_string(path).ok()?.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    file_doc: Option<&Value>,
    file_path: Option<&Path>,
) -> String {
    if !env_key.is_empty() && env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file = file_path.map_or_else(|| "config file".to_string(), |path| path.display().to_string());
        return format!("file ({file})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    key_path
        .split('.')
        .try_fold(root, |current, key| current.get(key))
        .is_some()
}
