use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub analysis: AnalysisConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub max_tokens: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Upper bound on outstanding model calls per worker process.
    pub max_concurrency: usize,
}

/// Backoff constants shared by the LLM gateway and the record store.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub single_meeting_max_retries: u32,
    pub baseline_pack_max_retries: u32,
    pub single_meeting_retry_delay_secs: u64,
    pub baseline_pack_retry_delay_secs: u64,
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    pub error_message_limit: usize,
}

#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub config_version: String,
    pub contract_path: PathBuf,
    pub system_prompt_path: PathBuf,
    pub developer_message_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub contract_path: Option<PathBuf>,
    pub worker_concurrency: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://huddle.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                model: "gpt-4o".to_string(),
                max_tokens: 8192,
                connect_timeout_secs: 10,
                read_timeout_secs: 90,
                max_concurrency: 3,
            },
            retry: RetryConfig { attempts: 4, base_delay_ms: 1_000, max_delay_ms: 30_000 },
            worker: WorkerConfig {
                single_meeting_max_retries: 3,
                baseline_pack_max_retries: 2,
                single_meeting_retry_delay_secs: 15,
                baseline_pack_retry_delay_secs: 30,
                concurrency: 2,
                poll_interval_secs: 5,
                error_message_limit: 2_000,
            },
            analysis: AnalysisConfig {
                config_version: "1".to_string(),
                contract_path: PathBuf::from("schemas/contract.toml"),
                system_prompt_path: PathBuf::from("prompts/system_prompt.txt"),
                developer_message_path: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("huddle.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// True when a non-blank API key is configured.
    pub fn has_llm_api_key(&self) -> bool {
        self.llm.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty())
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
            if let Some(connect_timeout_secs) = llm.connect_timeout_secs {
                self.llm.connect_timeout_secs = connect_timeout_secs;
            }
            if let Some(read_timeout_secs) = llm.read_timeout_secs {
                self.llm.read_timeout_secs = read_timeout_secs;
            }
            if let Some(max_concurrency) = llm.max_concurrency {
                self.llm.max_concurrency = max_concurrency;
            }
        }

        if let Some(retry) = patch.retry {
            if let Some(attempts) = retry.attempts {
                self.retry.attempts = attempts;
            }
            if let Some(base_delay_ms) = retry.base_delay_ms {
                self.retry.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = retry.max_delay_ms {
                self.retry.max_delay_ms = max_delay_ms;
            }
        }

        if let Some(worker) = patch.worker {
            if let Some(value) = worker.single_meeting_max_retries {
                self.worker.single_meeting_max_retries = value;
            }
            if let Some(value) = worker.baseline_pack_max_retries {
                self.worker.baseline_pack_max_retries = value;
            }
            if let Some(value) = worker.single_meeting_retry_delay_secs {
                self.worker.single_meeting_retry_delay_secs = value;
            }
            if let Some(value) = worker.baseline_pack_retry_delay_secs {
                self.worker.baseline_pack_retry_delay_secs = value;
            }
            if let Some(concurrency) = worker.concurrency {
                self.worker.concurrency = concurrency;
            }
            if let Some(poll_interval_secs) = worker.poll_interval_secs {
                self.worker.poll_interval_secs = poll_interval_secs;
            }
            if let Some(error_message_limit) = worker.error_message_limit {
                self.worker.error_message_limit = error_message_limit;
            }
        }

        if let Some(analysis) = patch.analysis {
            if let Some(config_version) = analysis.config_version {
                self.analysis.config_version = config_version;
            }
            if let Some(contract_path) = analysis.contract_path {
                self.analysis.contract_path = contract_path;
            }
            if let Some(system_prompt_path) = analysis.system_prompt_path {
                self.analysis.system_prompt_path = system_prompt_path;
            }
            if let Some(developer_message_path) = analysis.developer_message_path {
                self.analysis.developer_message_path = Some(developer_message_path);
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("HUDDLE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("HUDDLE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("HUDDLE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("HUDDLE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("HUDDLE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("HUDDLE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("HUDDLE_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("HUDDLE_LLM_MAX_TOKENS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_LLM_CONNECT_TIMEOUT_SECS") {
            self.llm.connect_timeout_secs = parse_u64("HUDDLE_LLM_CONNECT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_LLM_READ_TIMEOUT_SECS") {
            self.llm.read_timeout_secs = parse_u64("HUDDLE_LLM_READ_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_LLM_MAX_CONCURRENCY") {
            self.llm.max_concurrency = parse_usize("HUDDLE_LLM_MAX_CONCURRENCY", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_RETRY_ATTEMPTS") {
            self.retry.attempts = parse_u32("HUDDLE_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_u64("HUDDLE_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_u64("HUDDLE_RETRY_MAX_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_usize("HUDDLE_WORKER_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("HUDDLE_WORKER_POLL_INTERVAL_SECS") {
            self.worker.poll_interval_secs = parse_u64("HUDDLE_WORKER_POLL_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("HUDDLE_ANALYSIS_CONFIG_VERSION") {
            self.analysis.config_version = value;
        }
        if let Some(value) = read_env("HUDDLE_ANALYSIS_CONTRACT_PATH") {
            self.analysis.contract_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("HUDDLE_ANALYSIS_SYSTEM_PROMPT_PATH") {
            self.analysis.system_prompt_path = PathBuf::from(value);
        }

        let log_level = read_env("HUDDLE_LOGGING_LEVEL").or_else(|| read_env("HUDDLE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("HUDDLE_LOGGING_FORMAT").or_else(|| read_env("HUDDLE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(contract_path) = overrides.contract_path {
            self.analysis.contract_path = contract_path;
        }
        if let Some(concurrency) = overrides.worker_concurrency {
            self.worker.concurrency = concurrency;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_retry(&self.retry)?;
        validate_worker(&self.worker)?;
        validate_analysis(&self.analysis)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("huddle.toml"), PathBuf::from("config/huddle.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if !llm.base_url.starts_with("http://") && !llm.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    for (name, value) in [
        ("llm.connect_timeout_secs", llm.connect_timeout_secs),
        ("llm.read_timeout_secs", llm.read_timeout_secs),
    ] {
        if value == 0 || value > 300 {
            return Err(ConfigError::Validation(format!("{name} must be in range 1..=300")));
        }
    }

    if llm.max_concurrency == 0 {
        return Err(ConfigError::Validation(
            "llm.max_concurrency must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry(retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.attempts == 0 {
        return Err(ConfigError::Validation(
            "retry.attempts must be greater than zero".to_string(),
        ));
    }

    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
            retry.base_delay_ms, retry.max_delay_ms
        )));
    }

    Ok(())
}

fn validate_worker(worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.concurrency == 0 {
        return Err(ConfigError::Validation(
            "worker.concurrency must be greater than zero".to_string(),
        ));
    }

    if worker.poll_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "worker.poll_interval_secs must be greater than zero".to_string(),
        ));
    }

    if worker.error_message_limit == 0 {
        return Err(ConfigError::Validation(
            "worker.error_message_limit must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_analysis(analysis: &AnalysisConfig) -> Result<(), ConfigError> {
    if analysis.config_version.trim().is_empty() {
        return Err(ConfigError::Validation(
            "analysis.config_version must not be empty; it is part of every run idempotency key"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    retry: Option<RetryPatch>,
    worker: Option<WorkerPatch>,
    analysis: Option<AnalysisPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    max_concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryPatch {
    attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    single_meeting_max_retries: Option<u32>,
    baseline_pack_max_retries: Option<u32>,
    single_meeting_retry_delay_secs: Option<u64>,
    baseline_pack_retry_delay_secs: Option<u64>,
    concurrency: Option<usize>,
    poll_interval_secs: Option<u64>,
    error_message_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AnalysisPatch {
    config_version: Option<String>,
    contract_path: Option<PathBuf>,
    system_prompt_path: Option<PathBuf>,
    developer_message_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::path::PathBuf;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_pipeline_constants() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.model == "gpt-4o", "default model should be gpt-4o")?;
        ensure(config.llm.max_tokens == 8192, "default max tokens should be 8192")?;
        ensure(config.llm.max_concurrency == 3, "default llm concurrency should be 3")?;
        ensure(config.retry.attempts == 4, "default retry attempts should be 4")?;
        ensure(config.worker.single_meeting_max_retries == 3, "single meeting retries")?;
        ensure(config.worker.baseline_pack_max_retries == 2, "baseline pack retries")?;
        ensure(config.analysis.config_version == "1", "default config version should be 1")?;
        ensure(
            config.analysis.contract_path == PathBuf::from("schemas/contract.toml"),
            "default contract path",
        )?;
        ensure(!config.has_llm_api_key(), "no api key by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_HUDDLE_API_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("huddle.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "${TEST_HUDDLE_API_KEY}"
model = "gpt-4o-mini"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            ensure(config.llm.model == "gpt-4o-mini", "model should be read from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_HUDDLE_API_KEY"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("huddle.toml");
        fs::write(&path, "[llm]\napi_key = \"${HUDDLE_TEST_UNSET_VARIABLE}\"\n")
            .map_err(|err| err.to_string())?;

        match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Err(ConfigError::MissingEnvInterpolation { var }) => {
                ensure(var == "HUDDLE_TEST_UNSET_VARIABLE", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected interpolation failure".to_string()),
        }
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_LOG_LEVEL", "warn");
        env::set_var("HUDDLE_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["HUDDLE_LOG_LEVEL", "HUDDLE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("HUDDLE_RETRY_ATTEMPTS", "6");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("huddle.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[retry]
attempts = 2
max_delay_ms = 5000

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.retry.attempts == 6, "env retry attempts should win over file")?;
            ensure(config.retry.max_delay_ms == 5000, "file value should win over default")?;
            Ok(())
        })();

        clear_vars(&["HUDDLE_DATABASE_URL", "HUDDLE_RETRY_ATTEMPTS"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_LLM_MAX_CONCURRENCY", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "HUDDLE_LLM_MAX_CONCURRENCY", "error should name the env key")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected env override failure".to_string()),
        };

        clear_vars(&["HUDDLE_LLM_MAX_CONCURRENCY"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_RETRY_BASE_DELAY_MS", "60000");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("retry.base_delay_ms")
            );
            ensure(has_message, "validation failure should mention retry.base_delay_ms")
        })();

        clear_vars(&["HUDDLE_RETRY_BASE_DELAY_MS"]);
        result
    }

    #[test]
    fn require_file_reports_missing_path() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("absent.toml");
        let outcome = AppConfig::load(LoadOptions {
            config_path: Some(path.clone()),
            require_file: true,
            ..LoadOptions::default()
        });

        ensure(
            matches!(outcome, Err(ConfigError::MissingConfigFile(ref missing)) if *missing == path),
            "missing required file should be reported with its path",
        )
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("HUDDLE_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(config.has_llm_api_key(), "api key should be present")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["HUDDLE_LLM_API_KEY"]);
        result
    }
}
