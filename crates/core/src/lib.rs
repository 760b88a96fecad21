pub mod config;
pub mod domain;
pub mod errors;
pub mod gate1;
pub mod idempotency;
pub mod prompt;
pub mod retry;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::analysis::{AnalysisOutput, PatternScore, RunDigest, ScoreFault};
pub use domain::baseline::{BaselinePack, BaselinePackItem, BaselinePackStatus, MeetingSummary};
pub use domain::experiment::{AttemptOutcome, Experiment, ExperimentEvent, ExperimentStatus};
pub use domain::run::{AnalysisType, Run, RunRequest, RunRequestStatus, StageFlags, TokenUsage};
pub use domain::transcript::{Transcript, Turn};
pub use errors::DomainError;
pub use gate1::{
    Gate1Outcome, Gate1Result, Gate1Validator, IssueCode, SchemaRegistry, Severity,
    ValidationIssue,
};
pub use idempotency::{
    make_baseline_pack_key, make_experiment_event_key, make_run_key, IdempotencyKey, RunKeyInput,
};
pub use retry::{RetryError, RetryPolicy};
