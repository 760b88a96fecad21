use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::analysis::RunDigest;
use crate::errors::DomainError;
use crate::gate1::ValidationIssue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    SingleMeeting,
    BaselinePack,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleMeeting => "single_meeting",
            Self::BaselinePack => "baseline_pack",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single_meeting" => Some(Self::SingleMeeting),
            "baseline_pack" => Some(Self::BaselinePack),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRequestStatus {
    Queued,
    Running,
    Completed,
    Gate1Failed,
    Error,
}

impl RunRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Gate1Failed => "gate1_failed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "gate1_failed" => Some(Self::Gate1Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Gate1Failed | Self::Error)
    }

    /// Terminal status for a processed output: a trusted verdict completes the
    /// request, anything else is a gate failure rather than an infrastructure error.
    pub fn from_verdict(passed: bool) -> Self {
        if passed {
            Self::Completed
        } else {
            Self::Gate1Failed
        }
    }
}

/// A coachee's request to analyze one transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub transcript_id: String,
    pub coachee_id: String,
    pub analysis_type: AnalysisType,
    pub target_speaker_name: String,
    pub target_speaker_label: String,
    pub target_role: String,
    pub status: RunRequestStatus,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRequest {
    pub fn can_transition_to(&self, next: RunRequestStatus) -> bool {
        use RunRequestStatus::{Completed, Error, Gate1Failed, Queued, Running};
        matches!(
            (self.status, next),
            (Queued, Running)
                | (Running, Completed)
                | (Running, Gate1Failed)
                | (Queued, Completed)
                | (Queued, Gate1Failed)
                | (Running, Running)
                | (Error, Queued)
                | (Error, Running)
                | (_, Error)
        )
    }

    pub fn transition_to(&mut self, next: RunRequestStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.status = next;
            return Ok(());
        }

        Err(DomainError::InvalidStatusTransition { from: self.status, to: next })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Per-stage results of a validation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    pub parse_ok: bool,
    pub schema_ok: bool,
    pub business_ok: bool,
}

/// One model call, its output and the validator verdict. Persisted whether or
/// not the output passed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub analysis_type: AnalysisType,
    pub idempotency_key: String,
    pub coachee_id: String,
    #[serde(default)]
    pub run_request_id: Option<String>,
    #[serde(default)]
    pub transcript_id: Option<String>,
    #[serde(default)]
    pub baseline_pack_id: Option<String>,
    pub target_speaker_label: String,
    pub target_role: String,
    pub config_version: String,
    pub model: String,
    pub usage: TokenUsage,
    pub request_payload: String,
    pub raw_output: String,
    #[serde(default)]
    pub parsed_output: Option<Value>,
    pub stages: StageFlags,
    pub gate1_passed: bool,
    pub issue_count: usize,
    /// The verdict's issues, written with the run so they survive a failed
    /// `validation_issues` write.
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    #[serde(default)]
    pub attempt_event_created: bool,
    #[serde(default)]
    pub experiment_instantiated: bool,
    #[serde(flatten)]
    pub digest: RunDigest,
    pub created_at: DateTime<Utc>,
}
