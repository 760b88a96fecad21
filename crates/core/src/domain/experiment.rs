use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Assigned,
    Active,
    Completed,
    Abandoned,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "assigned" => Some(Self::Assigned),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Attempts are only recorded against experiments the coachee is still running.
    pub fn accepts_attempts(&self) -> bool {
        matches!(self, Self::Assigned | Self::Active)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Yes,
    Partial,
    No,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::Partial => "partial",
            Self::No => "no",
        }
    }

    /// `yes` and `partial` claim the behavior happened and must cite evidence.
    pub fn claims_attempt(&self) -> bool {
        matches!(self, Self::Yes | Self::Partial)
    }
}

/// A micro-experiment assigned to a coachee from a passed analysis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub coachee_id: String,
    pub title: String,
    pub instruction: String,
    pub success_marker: String,
    pub pattern_id: String,
    pub evidence_span_ids: Vec<String>,
    pub status: ExperimentStatus,
    pub origin_run_id: String,
    #[serde(default)]
    pub baseline_pack_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One detected attempt of an experiment in a later meeting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_record_id: String,
    pub experiment_id: String,
    pub run_id: String,
    pub coachee_id: String,
    pub idempotency_key: String,
    pub attempt: AttemptOutcome,
    #[serde(default, with = "crate::domain::analysis::whole")]
    pub count_attempts: Option<i128>,
    pub evidence_span_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}
