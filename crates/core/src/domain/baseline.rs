use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::analysis::{AnalysisOutput, EvaluableStatus, EvaluationSummary};

/// Required number of meetings in a baseline pack.
pub const BASELINE_PACK_SIZE: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePackStatus {
    Draft,
    /// Waiting for a worker to claim the build.
    Queued,
    Building,
    Ready,
    Gate1Failed,
    Error,
}

impl BaselinePackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Gate1Failed => "gate1_failed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "queued" => Some(Self::Queued),
            "building" => Some(Self::Building),
            "ready" => Some(Self::Ready),
            "gate1_failed" => Some(Self::Gate1Failed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Consistent,
    Mixed,
}

impl Consistency {
    /// `consistent` when every value matches the first, `mixed` otherwise.
    pub fn of<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut values = values.into_iter();
        let Some(first) = values.next() else {
            return Self::Consistent;
        };
        if values.all(|value| value == first) {
            Self::Consistent
        } else {
            Self::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consistent => "consistent",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselinePack {
    pub baseline_pack_id: String,
    pub coachee_id: String,
    pub target_speaker_name: String,
    pub target_speaker_label: String,
    pub status: BaselinePackStatus,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub active_experiment_id: Option<String>,
    #[serde(default)]
    pub role_consistency: Option<Consistency>,
    #[serde(default)]
    pub meeting_type_consistency: Option<Consistency>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One of the meetings a baseline pack aggregates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaselinePackItem {
    pub baseline_pack_id: String,
    pub sequence: u32,
    pub transcript_id: String,
    pub meeting_id: String,
    pub meeting_type: String,
    pub target_role: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub summary: Option<Value>,
}

/// Compact view of one passed single-meeting analysis, fed to the pack prompt
/// and stored on the pack item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeetingSummary {
    pub meeting_id: Option<String>,
    pub meeting_type: Option<String>,
    pub analysis_id: String,
    pub target_speaker_name: String,
    pub target_speaker_label: String,
    pub target_role: String,
    pub evaluation_summary: EvaluationSummary,
    pub pattern_snapshot: Vec<SlimPattern>,
    pub coaching_output_compact: CompactCoaching,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlimPattern {
    pub pattern_id: String,
    pub evaluable_status: EvaluableStatus,
    #[serde(default, with = "crate::domain::analysis::whole")]
    pub numerator: Option<i128>,
    #[serde(default, with = "crate::domain::analysis::whole")]
    pub denominator: Option<i128>,
    pub ratio: Option<f64>,
    pub balance_assessment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactCoaching {
    pub focus_pattern_id: Option<String>,
    pub micro_experiment_title: Option<String>,
    pub micro_experiment_instruction: Option<String>,
}

impl MeetingSummary {
    pub fn from_output(output: &AnalysisOutput, speaker_name: &str, speaker_label: &str) -> Self {
        let micro = output.micro_experiment();
        Self {
            meeting_id: output.context.meeting_id.clone(),
            meeting_type: output.context.meeting_type.clone(),
            analysis_id: output.meta.analysis_id.clone(),
            target_speaker_name: speaker_name.to_string(),
            target_speaker_label: speaker_label.to_string(),
            target_role: output.context.target_role.clone(),
            evaluation_summary: output.evaluation_summary.clone(),
            pattern_snapshot: output
                .pattern_snapshot
                .iter()
                .map(|item| SlimPattern {
                    pattern_id: item.pattern_id.clone(),
                    evaluable_status: item.evaluable_status,
                    numerator: item.numerator,
                    denominator: item.denominator,
                    ratio: item.ratio,
                    balance_assessment: item.balance_assessment.clone(),
                })
                .collect(),
            coaching_output_compact: CompactCoaching {
                focus_pattern_id: output.focus().map(|focus| focus.pattern_id.clone()),
                micro_experiment_title: micro.map(|micro| micro.title.clone()),
                micro_experiment_instruction: micro.map(|micro| micro.instruction.clone()),
            },
        }
    }
}
