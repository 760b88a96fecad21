//! Typed view of a model's analysis document.
//!
//! A document is only decoded into these types after it passed the JSON
//! schema, so structural problems never reach this layer. What remains are
//! the cross-field rules, which surface as [`ScoreFault`]s when a snapshot
//! item is classified into a [`PatternScore`].
//!
//! The types accept everything the schema accepts. Integer fields go through
//! [`whole`], so `2.0`, negative counts and values past the 64-bit range all
//! decode and are left for the business rules to judge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::experiment::AttemptOutcome;
use crate::domain::run::AnalysisType;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub schema_version: String,
    pub meta: AnalysisMeta,
    pub context: AnalysisContext,
    pub evaluation_summary: EvaluationSummary,
    pub pattern_snapshot: Vec<PatternSnapshotItem>,
    pub coaching_output: CoachingOutput,
    pub experiment_tracking: ExperimentTracking,
    pub evidence_spans: Vec<EvidenceSpan>,
}

impl AnalysisOutput {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    pub fn focus(&self) -> Option<&CoachingItem> {
        self.coaching_output.focus.first()
    }

    pub fn micro_experiment(&self) -> Option<&MicroExperiment> {
        self.coaching_output.micro_experiment.first()
    }

    pub fn detection(&self) -> Option<&Detection> {
        self.experiment_tracking.detection_in_this_meeting.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisMeta {
    pub analysis_id: String,
    pub analysis_type: AnalysisType,
    pub generated_at: String,
    pub taxonomy_version: String,
    #[serde(default)]
    pub output_mode: Option<String>,
    #[serde(default)]
    pub schema_hash: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisContext {
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub meeting_type: Option<String>,
    #[serde(default)]
    pub meeting_date: Option<String>,
    pub target_role: String,
    #[serde(default)]
    pub target_speaker_name: Option<String>,
    #[serde(default)]
    pub target_speaker_label: Option<String>,
    #[serde(default)]
    pub baseline_pack_id: Option<String>,
    #[serde(default, with = "whole")]
    pub pack_size: Option<i128>,
    #[serde(default)]
    pub meetings: Vec<MeetingRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRef {
    pub meeting_id: String,
    #[serde(default)]
    pub meeting_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub patterns_evaluated: Vec<String>,
    pub patterns_insufficient_signal: Vec<String>,
    pub patterns_not_evaluable: Vec<String>,
}

impl EvaluationSummary {
    /// All reported ids in array order, duplicates preserved.
    pub fn all_reported(&self) -> impl Iterator<Item = &str> {
        self.patterns_evaluated
            .iter()
            .chain(&self.patterns_insufficient_signal)
            .chain(&self.patterns_not_evaluable)
            .map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluableStatus {
    Evaluable,
    InsufficientSignal,
    NotEvaluable,
}

impl EvaluableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluable => "evaluable",
            Self::InsufficientSignal => "insufficient_signal",
            Self::NotEvaluable => "not_evaluable",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternSnapshotItem {
    pub pattern_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub tier: Option<i128>,
    pub evaluable_status: EvaluableStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denominator_rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub min_required_threshold: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub opportunity_count: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub numerator: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub denominator: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_assessment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub evidence_span_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_events: Option<Vec<OpportunityEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub opportunity_events_considered: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub opportunity_events_counted: Option<i128>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountDecision {
    Counted,
    Excluded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSuccess {
    Yes,
    No,
    Partial,
    Na,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub turn_id: Option<i128>,
    pub count_decision: CountDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<EventSuccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OpportunityEvent {
    fn is_counted(&self) -> bool {
        self.count_decision == CountDecision::Counted
    }

    fn is_counted_success(&self) -> bool {
        self.is_counted() && self.success == Some(EventSuccess::Yes)
    }
}

/// Reconciled two-layer scoring trace of a numeric pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScoringTrace {
    pub considered: usize,
    pub counted: usize,
    pub successes: usize,
}

/// A snapshot item that passed classification. Each variant carries only the
/// fields that are legal for its evaluable status.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternScore {
    Numeric { numerator: Option<u64>, denominator: u64, ratio: Option<f64>, trace: Option<ScoringTrace> },
    Balance { assessment: String },
    InsufficientSignal,
    NotEvaluable,
}

/// A reason a snapshot item cannot be represented as a [`PatternScore`].
#[derive(Clone, Debug, PartialEq)]
pub enum ScoreFault {
    BalanceMissingAssessment,
    BalanceForbiddenField(&'static str),
    InvalidDenominator(Option<i128>),
    InvalidNumerator(i128),
    NumeratorExceedsDenominator { numerator: i128, denominator: i128 },
    RatioOutOfRange(f64),
    NonEvaluableHasNumeric { status: EvaluableStatus, field: &'static str },
    OpportunityEventsForbidden,
    ConsideredMismatch { declared: Option<i128>, actual: usize },
    CountedMismatch { declared: Option<i128>, actual: usize },
    DenominatorCountedMismatch { denominator: i128, counted: i128 },
    NumeratorSuccessMismatch { numerator: i128, successes: usize },
}

impl PatternSnapshotItem {
    fn numeric_fields(&self) -> [(&'static str, bool); 3] {
        [
            ("numerator", self.numerator.is_some()),
            ("denominator", self.denominator.is_some()),
            ("ratio", self.ratio.is_some()),
        ]
    }

    /// Classify the item, collecting every fault rather than stopping at the first.
    pub fn score(&self, is_balance: bool) -> Result<PatternScore, Vec<ScoreFault>> {
        let mut faults = Vec::new();

        let score = match self.evaluable_status {
            EvaluableStatus::Evaluable if is_balance => {
                let assessment = self
                    .balance_assessment
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty());
                if assessment.is_none() {
                    faults.push(ScoreFault::BalanceMissingAssessment);
                }
                for (field, present) in self.numeric_fields() {
                    if present {
                        faults.push(ScoreFault::BalanceForbiddenField(field));
                    }
                }
                if self.opportunity_events.is_some() {
                    faults.push(ScoreFault::OpportunityEventsForbidden);
                }
                assessment.map(|assessment| PatternScore::Balance {
                    assessment: assessment.to_string(),
                })
            }
            EvaluableStatus::Evaluable => self.score_numeric(&mut faults),
            status @ (EvaluableStatus::InsufficientSignal | EvaluableStatus::NotEvaluable) => {
                for (field, present) in self.numeric_fields() {
                    if present {
                        faults.push(ScoreFault::NonEvaluableHasNumeric { status, field });
                    }
                }
                if self.opportunity_events.is_some() {
                    faults.push(ScoreFault::OpportunityEventsForbidden);
                }
                Some(match status {
                    EvaluableStatus::InsufficientSignal => PatternScore::InsufficientSignal,
                    _ => PatternScore::NotEvaluable,
                })
            }
        };

        match score {
            Some(score) if faults.is_empty() => Ok(score),
            _ => Err(faults),
        }
    }

    fn score_numeric(&self, faults: &mut Vec<ScoreFault>) -> Option<PatternScore> {
        let denominator = match self.denominator {
            Some(denominator) if denominator >= 1 => Some(denominator),
            other => {
                faults.push(ScoreFault::InvalidDenominator(other));
                None
            }
        };

        if let (Some(denominator), Some(numerator)) = (denominator, self.numerator) {
            if numerator < 0 {
                faults.push(ScoreFault::InvalidNumerator(numerator));
            }
            if numerator > denominator {
                faults.push(ScoreFault::NumeratorExceedsDenominator { numerator, denominator });
            }
        }

        if let Some(ratio) = self.ratio {
            if !(0.0..=1.0).contains(&ratio) {
                faults.push(ScoreFault::RatioOutOfRange(ratio));
            }
        }

        let trace = self.opportunity_events.as_deref().map(|events| self.reconcile(events, faults));

        let denominator = u64::try_from(denominator?).ok()?;
        let numerator = match self.numerator {
            Some(value) => Some(u64::try_from(value).ok()?),
            None => None,
        };
        Some(PatternScore::Numeric { numerator, denominator, ratio: self.ratio, trace })
    }

    fn reconcile(&self, events: &[OpportunityEvent], faults: &mut Vec<ScoreFault>) -> ScoringTrace {
        let considered = events.len();
        let counted = events.iter().filter(|event| event.is_counted()).count();
        let successes = events.iter().filter(|event| event.is_counted_success()).count();

        if self.opportunity_events_considered != i128::try_from(considered).ok() {
            faults.push(ScoreFault::ConsideredMismatch {
                declared: self.opportunity_events_considered,
                actual: considered,
            });
        }
        if self.opportunity_events_counted != i128::try_from(counted).ok() {
            faults.push(ScoreFault::CountedMismatch {
                declared: self.opportunity_events_counted,
                actual: counted,
            });
        }
        if let (Some(denominator), Some(declared_counted)) =
            (self.denominator, self.opportunity_events_counted)
        {
            if denominator != declared_counted {
                faults.push(ScoreFault::DenominatorCountedMismatch {
                    denominator,
                    counted: declared_counted,
                });
            }
        }
        if let Some(numerator) = self.numerator {
            if i128::try_from(successes).ok() != Some(numerator) {
                faults.push(ScoreFault::NumeratorSuccessMismatch { numerator, successes });
            }
        }

        ScoringTrace { considered, counted, successes }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachingOutput {
    pub strengths: Vec<CoachingItem>,
    pub focus: Vec<CoachingItem>,
    pub micro_experiment: Vec<MicroExperiment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachingItem {
    pub pattern_id: String,
    pub message: String,
    pub evidence_span_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroExperiment {
    pub experiment_id: String,
    pub title: String,
    pub instruction: String,
    pub success_marker: String,
    pub pattern_id: String,
    pub evidence_span_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedStatus {
    #[serde(rename = "none")]
    Unassigned,
    Assigned,
    Active,
    Completed,
    Abandoned,
}

impl TrackedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "none",
            Self::Assigned => "assigned",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Assigned and active experiments expect a detection verdict every meeting.
    pub fn expects_detection(&self) -> bool {
        matches!(self, Self::Assigned | Self::Active)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTracking {
    #[serde(default)]
    pub active_experiment: Option<ActiveExperiment>,
    #[serde(default)]
    pub detection_in_this_meeting: Option<Detection>,
}

impl ExperimentTracking {
    /// Status of the active experiment; absent blocks and absent status read as none.
    pub fn status(&self) -> TrackedStatus {
        self.active_experiment
            .as_ref()
            .and_then(|active| active.status)
            .unwrap_or(TrackedStatus::Unassigned)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveExperiment {
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub status: Option<TrackedStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub experiment_id: Option<String>,
    pub attempt: AttemptOutcome,
    #[serde(default, with = "whole")]
    pub count_attempts: Option<i128>,
    #[serde(default)]
    pub evidence_span_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSpan {
    pub evidence_span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub turn_start_id: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "whole")]
    pub turn_end_id: Option<i128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_label: Option<String>,
    pub excerpt: String,
}

/// Fields lifted from a parsed output onto the run record.
///
/// Extraction is lenient and works on documents that failed validation, so
/// failed runs stay inspectable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDigest {
    pub schema_version: Option<String>,
    pub analysis_id: Option<String>,
    pub focus_pattern: Option<String>,
    pub micro_experiment_id: Option<String>,
    pub micro_experiment_pattern: Option<String>,
    pub strengths: Vec<String>,
    pub evaluated_count: usize,
    pub evidence_span_count: usize,
    pub experiment_status: Option<String>,
    pub detection_attempt: Option<String>,
}

impl RunDigest {
    pub fn from_value(value: &Value) -> Self {
        let text = |pointer: &str| value.pointer(pointer).and_then(Value::as_str).map(String::from);
        let array_len = |pointer: &str| value.pointer(pointer).and_then(Value::as_array).map_or(0, Vec::len);

        let strengths = value
            .pointer("/coaching_output/strengths")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("pattern_id").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            schema_version: text("/schema_version"),
            analysis_id: text("/meta/analysis_id"),
            focus_pattern: text("/coaching_output/focus/0/pattern_id"),
            micro_experiment_id: text("/coaching_output/micro_experiment/0/experiment_id"),
            micro_experiment_pattern: text("/coaching_output/micro_experiment/0/pattern_id"),
            strengths,
            evaluated_count: array_len("/evaluation_summary/patterns_evaluated"),
            evidence_span_count: array_len("/evidence_spans"),
            experiment_status: text("/experiment_tracking/active_experiment/status"),
            detection_attempt: text("/experiment_tracking/detection_in_this_meeting/attempt"),
        }
    }
}

/// Serde adapter for fields the schema types as `integer`.
///
/// JSON Schema counts any number with a zero fractional part as an integer,
/// so `2.0` is accepted here too. Magnitudes past `u64` arrive as floats and
/// saturate at the `i128` bounds.
pub(crate) mod whole {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Number;

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<i128>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Number>::deserialize(deserializer)?
            .map(|number| {
                from_number(&number)
                    .ok_or_else(|| D::Error::custom(format!("expected an integer, got {number}")))
            })
            .transpose()
    }

    pub(crate) fn serialize<S>(value: &Option<i128>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let Some(value) = *value else {
            return serializer.serialize_none();
        };
        if let Ok(value) = i64::try_from(value) {
            serializer.serialize_i64(value)
        } else if let Ok(value) = u64::try_from(value) {
            serializer.serialize_u64(value)
        } else {
            serializer.serialize_f64(value as f64)
        }
    }

    fn from_number(number: &Number) -> Option<i128> {
        if let Some(value) = number.as_i64() {
            return Some(i128::from(value));
        }
        if let Some(value) = number.as_u64() {
            return Some(i128::from(value));
        }
        number
            .as_f64()
            .filter(|value| value.is_finite() && value.fract() == 0.0)
            .map(|value| value as i128)
    }
}
