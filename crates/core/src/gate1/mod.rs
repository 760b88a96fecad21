//! Gate1: the acceptance gate for model output.
//!
//! Validation is a strict pipeline. The raw text is parsed, the document is
//! checked against the pinned schema, and only a structurally clean document
//! reaches the business rules. Every problem becomes a [`ValidationIssue`];
//! the validator itself never fails.

pub mod registry;
mod rules;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::analysis::AnalysisOutput;
use crate::domain::run::StageFlags;

pub use registry::{Contract, IdFormatPatterns, IdKind, RegistryError, SchemaRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

macro_rules! issue_codes {
    ($($variant:ident => $code:literal,)+) => {
        /// Machine-readable issue codes. The string forms are a stable contract.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum IssueCode {
            $(#[serde(rename = $code)] $variant,)+
        }

        impl IssueCode {
            pub const ALL: &'static [IssueCode] = &[$(IssueCode::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value.trim() {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

issue_codes! {
    JsonParseError => "JSON_PARSE_ERROR",
    SchemaViolation => "SCHEMA_VIOLATION",
    PatternSnapshotCount => "PATTERN_SNAPSHOT_COUNT",
    PatternOrder => "PATTERN_ORDER",
    EvalSummaryMissing => "EVAL_SUMMARY_MISSING",
    EvalSummaryExtra => "EVAL_SUMMARY_EXTRA",
    EvalSummaryDuplicate => "EVAL_SUMMARY_DUPLICATE",
    ConvBalanceMissingAssessment => "CONV_BALANCE_MISSING_ASSESSMENT",
    ConvBalanceForbiddenField => "CONV_BALANCE_FORBIDDEN_FIELD",
    InvalidDenominator => "INVALID_DENOMINATOR",
    InvalidNumerator => "INVALID_NUMERATOR",
    NumeratorExceedsDenominator => "NUMERATOR_EXCEEDS_DENOMINATOR",
    RatioOutOfRange => "RATIO_OUT_OF_RANGE",
    NonEvaluableHasNumeric => "NON_EVALUABLE_HAS_NUMERIC",
    OppEventsForbidden => "OPP_EVENTS_FORBIDDEN",
    OppEventsCountMismatch => "OPP_EVENTS_COUNT_MISMATCH",
    OppEventsCountedMismatch => "OPP_EVENTS_COUNTED_MISMATCH",
    DenominatorCountedMismatch => "DENOMINATOR_COUNTED_MISMATCH",
    NumeratorYesMismatch => "NUMERATOR_YES_MISMATCH",
    InvalidEsIdFormat => "INVALID_ES_ID_FORMAT",
    DuplicateEsId => "DUPLICATE_ES_ID",
    DanglingEsReference => "DANGLING_ES_REFERENCE",
    InvalidTurnId => "INVALID_TURN_ID",
    CoachingStrengthsCount => "COACHING_STRENGTHS_COUNT",
    CoachingFocusCount => "COACHING_FOCUS_COUNT",
    CoachingMicroExpCount => "COACHING_MICRO_EXP_COUNT",
    CoachingEmptyEsIds => "COACHING_EMPTY_ES_IDS",
    CoachingDanglingEs => "COACHING_DANGLING_ES",
    BpDetectionMustBeNull => "BP_DETECTION_MUST_BE_NULL",
    SingleMeetingDetectionRequired => "SINGLE_MEETING_DETECTION_REQUIRED",
    DetectionAttemptNoEvidence => "DETECTION_ATTEMPT_NO_EVIDENCE",
    DetectionUnexpected => "DETECTION_UNEXPECTED",
    InvalidIdFormat => "INVALID_ID_FORMAT",
}

impl std::fmt::Display for IssueCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub issue_code: IssueCode,
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(code: IssueCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { severity: Severity::Error, issue_code: code, path: path.into(), message: message.into() }
    }

    pub fn warning(code: IssueCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            issue_code: code,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate1Result {
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
}

impl Gate1Result {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let passed = !issues.iter().any(ValidationIssue::is_error);
        Self { passed, issues }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| issue.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| !issue.is_error())
    }

    pub fn has_code(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|issue| issue.issue_code == code)
    }
}

/// Everything a validation pass learned about the output.
#[derive(Clone, Debug, PartialEq)]
pub struct Gate1Outcome {
    pub result: Gate1Result,
    /// Present whenever the text parsed as JSON, even if the schema failed.
    pub parsed: Option<Value>,
    /// Present once the document passed the schema.
    pub output: Option<AnalysisOutput>,
    pub stages: StageFlags,
}

impl Gate1Outcome {
    pub fn passed(&self) -> bool {
        self.result.passed
    }
}

#[derive(Clone, Debug)]
pub struct Gate1Validator {
    registry: Arc<SchemaRegistry>,
}

impl Gate1Validator {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn validate(&self, raw_text: &str) -> Gate1Result {
        self.inspect(raw_text).result
    }

    pub fn inspect(&self, raw_text: &str) -> Gate1Outcome {
        let mut stages = StageFlags::default();

        let parsed = match serde_json::from_str::<Value>(raw_text) {
            Ok(parsed) => parsed,
            Err(error) => {
                let issue = ValidationIssue::error(
                    IssueCode::JsonParseError,
                    "$",
                    format!("JSON parse failed: {error}"),
                );
                return self.finish(vec![issue], None, None, stages);
            }
        };
        stages.parse_ok = true;

        let violations = self.registry.schema_violations(&parsed);
        if !violations.is_empty() {
            let issues = violations
                .into_iter()
                .map(|violation| {
                    ValidationIssue::error(IssueCode::SchemaViolation, violation.path, violation.message)
                })
                .collect();
            return self.finish(issues, Some(parsed), None, stages);
        }

        // The typed model accepts a superset of the pinned schema, so this arm
        // only fires when a registry is loaded with a schema the model does
        // not cover.
        let output = match AnalysisOutput::from_value(&parsed) {
            Ok(output) => output,
            Err(error) => {
                tracing::error!(
                    event_name = "gate1.decode_mismatch",
                    schema_version = %self.registry.schema_version(),
                    error = %error,
                    "schema-valid document does not decode into the analysis model"
                );
                let issue = ValidationIssue::error(
                    IssueCode::SchemaViolation,
                    "$",
                    format!("document does not decode into the analysis model: {error}"),
                );
                return self.finish(vec![issue], Some(parsed), None, stages);
            }
        };
        stages.schema_ok = true;

        let issues = rules::check(&self.registry, &output);
        stages.business_ok = !issues.iter().any(ValidationIssue::is_error);
        self.finish(issues, Some(parsed), Some(output), stages)
    }

    fn finish(
        &self,
        issues: Vec<ValidationIssue>,
        parsed: Option<Value>,
        output: Option<AnalysisOutput>,
        stages: StageFlags,
    ) -> Gate1Outcome {
        let result = Gate1Result::from_issues(issues);
        tracing::debug!(
            event_name = "gate1.verdict",
            passed = result.passed,
            issue_count = result.issues.len(),
            parse_ok = stages.parse_ok,
            schema_ok = stages.schema_ok,
            business_ok = stages.business_ok,
            "gate1 validation finished"
        );
        Gate1Outcome { result, parsed, output, stages }
    }
}
