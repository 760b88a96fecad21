//! Business rules over a schema-valid analysis document.
//!
//! Every section runs; nothing here short-circuits, so one pass reports the
//! full list of problems.

use std::collections::{BTreeSet, HashSet};

use crate::domain::analysis::{AnalysisOutput, CoachingItem, EvidenceSpan, ScoreFault};
use crate::domain::run::AnalysisType;

use super::registry::{IdKind, SchemaRegistry};
use super::{IssueCode, ValidationIssue};

const MAX_STRENGTHS: usize = 2;
const FOCUS_ITEMS: usize = 1;
const MICRO_EXPERIMENT_ITEMS: usize = 1;

pub(crate) fn check(registry: &SchemaRegistry, output: &AnalysisOutput) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let known_spans: HashSet<&str> =
        output.evidence_spans.iter().map(|span| span.evidence_span_id.as_str()).collect();

    check_snapshot_order(registry, output, &mut issues);
    check_summary_partition(registry, output, &mut issues);
    check_snapshot_items(registry, output, &known_spans, &mut issues);
    check_evidence_spans(registry, &output.evidence_spans, &mut issues);
    check_coaching(output, &known_spans, &mut issues);
    check_experiment_tracking(output, &known_spans, &mut issues);
    check_id_formats(registry, output, &mut issues);

    issues
}

fn check_snapshot_order(
    registry: &SchemaRegistry,
    output: &AnalysisOutput,
    issues: &mut Vec<ValidationIssue>,
) {
    let expected = registry.pattern_order();
    let snapshot = &output.pattern_snapshot;

    if snapshot.len() != expected.len() {
        issues.push(ValidationIssue::error(
            IssueCode::PatternSnapshotCount,
            "pattern_snapshot",
            format!("Expected {} items, got {}.", expected.len(), snapshot.len()),
        ));
        return;
    }

    for (idx, (item, expected_id)) in snapshot.iter().zip(expected).enumerate() {
        if &item.pattern_id != expected_id {
            issues.push(ValidationIssue::error(
                IssueCode::PatternOrder,
                format!("pattern_snapshot[{idx}].pattern_id"),
                format!("Expected '{expected_id}', got '{}'.", item.pattern_id),
            ));
        }
    }
}

fn check_summary_partition(
    registry: &SchemaRegistry,
    output: &AnalysisOutput,
    issues: &mut Vec<ValidationIssue>,
) {
    let reported: Vec<&str> = output.evaluation_summary.all_reported().collect();
    let reported_set: BTreeSet<&str> = reported.iter().copied().collect();
    let canonical: BTreeSet<&str> = registry.pattern_order().iter().map(String::as_str).collect();

    let missing: Vec<&str> = canonical.difference(&reported_set).copied().collect();
    if !missing.is_empty() {
        issues.push(ValidationIssue::error(
            IssueCode::EvalSummaryMissing,
            "evaluation_summary",
            format!("Missing pattern IDs: {missing:?}"),
        ));
    }

    let extra: Vec<&str> = reported_set.difference(&canonical).copied().collect();
    if !extra.is_empty() {
        issues.push(ValidationIssue::error(
            IssueCode::EvalSummaryExtra,
            "evaluation_summary",
            format!("Unknown pattern IDs: {extra:?}"),
        ));
    }

    if reported.len() != reported_set.len() {
        issues.push(ValidationIssue::error(
            IssueCode::EvalSummaryDuplicate,
            "evaluation_summary",
            "Duplicate pattern IDs across evaluation_summary arrays.",
        ));
    }
}

fn check_snapshot_items(
    registry: &SchemaRegistry,
    output: &AnalysisOutput,
    known_spans: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    for (idx, item) in output.pattern_snapshot.iter().enumerate() {
        let path = format!("pattern_snapshot[{idx}]");

        if let Err(faults) = item.score(registry.is_balance_pattern(&item.pattern_id)) {
            issues.extend(faults.into_iter().map(|fault| fault_issue(&path, &item.pattern_id, fault)));
        }

        for span_id in &item.evidence_span_ids {
            let refs_path = format!("{path}.evidence_span_ids");
            if !registry.id_matches(IdKind::EvidenceSpan, span_id) {
                issues.push(ValidationIssue::error(
                    IssueCode::InvalidEsIdFormat,
                    refs_path,
                    format!("Invalid evidence_span_id format: {span_id}"),
                ));
            } else if !known_spans.contains(span_id.as_str()) {
                issues.push(ValidationIssue::error(
                    IssueCode::DanglingEsReference,
                    refs_path,
                    format!("evidence_span_id {span_id} not found in evidence_spans."),
                ));
            }
        }
    }
}

fn fault_issue(path: &str, pattern_id: &str, fault: ScoreFault) -> ValidationIssue {
    match fault {
        ScoreFault::BalanceMissingAssessment => ValidationIssue::error(
            IssueCode::ConvBalanceMissingAssessment,
            format!("{path}.balance_assessment"),
            format!("{pattern_id} evaluable item must have balance_assessment."),
        ),
        ScoreFault::BalanceForbiddenField(field) => ValidationIssue::error(
            IssueCode::ConvBalanceForbiddenField,
            format!("{path}.{field}"),
            format!("{pattern_id} must not have {field}."),
        ),
        ScoreFault::InvalidDenominator(_) => ValidationIssue::error(
            IssueCode::InvalidDenominator,
            format!("{path}.denominator"),
            "Evaluable numeric pattern must have denominator >= 1.",
        ),
        ScoreFault::InvalidNumerator(_) => ValidationIssue::error(
            IssueCode::InvalidNumerator,
            format!("{path}.numerator"),
            "numerator must be >= 0.",
        ),
        ScoreFault::NumeratorExceedsDenominator { numerator, denominator } => {
            ValidationIssue::error(
                IssueCode::NumeratorExceedsDenominator,
                path,
                format!("numerator ({numerator}) > denominator ({denominator})."),
            )
        }
        ScoreFault::RatioOutOfRange(ratio) => ValidationIssue::error(
            IssueCode::RatioOutOfRange,
            format!("{path}.ratio"),
            format!("ratio ({ratio}) must be in [0, 1]."),
        ),
        ScoreFault::NonEvaluableHasNumeric { status, field } => ValidationIssue::error(
            IssueCode::NonEvaluableHasNumeric,
            format!("{path}.{field}"),
            format!("{} item must not have {field}.", status.as_str()),
        ),
        ScoreFault::OpportunityEventsForbidden => ValidationIssue::error(
            IssueCode::OppEventsForbidden,
            format!("{path}.opportunity_events"),
            "opportunity_events only allowed on numeric evaluable patterns.",
        ),
        ScoreFault::ConsideredMismatch { declared, actual } => ValidationIssue::error(
            IssueCode::OppEventsCountMismatch,
            format!("{path}.opportunity_events_considered"),
            format!(
                "opportunity_events_considered ({}) != len(opportunity_events) ({actual}).",
                display_count(declared)
            ),
        ),
        ScoreFault::CountedMismatch { declared, actual } => ValidationIssue::error(
            IssueCode::OppEventsCountedMismatch,
            format!("{path}.opportunity_events_counted"),
            format!(
                "opportunity_events_counted ({}) != actual counted events ({actual}).",
                display_count(declared)
            ),
        ),
        ScoreFault::DenominatorCountedMismatch { denominator, counted } => ValidationIssue::error(
            IssueCode::DenominatorCountedMismatch,
            format!("{path}.denominator"),
            format!("denominator ({denominator}) must equal opportunity_events_counted ({counted})."),
        ),
        ScoreFault::NumeratorSuccessMismatch { numerator, successes } => ValidationIssue::error(
            IssueCode::NumeratorYesMismatch,
            format!("{path}.numerator"),
            format!(
                "numerator ({numerator}) must equal count(counted AND success=yes) ({successes})."
            ),
        ),
    }
}

fn display_count(value: Option<i128>) -> String {
    value.map_or_else(|| "missing".to_string(), |value| value.to_string())
}

fn check_evidence_spans(
    registry: &SchemaRegistry,
    spans: &[EvidenceSpan],
    issues: &mut Vec<ValidationIssue>,
) {
    let mut seen: HashSet<&str> = HashSet::new();

    for (idx, span) in spans.iter().enumerate() {
        let path = format!("evidence_spans[{idx}]");
        let span_id = span.evidence_span_id.as_str();

        if !registry.id_matches(IdKind::EvidenceSpan, span_id) {
            issues.push(ValidationIssue::error(
                IssueCode::InvalidEsIdFormat,
                format!("{path}.evidence_span_id"),
                format!("Invalid evidence_span_id format: {span_id}"),
            ));
        }
        if !seen.insert(span_id) {
            issues.push(ValidationIssue::error(
                IssueCode::DuplicateEsId,
                format!("{path}.evidence_span_id"),
                format!("evidence_span_id {span_id} appears more than once."),
            ));
        }

        for (field, value) in [("turn_start_id", span.turn_start_id), ("turn_end_id", span.turn_end_id)]
        {
            if let Some(value) = value.filter(|value| *value < 1) {
                issues.push(ValidationIssue::error(
                    IssueCode::InvalidTurnId,
                    format!("{path}.{field}"),
                    format!("{field} must be an integer >= 1, got {value}."),
                ));
            }
        }
    }
}

fn check_coaching(
    output: &AnalysisOutput,
    known_spans: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    let coaching = &output.coaching_output;

    if coaching.strengths.len() > MAX_STRENGTHS {
        issues.push(ValidationIssue::error(
            IssueCode::CoachingStrengthsCount,
            "coaching_output.strengths",
            format!("strengths must have 0-{MAX_STRENGTHS} items, got {}.", coaching.strengths.len()),
        ));
    }
    if coaching.focus.len() != FOCUS_ITEMS {
        issues.push(ValidationIssue::error(
            IssueCode::CoachingFocusCount,
            "coaching_output.focus",
            format!("focus must have exactly {FOCUS_ITEMS} item, got {}.", coaching.focus.len()),
        ));
    }
    if coaching.micro_experiment.len() != MICRO_EXPERIMENT_ITEMS {
        issues.push(ValidationIssue::error(
            IssueCode::CoachingMicroExpCount,
            "coaching_output.micro_experiment",
            format!(
                "micro_experiment must have exactly {MICRO_EXPERIMENT_ITEMS} item, got {}.",
                coaching.micro_experiment.len()
            ),
        ));
    }

    let sections: [(&str, Vec<&[String]>); 3] = [
        ("strengths", span_refs(&coaching.strengths)),
        ("focus", span_refs(&coaching.focus)),
        (
            "micro_experiment",
            coaching.micro_experiment.iter().map(|item| item.evidence_span_ids.as_slice()).collect(),
        ),
    ];

    for (section, items) in sections {
        for (idx, span_ids) in items.into_iter().enumerate() {
            let path = format!("coaching_output.{section}[{idx}].evidence_span_ids");
            if span_ids.is_empty() {
                issues.push(ValidationIssue::error(
                    IssueCode::CoachingEmptyEsIds,
                    path.clone(),
                    "evidence_span_ids must be non-empty in coaching_output items.",
                ));
            }
            for span_id in span_ids {
                if !known_spans.contains(span_id.as_str()) {
                    issues.push(ValidationIssue::error(
                        IssueCode::CoachingDanglingEs,
                        path.clone(),
                        format!("evidence_span_id {span_id} not found in evidence_spans."),
                    ));
                }
            }
        }
    }
}

fn span_refs(items: &[CoachingItem]) -> Vec<&[String]> {
    items.iter().map(|item| item.evidence_span_ids.as_slice()).collect()
}

fn check_experiment_tracking(
    output: &AnalysisOutput,
    known_spans: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    const DETECTION_PATH: &str = "experiment_tracking.detection_in_this_meeting";

    let tracking = &output.experiment_tracking;
    let detection = tracking.detection_in_this_meeting.as_ref();
    let status = tracking.status();

    match output.meta.analysis_type {
        AnalysisType::BaselinePack => {
            if detection.is_some() {
                issues.push(ValidationIssue::error(
                    IssueCode::BpDetectionMustBeNull,
                    DETECTION_PATH,
                    "baseline_pack analysis must have detection_in_this_meeting = null.",
                ));
            }
            return;
        }
        AnalysisType::SingleMeeting if status.expects_detection() => match detection {
            None => issues.push(ValidationIssue::error(
                IssueCode::SingleMeetingDetectionRequired,
                DETECTION_PATH,
                format!(
                    "{} experiment requires detection_in_this_meeting to be non-null.",
                    status.as_str()
                ),
            )),
            Some(detection)
                if detection.attempt.claims_attempt() && detection.evidence_span_ids.is_empty() =>
            {
                issues.push(ValidationIssue::error(
                    IssueCode::DetectionAttemptNoEvidence,
                    format!("{DETECTION_PATH}.evidence_span_ids"),
                    format!(
                        "attempt '{}' requires non-empty evidence_span_ids.",
                        detection.attempt.as_str()
                    ),
                ));
            }
            Some(_) => {}
        },
        AnalysisType::SingleMeeting => {
            if detection.is_some() {
                issues.push(ValidationIssue::warning(
                    IssueCode::DetectionUnexpected,
                    DETECTION_PATH,
                    "detection_in_this_meeting should be null when no active experiment.",
                ));
            }
        }
    }

    if let Some(detection) = detection {
        for span_id in &detection.evidence_span_ids {
            if !known_spans.contains(span_id.as_str()) {
                issues.push(ValidationIssue::error(
                    IssueCode::DanglingEsReference,
                    format!("{DETECTION_PATH}.evidence_span_ids"),
                    format!("evidence_span_id {span_id} not found in evidence_spans."),
                ));
            }
        }
    }
}

fn check_id_formats(
    registry: &SchemaRegistry,
    output: &AnalysisOutput,
    issues: &mut Vec<ValidationIssue>,
) {
    let mut check = |path: &str, value: Option<&str>, kind: IdKind| {
        let Some(value) = value else {
            return;
        };
        if !registry.id_matches(kind, value) {
            issues.push(ValidationIssue::error(
                IssueCode::InvalidIdFormat,
                path,
                format!("'{value}' does not match expected format for {}.", kind.field_name()),
            ));
        }
    };

    check("meta.analysis_id", Some(output.meta.analysis_id.as_str()), IdKind::Analysis);
    check("context.meeting_id", output.context.meeting_id.as_deref(), IdKind::Meeting);
    check(
        "context.baseline_pack_id",
        output.context.baseline_pack_id.as_deref(),
        IdKind::BaselinePack,
    );
    check(
        "coaching_output.micro_experiment[0].experiment_id",
        output.micro_experiment().map(|experiment| experiment.experiment_id.as_str()),
        IdKind::Experiment,
    );
    check(
        "experiment_tracking.active_experiment.experiment_id",
        output
            .experiment_tracking
            .active_experiment
            .as_ref()
            .and_then(|active| active.experiment_id.as_deref()),
        IdKind::Experiment,
    );
}
