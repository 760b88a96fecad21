//! Request payloads for the model.
//!
//! Assembly is pure: given the same inputs and the same [`AnalysisStamp`] the
//! user message is byte-for-byte identical. Field order follows the struct
//! declarations below, never map iteration order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::domain::baseline::{Consistency, MeetingSummary};
use crate::domain::run::AnalysisType;
use crate::domain::transcript::Transcript;
use crate::gate1::SchemaRegistry;

/// Identity and versions stamped onto one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisStamp {
    pub analysis_id: String,
    pub generated_at: DateTime<Utc>,
    pub schema_version: String,
    pub taxonomy_version: String,
    pub output_mode: String,
}

impl AnalysisStamp {
    /// Date-stamped id in the `A-YYMMDD` shape.
    pub fn new(registry: &SchemaRegistry, now: DateTime<Utc>) -> Self {
        Self {
            analysis_id: format!("A-{}", now.format("%y%m%d")),
            generated_at: now,
            schema_version: registry.schema_version().to_string(),
            taxonomy_version: registry.taxonomy_version().to_string(),
            output_mode: registry.output_mode().to_string(),
        }
    }

    fn meta(&self, analysis_type: AnalysisType) -> MetaBlock<'_> {
        MetaBlock {
            analysis_id: &self.analysis_id,
            analysis_type: analysis_type.as_str(),
            generated_at: self.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            taxonomy_version: &self.taxonomy_version,
            output_mode: &self.output_mode,
            schema_hash: None,
        }
    }
}

#[derive(Serialize)]
struct MetaBlock<'a> {
    analysis_id: &'a str,
    analysis_type: &'static str,
    generated_at: String,
    taxonomy_version: &'a str,
    output_mode: &'a str,
    schema_hash: Option<&'a str>,
}

/// Coaching history carried into a single-meeting request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MemoryBlock {
    pub baseline_profile: Option<BaselineProfile>,
    pub active_experiment: Option<ExperimentMemory>,
    pub recent_pattern_snapshots: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BaselineProfile {
    pub strengths: Vec<String>,
    pub focus: Option<String>,
    pub baseline_pack_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExperimentMemory {
    pub experiment_id: String,
    pub title: String,
    pub instruction: String,
    pub success_marker: String,
    pub pattern_id: String,
    pub status: String,
}

impl MemoryBlock {
    pub fn new(
        baseline_profile: Option<BaselineProfile>,
        active_experiment: Option<ExperimentMemory>,
        recent_pattern_snapshots: Vec<serde_json::Value>,
    ) -> Self {
        // A coachee with neither a baseline nor an experiment has no history worth sending.
        if baseline_profile.is_none() && active_experiment.is_none() {
            return Self::default();
        }
        Self { baseline_profile, active_experiment, recent_pattern_snapshots }
    }

    pub fn is_empty(&self) -> bool {
        self.baseline_profile.is_none()
            && self.active_experiment.is_none()
            && self.recent_pattern_snapshots.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct SingleMeetingPrompt<'a> {
    pub meeting_id: &'a str,
    pub meeting_type: &'a str,
    pub target_role: &'a str,
    pub meeting_date: Option<&'a str>,
    pub target_speaker_name: &'a str,
    pub target_speaker_label: &'a str,
    pub source_id: &'a str,
    pub transcript: &'a Transcript,
    pub memory: &'a MemoryBlock,
}

/// One constituent meeting of a baseline pack as seen by the prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PackMeeting {
    pub meeting_id: String,
    pub meeting_type: String,
    pub target_speaker_name: String,
    pub target_speaker_label: String,
    pub target_speaker_role: String,
}

#[derive(Clone, Debug)]
pub struct BaselinePackPrompt<'a> {
    pub baseline_pack_id: &'a str,
    pub target_role: &'a str,
    pub meetings: &'a [PackMeeting],
    pub summaries: &'a [MeetingSummary],
}

impl BaselinePackPrompt<'_> {
    pub fn role_consistency(&self) -> Consistency {
        Consistency::of(self.meetings.iter().map(|meeting| meeting.target_speaker_role.as_str()))
    }

    pub fn meeting_type_consistency(&self) -> Consistency {
        Consistency::of(self.meetings.iter().map(|meeting| meeting.meeting_type.as_str()))
    }

    /// The shared role, or `mixed` when the meetings disagree.
    pub fn effective_role(&self) -> &str {
        match self.role_consistency() {
            Consistency::Consistent => self
                .meetings
                .first()
                .map_or(self.target_role, |meeting| meeting.target_speaker_role.as_str()),
            Consistency::Mixed => "mixed",
        }
    }
}

/// An assembled request: what is persisted and what is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptPayload {
    pub analysis_type: AnalysisType,
    pub user_message: String,
}

#[derive(Serialize)]
struct InputPayload<'a, C: Serialize, T: Serialize> {
    meta: MetaBlock<'a>,
    context: C,
    memory: &'a MemoryBlock,
    transcript: TranscriptBlock<'a, T>,
}

#[derive(Serialize)]
struct TranscriptBlock<'a, T: Serialize> {
    source_id: &'a str,
    turns: Vec<T>,
}

#[derive(Serialize)]
struct SingleMeetingContext<'a> {
    meeting_id: &'a str,
    meeting_type: &'a str,
    target_role: &'a str,
    meeting_date: Option<&'a str>,
    target_speaker_name: &'a str,
    target_speaker_label: &'a str,
}

#[derive(Serialize)]
struct TurnPayload<'a> {
    speaker_label: &'a str,
    text: &'a str,
    turn_id: u32,
    speaker_role_hint: Option<&'a str>,
}

#[derive(Serialize)]
struct PackContext<'a> {
    baseline_pack_id: &'a str,
    pack_size: usize,
    meetings: Vec<MeetingRefPayload<'a>>,
    target_role: &'a str,
}

#[derive(Serialize)]
struct MeetingRefPayload<'a> {
    meeting_id: &'a str,
    meeting_type: &'a str,
}

pub fn build_single_meeting(
    stamp: &AnalysisStamp,
    input: &SingleMeetingPrompt<'_>,
) -> Result<PromptPayload, serde_json::Error> {
    let turns: Vec<TurnPayload<'_>> = input
        .transcript
        .turns
        .iter()
        .map(|turn| TurnPayload {
            speaker_label: &turn.speaker_label,
            text: &turn.text,
            turn_id: turn.turn_id,
            speaker_role_hint: turn.speaker_role_hint.as_deref(),
        })
        .collect();

    let payload = InputPayload {
        meta: stamp.meta(AnalysisType::SingleMeeting),
        context: SingleMeetingContext {
            meeting_id: input.meeting_id,
            meeting_type: input.meeting_type,
            target_role: input.target_role,
            meeting_date: input.meeting_date,
            target_speaker_name: input.target_speaker_name,
            target_speaker_label: input.target_speaker_label,
        },
        memory: input.memory,
        transcript: TranscriptBlock { source_id: input.source_id, turns },
    };

    Ok(PromptPayload {
        analysis_type: AnalysisType::SingleMeeting,
        user_message: user_message(stamp, &payload)?,
    })
}

pub fn build_baseline_pack(
    stamp: &AnalysisStamp,
    input: &BaselinePackPrompt<'_>,
) -> Result<PromptPayload, serde_json::Error> {
    let effective_role = input.effective_role();
    let pack_text = pack_instructions(input, effective_role)?;
    let no_memory = MemoryBlock::default();

    let payload = InputPayload {
        meta: stamp.meta(AnalysisType::BaselinePack),
        context: PackContext {
            baseline_pack_id: input.baseline_pack_id,
            pack_size: input.meetings.len(),
            meetings: input
                .meetings
                .iter()
                .map(|meeting| MeetingRefPayload {
                    meeting_id: &meeting.meeting_id,
                    meeting_type: &meeting.meeting_type,
                })
                .collect(),
            target_role: effective_role,
        },
        memory: &no_memory,
        transcript: TranscriptBlock { source_id: input.baseline_pack_id, turns: vec![pack_text] },
    };

    Ok(PromptPayload {
        analysis_type: AnalysisType::BaselinePack,
        user_message: user_message(stamp, &payload)?,
    })
}

fn user_message<P: Serialize>(stamp: &AnalysisStamp, payload: &P) -> Result<String, serde_json::Error> {
    Ok(format!(
        "Analyze and return ONLY one JSON object conforming to {}.\n\nINPUT_PAYLOAD\n{}",
        stamp.schema_version,
        serde_json::to_string_pretty(payload)?
    ))
}

fn pack_instructions(
    input: &BaselinePackPrompt<'_>,
    effective_role: &str,
) -> Result<String, serde_json::Error> {
    let size = input.meetings.len();
    let mut lines = vec![
        format!(
            "BASELINE PACK INPUT ({size} meetings). Task: compute a role-conditioned baseline \
             snapshot using the {size} single_meeting analyses below."
        ),
        String::new(),
        "AGGREGATION RULES:".to_string(),
        "1) For each pattern_id, compute the baseline ratio as the median of the meeting-level \
         ratios across meetings where that pattern is evaluable (not insufficient_signal and not \
         not_evaluable)."
            .to_string(),
        "2) If a pattern is insufficient_signal in >=2 meetings, treat it as insufficient_signal \
         in the baseline pack."
            .to_string(),
        "3) Use the baseline snapshot to select: 0-2 strengths, exactly 1 focus, exactly 1 \
         micro-experiment (highest leverage)."
            .to_string(),
        "4) Baseline pack: do NOT do experiment attempt detection (detection_in_this_meeting \
         must be null)."
            .to_string(),
        "5) Per-meeting micro_experiment suggestions are candidates only. For baseline_pack, \
         choose exactly one experiment based on the aggregated baseline snapshot; do not \
         continue any per-meeting experiment."
            .to_string(),
        "IMPORTANT: Only use the information in this pack. Do not invent missing denominators \
         or opportunities."
            .to_string(),
        String::new(),
        "PACK CONTEXT:".to_string(),
        format!("- baseline_pack_id: {}", input.baseline_pack_id),
        format!("- pack_size: {size}"),
        format!("- target_role: {effective_role}"),
        format!("- role_consistency: {}", input.role_consistency().as_str()),
        format!("- meeting_type_consistency: {}", input.meeting_type_consistency().as_str()),
        format!("- meetings: {}", serde_json::to_string(input.meetings)?),
        String::new(),
        "MEETING SUMMARIES (each is a JSON object; do not assume missing fields):".to_string(),
    ];

    for summary in input.summaries {
        lines.push(String::new());
        lines.push(serde_json::to_string(summary)?);
    }

    Ok(lines.join("\n"))
}
