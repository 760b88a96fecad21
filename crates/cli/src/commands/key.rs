use huddle_core::config::{AppConfig, LoadOptions};
use huddle_core::domain::run::AnalysisType;
use huddle_core::idempotency::{
    make_baseline_pack_key, make_experiment_event_key, make_run_key, IdempotencyKey, RunKeyInput,
};
use serde_json::json;

use crate::commands::CommandResult;

pub struct RunKeyArgs<'a> {
    pub transcript_id: &'a str,
    pub analysis_type: &'a str,
    pub coachee_id: &'a str,
    pub speaker_label: &'a str,
    pub role: &'a str,
    /// Falls back to `analysis.config_version` from the loaded config.
    pub config_version: Option<&'a str>,
}

pub fn run(args: RunKeyArgs<'_>) -> CommandResult {
    let Some(analysis_type) = AnalysisType::parse(args.analysis_type) else {
        return CommandResult::failure(
            "key",
            "invalid_argument",
            format!(
                "unknown analysis type `{}` (expected single_meeting|baseline_pack)",
                args.analysis_type
            ),
            2,
        );
    };

    let config_version = match args.config_version {
        Some(version) => version.to_string(),
        None => match AppConfig::load(LoadOptions::default()) {
            Ok(config) => config.analysis.config_version,
            Err(error) => {
                return CommandResult::failure(
                    "key",
                    "config_validation",
                    format!("configuration issue: {error}"),
                    2,
                );
            }
        },
    };

    let key = make_run_key(RunKeyInput {
        transcript_id: args.transcript_id,
        analysis_type,
        coachee_id: args.coachee_id,
        target_speaker_label: args.speaker_label,
        target_role: args.role,
        config_version: &config_version,
    });
    emit("run", key)
}

pub fn event(run_id: &str, experiment_id: &str) -> CommandResult {
    emit("event", make_experiment_event_key(run_id, experiment_id))
}

pub fn pack(baseline_pack_id: &str) -> CommandResult {
    emit("pack", make_baseline_pack_key(baseline_pack_id))
}

fn emit(kind: &str, key: IdempotencyKey) -> CommandResult {
    CommandResult::success_with(
        "key",
        key.as_str(),
        json!({ "kind": kind, "key": key.as_str(), "short": key.short() }),
    )
}
