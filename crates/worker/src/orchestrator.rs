//! Drives one analysis from a queued record to its terminal status.
//!
//! Every path is idempotent: a run, an experiment and an attempt event are
//! each looked up by key before they are created, so a retried or re-enqueued
//! job converges on the records the first attempt wrote.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use huddle_agent::{LlmError, LlmGateway, LlmRequest};
use huddle_core::domain::analysis::{AnalysisOutput, RunDigest};
use huddle_core::domain::baseline::{
    BaselinePack, BaselinePackItem, BaselinePackStatus, MeetingSummary, BASELINE_PACK_SIZE,
};
use huddle_core::domain::coachee::{PromptConfig, User};
use huddle_core::domain::experiment::{Experiment, ExperimentEvent, ExperimentStatus};
use huddle_core::domain::run::{AnalysisType, Run, RunRequest, RunRequestStatus};
use huddle_core::domain::transcript::Transcript;
use huddle_core::errors::DomainError;
use huddle_core::gate1::{Gate1Outcome, Gate1Validator, ValidationIssue};
use huddle_core::idempotency::{
    make_baseline_pack_key, make_experiment_event_key, make_run_key, IdempotencyKey, RunKeyInput,
};
use huddle_core::prompt::{
    build_baseline_pack, build_single_meeting, AnalysisStamp, BaselinePackPrompt,
    BaselineProfile, ExperimentMemory, MemoryBlock, PackMeeting, SingleMeetingPrompt,
};
use huddle_db::{Filter, IdempotencyResolver, RecordStore, Records, StoreError, StoredIssue};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::best_effort;
use crate::prompts::PromptSet;

/// Raw model output is truncated to this many characters before storage.
pub const RAW_OUTPUT_LIMIT: usize = 100_000;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("prompt assembly failed: {0}")]
    Prompt(#[from] serde_json::Error),
    #[error(transparent)]
    Precondition(#[from] DomainError),
}

impl OrchestratorError {
    /// Transient infrastructure failures only. Preconditions and malformed
    /// records fail the job on the first attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(error) => error.is_transient(),
            Self::Llm(error) => error.is_retryable(),
            Self::Prompt(_) | Self::Precondition(_) => false,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Store(_) => "persistence",
            Self::Llm(_) => "integration",
            Self::Prompt(_) => "prompt",
            Self::Precondition(DomainError::MissingPrerequisite(_)) => "precondition",
            Self::Precondition(_) => "domain",
        }
    }
}

fn precondition(message: String) -> OrchestratorError {
    OrchestratorError::Precondition(DomainError::MissingPrerequisite(message))
}

/// Where a processed job ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub gate1_passed: bool,
    /// An earlier run with the same idempotency key was reused; no model call was made.
    pub reused: bool,
}

/// Who gets a freshly instantiated experiment as their active one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Activation {
    Always,
    /// Only when the coachee is not already running an experiment.
    WhenIdle,
}

/// Identity fields copied onto the run record.
struct RunScope<'a> {
    analysis_type: AnalysisType,
    key: &'a IdempotencyKey,
    coachee_id: &'a str,
    run_request_id: Option<&'a str>,
    transcript_id: Option<&'a str>,
    baseline_pack_id: Option<&'a str>,
    target_speaker_label: &'a str,
    target_role: &'a str,
}

/// A constituent meeting of a pack build, resolved from its linked run.
struct PackInput {
    item_id: String,
    meeting: PackMeeting,
    summary: MeetingSummary,
}

pub struct RunOrchestrator<S, G> {
    records: Arc<Records<S>>,
    gateway: G,
    validator: Gate1Validator,
    prompts: PromptSet,
}

impl<S, G> RunOrchestrator<S, G>
where
    S: RecordStore + 'static,
    G: LlmGateway,
{
    pub fn new(
        records: Arc<Records<S>>,
        gateway: G,
        validator: Gate1Validator,
        prompts: PromptSet,
    ) -> Self {
        Self { records, gateway, validator, prompts }
    }

    pub fn records(&self) -> &Records<S> {
        &self.records
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub async fn process_single_meeting(
        &self,
        run_request_id: &str,
    ) -> Result<RunOutcome, OrchestratorError> {
        let mut request = self.records.get::<RunRequest>(run_request_id).await?.value;
        if request.analysis_type != AnalysisType::SingleMeeting {
            return Err(OrchestratorError::Precondition(DomainError::InvariantViolation(format!(
                "run request {run_request_id} is a {} request",
                request.analysis_type.as_str()
            ))));
        }

        let prompts = self.active_prompts().await?;
        let key = make_run_key(RunKeyInput {
            transcript_id: &request.transcript_id,
            analysis_type: AnalysisType::SingleMeeting,
            coachee_id: &request.coachee_id,
            target_speaker_label: &request.target_speaker_label,
            target_role: &request.target_role,
            config_version: &prompts.config_version,
        });
        info!(
            event_name = "worker.run.started",
            run_request_id,
            analysis_type = "single_meeting",
            key = key.short(),
            "processing run request"
        );

        if let Some(existing) = IdempotencyResolver::new(&self.records).check_run_exists(&key).await? {
            let passed = existing.value.gate1_passed;
            self.store_issues(&existing.id, &existing.value.issues).await?;
            if passed {
                self.follow_up_single_meeting(&existing.id, &request.coachee_id).await?;
            }
            self.finish_request(run_request_id, RunRequestStatus::from_verdict(passed), &existing.id)
                .await?;
            info!(
                event_name = "worker.run.idempotent_hit",
                run_request_id,
                run_id = %existing.id,
                key = key.short(),
                "reusing existing run"
            );
            return Ok(RunOutcome { run_id: existing.id, gate1_passed: passed, reused: true });
        }

        request.transition_to(RunRequestStatus::Running)?;
        self.records
            .patch::<RunRequest>(run_request_id, json!({ "status": request.status }))
            .await?;

        let transcript = self.records.get::<Transcript>(&request.transcript_id).await?.value;
        let memory = self.memory_for(&request.coachee_id).await?;
        let stamp = AnalysisStamp::new(self.validator.registry(), Utc::now());
        let payload = build_single_meeting(
            &stamp,
            &SingleMeetingPrompt {
                meeting_id: &transcript.meeting_id,
                meeting_type: &transcript.meeting_type,
                target_role: &request.target_role,
                meeting_date: transcript.meeting_date.as_deref(),
                target_speaker_name: &request.target_speaker_name,
                target_speaker_label: &request.target_speaker_label,
                source_id: &request.transcript_id,
                transcript: &transcript,
                memory: &memory,
            },
        )?;

        let (run_id, outcome) = self
            .execute(
                &prompts,
                payload.user_message,
                RunScope {
                    analysis_type: AnalysisType::SingleMeeting,
                    key: &key,
                    coachee_id: &request.coachee_id,
                    run_request_id: Some(run_request_id),
                    transcript_id: Some(&request.transcript_id),
                    baseline_pack_id: None,
                    target_speaker_label: &request.target_speaker_label,
                    target_role: &request.target_role,
                },
            )
            .await?;

        if outcome.passed() {
            self.follow_up_single_meeting(&run_id, &request.coachee_id).await?;
        }

        self.finish_request(run_request_id, RunRequestStatus::from_verdict(outcome.passed()), &run_id)
            .await?;
        info!(
            event_name = "worker.run.completed",
            run_request_id,
            run_id = %run_id,
            gate1_passed = outcome.passed(),
            "run request processed"
        );

        Ok(RunOutcome { run_id, gate1_passed: outcome.passed(), reused: false })
    }

    pub async fn process_baseline_pack(
        &self,
        pack_record_id: &str,
    ) -> Result<RunOutcome, OrchestratorError> {
        let pack = self.records.get::<BaselinePack>(pack_record_id).await?.value;
        let prompts = self.active_prompts().await?;
        let key = make_baseline_pack_key(pack_record_id);
        info!(
            event_name = "worker.run.started",
            baseline_pack_id = %pack.baseline_pack_id,
            analysis_type = "baseline_pack",
            key = key.short(),
            "building baseline pack"
        );

        let resolver = IdempotencyResolver::new(&self.records);
        if let Some(existing) = resolver.check_baseline_pack_run_exists(&key).await? {
            let passed = existing.value.gate1_passed;
            self.store_issues(&existing.id, &existing.value.issues).await?;
            let inputs = self.pack_inputs(pack_record_id, &pack).await?;
            self.record_pack_build(pack_record_id, &pack, &existing.id, passed, &inputs).await?;
            if passed {
                self.follow_up_baseline_pack(&existing.id, pack_record_id, &pack.coachee_id).await?;
            }
            info!(
                event_name = "worker.run.idempotent_hit",
                baseline_pack_id = %pack.baseline_pack_id,
                run_id = %existing.id,
                key = key.short(),
                "reusing existing baseline pack run"
            );
            return Ok(RunOutcome { run_id: existing.id, gate1_passed: passed, reused: true });
        }

        let inputs = self.pack_inputs(pack_record_id, &pack).await?;
        self.records
            .patch::<BaselinePack>(pack_record_id, json!({ "status": BaselinePackStatus::Building }))
            .await?;

        let (meetings, summaries) = split_inputs(&inputs);
        let prompt = pack_prompt(&pack, &meetings, &summaries);
        let effective_role = prompt.effective_role().to_string();
        let stamp = AnalysisStamp::new(self.validator.registry(), Utc::now());
        let payload = build_baseline_pack(&stamp, &prompt)?;

        let (run_id, outcome) = self
            .execute(
                &prompts,
                payload.user_message,
                RunScope {
                    analysis_type: AnalysisType::BaselinePack,
                    key: &key,
                    coachee_id: &pack.coachee_id,
                    run_request_id: None,
                    transcript_id: None,
                    baseline_pack_id: Some(pack_record_id),
                    target_speaker_label: &pack.target_speaker_label,
                    target_role: &effective_role,
                },
            )
            .await?;

        self.record_pack_build(pack_record_id, &pack, &run_id, outcome.passed(), &inputs).await?;

        if outcome.passed() {
            self.follow_up_baseline_pack(&run_id, pack_record_id, &pack.coachee_id).await?;
        }

        info!(
            event_name = "worker.run.completed",
            baseline_pack_id = %pack.baseline_pack_id,
            run_id = %run_id,
            gate1_passed = outcome.passed(),
            "baseline pack built"
        );
        Ok(RunOutcome { run_id, gate1_passed: outcome.passed(), reused: false })
    }

    /// Creates the experiment proposed by a passed run and makes it the
    /// coachee's active one. Returns the experiment record id, or `None` when
    /// the run has nothing usable to instantiate.
    pub async fn instantiate_experiment_from_run(
        &self,
        run_id: &str,
        coachee_id: Option<&str>,
        baseline_pack_id: Option<&str>,
    ) -> Result<Option<String>, OrchestratorError> {
        self.instantiate(run_id, coachee_id, baseline_pack_id, Activation::Always).await
    }

    /// Records the coachee's attempt at their running experiment, as detected
    /// in this run's meeting.
    pub async fn create_attempt_event_from_run(
        &self,
        run_id: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let run = self.records.get::<Run>(run_id).await?.value;
        if !run.gate1_passed {
            return Ok(None);
        }
        let Some(output) = parsed_output(&run) else {
            return Ok(None);
        };

        let tracking = &output.experiment_tracking;
        if !tracking.status().expects_detection() {
            return Ok(None);
        }
        let Some(detection) = tracking.detection_in_this_meeting.as_ref() else {
            return Ok(None);
        };
        let Some(experiment_id) = tracking
            .active_experiment
            .as_ref()
            .and_then(|active| active.experiment_id.as_deref())
            .or(detection.experiment_id.as_deref())
        else {
            warn!(event_name = "worker.attempt.skipped", run_id, "detection names no experiment");
            return Ok(None);
        };

        let filter = Filter::eq("experiment_id", experiment_id).and("coachee_id", run.coachee_id.as_str());
        let Some(experiment) = self.records.first::<Experiment>(&filter).await? else {
            warn!(
                event_name = "worker.attempt.skipped",
                run_id,
                experiment_id,
                "no experiment record for detected attempt"
            );
            return Ok(None);
        };

        let key = make_experiment_event_key(run_id, experiment_id);
        let resolver = IdempotencyResolver::new(&self.records);
        if let Some(existing) = resolver.check_experiment_event_exists(&key).await? {
            return Ok(Some(existing.id));
        }

        let event = ExperimentEvent {
            experiment_record_id: experiment.id,
            experiment_id: experiment_id.to_string(),
            run_id: run_id.to_string(),
            coachee_id: run.coachee_id.clone(),
            idempotency_key: key.as_str().to_string(),
            attempt: detection.attempt,
            count_attempts: detection.count_attempts,
            evidence_span_ids: detection.evidence_span_ids.clone(),
            created_at: Utc::now(),
        };
        let stored = self.records.create(&event).await?;
        self.flag_run(run_id, "attempt_event_created");

        info!(
            event_name = "worker.attempt.recorded",
            run_id,
            experiment_id,
            attempt = detection.attempt.as_str(),
            event_id = %stored.id,
            "experiment attempt recorded"
        );
        Ok(Some(stored.id))
    }

    /// Downstream records of a passed single-meeting run. Both steps are
    /// keyed, so replaying them for a reused run is a no-op.
    async fn follow_up_single_meeting(
        &self,
        run_id: &str,
        coachee_id: &str,
    ) -> Result<(), OrchestratorError> {
        // The attempt is scored against the experiment the coachee was
        // running before this meeting, so it is recorded first.
        self.create_attempt_event_from_run(run_id).await?;
        self.instantiate(run_id, Some(coachee_id), None, Activation::WhenIdle).await?;
        Ok(())
    }

    async fn follow_up_baseline_pack(
        &self,
        run_id: &str,
        pack_record_id: &str,
        coachee_id: &str,
    ) -> Result<(), OrchestratorError> {
        let experiment = self
            .instantiate(run_id, Some(coachee_id), Some(pack_record_id), Activation::Always)
            .await?;
        if let Some(experiment_id) = experiment {
            self.records
                .patch::<BaselinePack>(pack_record_id, json!({ "active_experiment_id": experiment_id }))
                .await?;
        }
        Ok(())
    }

    async fn instantiate(
        &self,
        run_id: &str,
        coachee_id: Option<&str>,
        baseline_pack_id: Option<&str>,
        activation: Activation,
    ) -> Result<Option<String>, OrchestratorError> {
        let resolver = IdempotencyResolver::new(&self.records);
        if let Some(existing) = resolver.check_experiment_exists(run_id).await? {
            let coachee_id = coachee_id.unwrap_or(existing.value.coachee_id.as_str());
            self.activate(coachee_id, &existing.id, activation).await?;
            return Ok(Some(existing.id));
        }

        let run = self.records.get::<Run>(run_id).await?.value;
        if !run.gate1_passed {
            warn!(event_name = "worker.experiment.skipped", run_id, "run did not pass gate1");
            return Ok(None);
        }
        let Some(output) = parsed_output(&run) else {
            return Ok(None);
        };
        let Some(micro) = output.micro_experiment() else {
            warn!(event_name = "worker.experiment.skipped", run_id, "run proposes no micro experiment");
            return Ok(None);
        };
        if micro.experiment_id.trim().is_empty() || micro.pattern_id.trim().is_empty() {
            warn!(
                event_name = "worker.experiment.skipped",
                run_id,
                "micro experiment lacks an id or pattern"
            );
            return Ok(None);
        }

        let coachee_id = coachee_id.unwrap_or(run.coachee_id.as_str()).to_string();
        let experiment = Experiment {
            experiment_id: micro.experiment_id.clone(),
            coachee_id: coachee_id.clone(),
            title: micro.title.clone(),
            instruction: micro.instruction.clone(),
            success_marker: micro.success_marker.clone(),
            pattern_id: micro.pattern_id.clone(),
            evidence_span_ids: micro.evidence_span_ids.clone(),
            status: ExperimentStatus::Assigned,
            origin_run_id: run_id.to_string(),
            baseline_pack_id: baseline_pack_id.map(str::to_string),
            created_at: Utc::now(),
        };
        let stored = self.records.create(&experiment).await?;
        self.flag_run(run_id, "experiment_instantiated");
        let activated = self.activate(&coachee_id, &stored.id, activation).await?;
        info!(
            event_name = "worker.experiment.created",
            run_id,
            experiment_id = %experiment.experiment_id,
            record_id = %stored.id,
            activated,
            "experiment instantiated"
        );

        Ok(Some(stored.id))
    }

    /// Points the coachee at the experiment. Repeating it is harmless, so a
    /// replayed job repairs a pointer an earlier attempt failed to write.
    async fn activate(
        &self,
        coachee_id: &str,
        experiment_record_id: &str,
        activation: Activation,
    ) -> Result<bool, StoreError> {
        let Some(user) = self.records.find::<User>(coachee_id).await? else {
            warn!(
                event_name = "worker.experiment.activation_skipped",
                coachee_id,
                "no user record for coachee"
            );
            return Ok(false);
        };
        let current = user.value.active_experiment_id.as_deref();
        if current == Some(experiment_record_id) {
            return Ok(true);
        }
        if activation == Activation::WhenIdle && self.is_running(current).await? {
            return Ok(false);
        }

        self.records
            .patch::<User>(coachee_id, json!({ "active_experiment_id": experiment_record_id }))
            .await?;
        Ok(true)
    }

    /// Sets an informational flag on the run without holding up the job.
    fn flag_run(&self, run_id: &str, flag: &'static str) {
        let records = Arc::clone(&self.records);
        let run_id = run_id.to_string();
        let mut patch = Map::new();
        patch.insert(flag.to_string(), Value::Bool(true));
        best_effort::spawn(flag, async move {
            records.patch::<Run>(&run_id, Value::Object(patch)).await.map(|_| ())
        });
    }

    async fn execute(
        &self,
        prompts: &PromptSet,
        user_message: String,
        scope: RunScope<'_>,
    ) -> Result<(String, Gate1Outcome), OrchestratorError> {
        let request = LlmRequest {
            system_prompt: prompts.system_prompt.clone(),
            developer_context: prompts.developer_message.clone(),
            user_payload: user_message,
            model: prompts.model.clone(),
            max_tokens: prompts.max_tokens,
        };
        let response = self.gateway.call(&request).await?;
        let outcome = self.validator.inspect(&response.raw_text);
        info!(
            event_name = "gate1.verdict",
            analysis_type = scope.analysis_type.as_str(),
            key = scope.key.short(),
            passed = outcome.passed(),
            errors = outcome.result.errors().count(),
            warnings = outcome.result.warnings().count(),
            "output validated"
        );

        let run = Run {
            analysis_type: scope.analysis_type,
            idempotency_key: scope.key.as_str().to_string(),
            coachee_id: scope.coachee_id.to_string(),
            run_request_id: scope.run_request_id.map(str::to_string),
            transcript_id: scope.transcript_id.map(str::to_string),
            baseline_pack_id: scope.baseline_pack_id.map(str::to_string),
            target_speaker_label: scope.target_speaker_label.to_string(),
            target_role: scope.target_role.to_string(),
            config_version: prompts.config_version.clone(),
            model: response.model_used,
            usage: response.usage,
            request_payload: request.user_payload,
            raw_output: cap_raw_output(&response.raw_text),
            parsed_output: outcome.parsed.clone(),
            stages: outcome.stages,
            gate1_passed: outcome.passed(),
            issue_count: outcome.result.issues.len(),
            issues: outcome.result.issues.clone(),
            attempt_event_created: false,
            experiment_instantiated: false,
            digest: outcome.parsed.as_ref().map(RunDigest::from_value).unwrap_or_default(),
            created_at: Utc::now(),
        };
        let stored = self.records.create(&run).await?;
        self.store_issues(&stored.id, &run.issues).await?;

        Ok((stored.id, outcome))
    }

    /// Writes the issues of a run that are not stored yet, keyed by position,
    /// so a replay after a partial write fills the gap without duplicates.
    async fn store_issues(&self, run_id: &str, issues: &[ValidationIssue]) -> Result<(), StoreError> {
        if issues.is_empty() {
            return Ok(());
        }
        let stored: HashSet<usize> = self
            .records
            .search::<StoredIssue>(&Filter::eq("run_id", run_id), issues.len() * 2)
            .await?
            .into_iter()
            .map(|stored| stored.value.position)
            .collect();

        for (position, issue) in issues.iter().enumerate() {
            if stored.contains(&position) {
                continue;
            }
            self.records
                .create(&StoredIssue { run_id: run_id.to_string(), position, issue: issue.clone() })
                .await?;
        }
        Ok(())
    }

    /// Pack status, consistency flags and per-item summaries for a finished
    /// build. Every write is an overwrite, so a replay converges.
    async fn record_pack_build(
        &self,
        pack_record_id: &str,
        pack: &BaselinePack,
        run_id: &str,
        passed: bool,
        inputs: &[PackInput],
    ) -> Result<(), StoreError> {
        let (meetings, summaries) = split_inputs(inputs);
        let prompt = pack_prompt(pack, &meetings, &summaries);
        self.records
            .patch::<BaselinePack>(
                pack_record_id,
                json!({
                    "status": pack_status(passed),
                    "last_run_id": run_id,
                    "role_consistency": prompt.role_consistency(),
                    "meeting_type_consistency": prompt.meeting_type_consistency(),
                    "error": null,
                }),
            )
            .await?;

        for input in inputs {
            self.records
                .patch::<BaselinePackItem>(&input.item_id, json!({ "summary": input.summary }))
                .await?;
        }
        Ok(())
    }

    async fn finish_request(
        &self,
        run_request_id: &str,
        status: RunRequestStatus,
        run_id: &str,
    ) -> Result<(), StoreError> {
        self.records
            .patch::<RunRequest>(
                run_request_id,
                json!({ "status": status, "run_id": run_id, "error": null }),
            )
            .await
            .map(|_| ())
    }

    /// The active stored prompt config when there is one, the file-based
    /// prompts otherwise.
    async fn active_prompts(&self) -> Result<PromptSet, StoreError> {
        let Some(stored) = self.records.first::<PromptConfig>(&Filter::eq("active", true)).await? else {
            return Ok(self.prompts.clone());
        };

        let pinned = self.validator.registry().schema_version();
        if stored.value.schema_version != pinned {
            warn!(
                event_name = "worker.prompt_config.schema_mismatch",
                config_version = %stored.value.config_version,
                config_schema = %stored.value.schema_version,
                pinned_schema = pinned,
                "active prompt config targets a different schema version"
            );
        }
        Ok(self.prompts.with_override(&stored.value))
    }

    async fn memory_for(&self, coachee_id: &str) -> Result<MemoryBlock, StoreError> {
        let Some(user) = self.records.find::<User>(coachee_id).await? else {
            return Ok(MemoryBlock::default());
        };

        let mut baseline = None;
        if let Some(pack_id) = user.value.active_baseline_pack_id.as_deref() {
            if let Some(pack) = self.records.find::<BaselinePack>(pack_id).await? {
                let last_run = match pack.value.last_run_id.as_deref() {
                    Some(run_id) => self.records.find::<Run>(run_id).await?,
                    None => None,
                };
                baseline = Some(BaselineProfile {
                    strengths: last_run.as_ref().map(|run| run.value.digest.strengths.clone()).unwrap_or_default(),
                    focus: last_run.and_then(|run| run.value.digest.focus_pattern),
                    baseline_pack_id: pack.value.baseline_pack_id,
                });
            }
        }

        let mut experiment = None;
        if let Some(experiment_id) = user.value.active_experiment_id.as_deref() {
            experiment = self.records.find::<Experiment>(experiment_id).await?.map(|stored| {
                let stored = stored.value;
                ExperimentMemory {
                    experiment_id: stored.experiment_id,
                    title: stored.title,
                    instruction: stored.instruction,
                    success_marker: stored.success_marker,
                    pattern_id: stored.pattern_id,
                    status: stored.status.as_str().to_string(),
                }
            });
        }

        Ok(MemoryBlock::new(baseline, experiment, Vec::new()))
    }

    async fn is_running(&self, experiment_record_id: Option<&str>) -> Result<bool, StoreError> {
        let Some(experiment_id) = experiment_record_id else {
            return Ok(false);
        };
        Ok(self
            .records
            .find::<Experiment>(experiment_id)
            .await?
            .is_some_and(|experiment| experiment.value.status.accepts_attempts()))
    }

    async fn pack_inputs(
        &self,
        pack_record_id: &str,
        pack: &BaselinePack,
    ) -> Result<Vec<PackInput>, OrchestratorError> {
        let mut items = self
            .records
            .search::<BaselinePackItem>(
                &Filter::eq("baseline_pack_id", pack_record_id),
                BASELINE_PACK_SIZE + 1,
            )
            .await?;
        if items.len() != BASELINE_PACK_SIZE {
            return Err(precondition(format!(
                "baseline pack {} has {} items, expected {BASELINE_PACK_SIZE}",
                pack.baseline_pack_id,
                items.len()
            )));
        }
        items.sort_by_key(|item| item.value.sequence);

        let mut inputs = Vec::with_capacity(items.len());
        for item in items {
            let sequence = item.value.sequence;
            let Some(run_id) = item.value.run_id.as_deref() else {
                return Err(precondition(format!("pack item {sequence} has no linked run")));
            };
            let Some(run) = self.records.find::<Run>(run_id).await? else {
                return Err(precondition(format!("pack item {sequence} links missing run {run_id}")));
            };
            let run = run.value;
            if run.analysis_type != AnalysisType::SingleMeeting || !run.gate1_passed {
                return Err(precondition(format!(
                    "pack item {sequence} run {run_id} is not a passed single_meeting analysis"
                )));
            }
            let Some(output) = parsed_output(&run) else {
                return Err(precondition(format!("run {run_id} has no readable output")));
            };

            let summary =
                MeetingSummary::from_output(&output, &pack.target_speaker_name, &run.target_speaker_label);
            let meeting = PackMeeting {
                meeting_id: summary.meeting_id.clone().unwrap_or_else(|| item.value.meeting_id.clone()),
                meeting_type: summary
                    .meeting_type
                    .clone()
                    .unwrap_or_else(|| item.value.meeting_type.clone()),
                target_speaker_name: pack.target_speaker_name.clone(),
                target_speaker_label: run.target_speaker_label.clone(),
                target_speaker_role: summary.target_role.clone(),
            };
            inputs.push(PackInput { item_id: item.id, meeting, summary });
        }
        Ok(inputs)
    }
}

fn pack_status(passed: bool) -> BaselinePackStatus {
    if passed {
        BaselinePackStatus::Ready
    } else {
        BaselinePackStatus::Gate1Failed
    }
}

fn split_inputs(inputs: &[PackInput]) -> (Vec<PackMeeting>, Vec<MeetingSummary>) {
    inputs.iter().map(|input| (input.meeting.clone(), input.summary.clone())).unzip()
}

fn pack_prompt<'a>(
    pack: &'a BaselinePack,
    meetings: &'a [PackMeeting],
    summaries: &'a [MeetingSummary],
) -> BaselinePackPrompt<'a> {
    let fallback_role = meetings.first().map_or("", |meeting| meeting.target_speaker_role.as_str());
    BaselinePackPrompt {
        baseline_pack_id: &pack.baseline_pack_id,
        target_role: fallback_role,
        meetings,
        summaries,
    }
}

fn parsed_output(run: &Run) -> Option<AnalysisOutput> {
    run.parsed_output.as_ref().and_then(|value| AnalysisOutput::from_value(value).ok())
}

fn cap_raw_output(raw: &str) -> String {
    match raw.char_indices().nth(RAW_OUTPUT_LIMIT) {
        Some((end, _)) => raw[..end].to_string(),
        None => raw.to_string(),
    }
}
