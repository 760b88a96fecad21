use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use huddle_agent::{LlmError, ScriptedGateway};
use huddle_core::domain::baseline::{BaselinePack, BaselinePackItem, BaselinePackStatus, Consistency};
use huddle_core::domain::coachee::{PromptConfig, User};
use huddle_core::domain::experiment::{AttemptOutcome, Experiment, ExperimentEvent, ExperimentStatus};
use huddle_core::domain::run::{AnalysisType, Run, RunRequest, RunRequestStatus};
use huddle_core::domain::transcript::{Transcript, Turn};
use huddle_core::gate1::{Gate1Validator, IssueCode, SchemaRegistry};
use huddle_core::retry::RetryPolicy;
use async_trait::async_trait;
use huddle_db::{Fields, Filter, InMemoryRecordStore, Record, RecordStore, Records, StoreError, StoredIssue, Table};
use huddle_worker::{Job, JobRunner, OrchestratorError, PromptSet, RunOrchestrator};
use serde_json::{json, Value};

type FlowResult = Result<(), String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        match (&$left, &$right) {
            (left, right) => {
                if left != right {
                    return Err(format!(
                        "`{}` != `{}`: {:?} vs {:?}",
                        stringify!($left),
                        stringify!($right),
                        left,
                        right
                    ));
                }
            }
        }
    };
}

const VALID_SINGLE_MEETING: &str = include_str!("../../core/tests/fixtures/valid_single_meeting.json");

/// One write that fails with a transient error the first time it is tried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    Create(Table),
    Update(Table),
}

/// In-memory store with armed one-shot write failures.
#[derive(Default)]
struct Store {
    inner: InMemoryRecordStore,
    faults: Mutex<Vec<Fault>>,
}

impl Store {
    fn arm(&self, fault: Fault) {
        self.faults.lock().expect("fault list").push(fault);
    }

    fn trip(&self, fault: Fault) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().expect("fault list");
        match faults.iter().position(|armed| *armed == fault) {
            Some(index) => {
                faults.remove(index);
                Err(StoreError::RateLimited)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for Store {
    async fn get(&self, table: Table, id: &str) -> Result<Record, StoreError> {
        self.inner.get(table, id).await
    }

    async fn create(&self, table: Table, fields: Fields) -> Result<Record, StoreError> {
        self.trip(Fault::Create(table))?;
        self.inner.create(table, fields).await
    }

    async fn update(&self, table: Table, id: &str, fields: Fields) -> Result<Record, StoreError> {
        self.trip(Fault::Update(table))?;
        self.inner.update(table, id, fields).await
    }

    async fn update_if(
        &self,
        table: Table,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Record>, StoreError> {
        self.trip(Fault::Update(table))?;
        self.inner.update_if(table, id, expected, fields).await
    }

    async fn search(
        &self,
        table: Table,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.search(table, filter, limit).await
    }
}

type Orchestrator = RunOrchestrator<Store, Arc<ScriptedGateway>>;

struct Harness {
    records: Arc<Records<Store>>,
    gateway: Arc<ScriptedGateway>,
    orchestrator: Arc<Orchestrator>,
    coachee_id: String,
}

fn validator() -> Gate1Validator {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../schemas/contract.toml");
    let registry = SchemaRegistry::load(manifest).expect("bundled contract should load");
    Gate1Validator::new(Arc::new(registry))
}

fn prompts() -> PromptSet {
    PromptSet {
        config_version: "1".to_string(),
        system_prompt: "You are a meeting coach.".to_string(),
        developer_message: String::new(),
        model: "gpt-4o".to_string(),
        max_tokens: 8192,
    }
}

fn single_meeting_output() -> Value {
    serde_json::from_str(VALID_SINGLE_MEETING).expect("fixture is valid JSON")
}

/// The same meeting, now tracking a running experiment the coachee attempted.
fn output_with_attempt() -> Value {
    let mut output = single_meeting_output();
    output["experiment_tracking"] = json!({
        "active_experiment": {"experiment_id": "EXP-000001", "status": "active"},
        "detection_in_this_meeting": {
            "experiment_id": "EXP-000001",
            "attempt": "yes",
            "count_attempts": 2,
            "evidence_span_ids": ["ES-006"]
        }
    });
    output["coaching_output"]["micro_experiment"][0]["experiment_id"] = json!("EXP-000002");
    output
}

fn baseline_pack_output() -> Value {
    let mut output = single_meeting_output();
    output["meta"]["analysis_type"] = json!("baseline_pack");
    output["context"]["baseline_pack_id"] = json!("BP-000001");
    output
}

async fn harness(gateway: ScriptedGateway) -> Harness {
    let records = Arc::new(Records::new(Store::default()));
    let gateway = Arc::new(gateway);
    let orchestrator = Arc::new(RunOrchestrator::new(
        Arc::clone(&records),
        Arc::clone(&gateway),
        validator(),
        prompts(),
    ));
    let user = records
        .create(&User {
            email: "alice@example.com".to_string(),
            name: "Alice".to_string(),
            active_baseline_pack_id: None,
            active_experiment_id: None,
        })
        .await
        .expect("seed user");

    Harness { records, gateway, orchestrator, coachee_id: user.id }
}

impl Harness {
    async fn transcript(&self, meeting_id: &str) -> String {
        let turn = |turn_id: u32, speaker_label: &str, text: &str| Turn {
            turn_id,
            speaker_label: speaker_label.to_string(),
            text: text.to_string(),
            speaker_role_hint: None,
        };
        self.records
            .create(&Transcript {
                meeting_id: meeting_id.to_string(),
                meeting_type: "exec_staff".to_string(),
                meeting_date: Some("2026-02-12".to_string()),
                title: Some("Weekly staff".to_string()),
                turns: vec![
                    turn(1, "Alice", "Alright, let's get started."),
                    turn(2, "Bob", "Sounds good."),
                    turn(3, "Alice", "We need to decide on the budget today."),
                ],
                speaker_labels: Vec::new(),
            })
            .await
            .expect("seed transcript")
            .id
    }

    async fn request(&self, transcript_id: &str) -> String {
        self.records
            .create(&RunRequest {
                transcript_id: transcript_id.to_string(),
                coachee_id: self.coachee_id.clone(),
                analysis_type: AnalysisType::SingleMeeting,
                target_speaker_name: "Alice".to_string(),
                target_speaker_label: "Alice".to_string(),
                target_role: "chair".to_string(),
                status: RunRequestStatus::Queued,
                run_id: None,
                error: None,
            })
            .await
            .expect("seed run request")
            .id
    }

    async fn user(&self) -> User {
        self.records.get::<User>(&self.coachee_id).await.expect("user").value
    }

    async fn experiments(&self) -> Vec<Experiment> {
        self.records
            .search::<Experiment>(&Filter::all(), 50)
            .await
            .expect("experiments")
            .into_iter()
            .map(|stored| stored.value)
            .collect()
    }
}

/// Lets detached best-effort tasks run to completion.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn passed_single_meeting_completes_request_and_assigns_experiment() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;

    let outcome = h.orchestrator.process_single_meeting(&request_id).await.map_err(|e| e.to_string())?;
    require!(outcome.gate1_passed);
    require!(!outcome.reused);

    let request = h.records.get::<RunRequest>(&request_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(request.status, RunRequestStatus::Completed);
    require_eq!(request.run_id.as_deref(), Some(outcome.run_id.as_str()));

    let run = h.records.get::<Run>(&outcome.run_id).await.map_err(|e| e.to_string())?.value;
    require!(run.stages.parse_ok && run.stages.schema_ok && run.stages.business_ok);
    require_eq!(run.idempotency_key.len(), 64);
    require_eq!(run.digest.focus_pattern.as_deref(), Some("decision_closure"));
    require_eq!(run.digest.strengths, vec!["agenda_clarity".to_string()]);
    require_eq!(run.issue_count, 0);
    require!(run.request_payload.contains("INPUT_PAYLOAD"));

    let experiments = h.experiments().await;
    require_eq!(experiments.len(), 1);
    require_eq!(experiments[0].origin_run_id, outcome.run_id);
    require_eq!(experiments[0].status, ExperimentStatus::Assigned);
    require_eq!(experiments[0].experiment_id, "EXP-000001");

    settle().await;
    let run = h.records.get::<Run>(&outcome.run_id).await.map_err(|e| e.to_string())?.value;
    require!(run.experiment_instantiated);
    let experiment_record = h
        .records
        .first::<Experiment>(&Filter::eq("origin_run_id", outcome.run_id.as_str()))
        .await
        .map_err(|e| e.to_string())?
        .ok_or("experiment record")?;
    require_eq!(h.user().await.active_experiment_id, Some(experiment_record.id));
    Ok(())
}

#[tokio::test]
async fn repeated_requests_reuse_the_existing_run() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let transcript_id = h.transcript("M-000001").await;
    let first = h.request(&transcript_id).await;
    let duplicate = h.request(&transcript_id).await;

    let original = h.orchestrator.process_single_meeting(&first).await.map_err(|e| e.to_string())?;
    let reused = h.orchestrator.process_single_meeting(&duplicate).await.map_err(|e| e.to_string())?;
    let replayed = h.orchestrator.process_single_meeting(&first).await.map_err(|e| e.to_string())?;

    require!(reused.reused && replayed.reused);
    require_eq!(reused.run_id, original.run_id);
    require_eq!(replayed.run_id, original.run_id);
    require_eq!(h.gateway.call_count(), 1);

    let duplicate = h.records.get::<RunRequest>(&duplicate).await.map_err(|e| e.to_string())?.value;
    require_eq!(duplicate.status, RunRequestStatus::Completed);
    require_eq!(duplicate.run_id, Some(original.run_id.clone()));

    let runs = h.records.search::<Run>(&Filter::all(), 10).await.map_err(|e| e.to_string())?;
    require_eq!(runs.len(), 1);
    require_eq!(h.experiments().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn unparseable_output_is_a_gate1_failure_with_stored_issues() -> FlowResult {
    let h = harness(ScriptedGateway::always("Sure! Here is the analysis you asked for.")).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;

    let outcome = h.orchestrator.process_single_meeting(&request_id).await.map_err(|e| e.to_string())?;
    require!(!outcome.gate1_passed);

    let request = h.records.get::<RunRequest>(&request_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(request.status, RunRequestStatus::Gate1Failed);
    require_eq!(request.error, None);

    let run = h.records.get::<Run>(&outcome.run_id).await.map_err(|e| e.to_string())?.value;
    require!(!run.gate1_passed);
    require!(!run.stages.parse_ok);
    require!(run.parsed_output.is_none());
    require_eq!(run.raw_output, "Sure! Here is the analysis you asked for.");

    let issues = h
        .records
        .search::<StoredIssue>(&Filter::eq("run_id", outcome.run_id.as_str()), 10)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(issues.len(), run.issue_count);
    require!(issues.iter().any(|stored| stored.value.issue.issue_code == IssueCode::JsonParseError));
    require!(h.experiments().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn detected_attempt_is_recorded_once_against_the_running_experiment() -> FlowResult {
    let h = harness(ScriptedGateway::always(output_with_attempt().to_string())).await;
    let running = h
        .records
        .create(&Experiment {
            experiment_id: "EXP-000001".to_string(),
            coachee_id: h.coachee_id.clone(),
            title: "Close every decision out loud".to_string(),
            instruction: "Say who owns each decision.".to_string(),
            success_marker: "Two of three decisions closed aloud.".to_string(),
            pattern_id: "decision_closure".to_string(),
            evidence_span_ids: vec!["ES-006".to_string()],
            status: ExperimentStatus::Active,
            origin_run_id: "rec_prior_run".to_string(),
            baseline_pack_id: None,
            created_at: chrono::Utc::now(),
        })
        .await
        .map_err(|e| e.to_string())?;
    h.records
        .patch::<User>(&h.coachee_id, json!({ "active_experiment_id": running.id }))
        .await
        .map_err(|e| e.to_string())?;

    let transcript_id = h.transcript("M-000002").await;
    let request_id = h.request(&transcript_id).await;
    let outcome = h.orchestrator.process_single_meeting(&request_id).await.map_err(|e| e.to_string())?;
    require!(outcome.gate1_passed);

    // The running experiment travels in the request memory.
    let calls = h.gateway.calls();
    require!(calls[0].user_payload.contains("Close every decision out loud"));

    let events = h
        .records
        .search::<ExperimentEvent>(&Filter::eq("run_id", outcome.run_id.as_str()), 10)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(events.len(), 1);
    let event = &events[0].value;
    require_eq!(event.experiment_record_id, running.id);
    require_eq!(event.attempt, AttemptOutcome::Yes);
    require_eq!(event.count_attempts, Some(2));
    require_eq!(event.evidence_span_ids, vec!["ES-006".to_string()]);

    let again = h
        .orchestrator
        .create_attempt_event_from_run(&outcome.run_id)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(again, Some(events[0].id.clone()));

    // The newly proposed experiment is stored but does not displace the running one.
    settle().await;
    let run = h.records.get::<Run>(&outcome.run_id).await.map_err(|e| e.to_string())?.value;
    require!(run.attempt_event_created);
    require_eq!(h.experiments().await.len(), 2);
    require_eq!(h.user().await.active_experiment_id, Some(running.id.clone()));
    Ok(())
}

#[tokio::test]
async fn stored_prompt_config_replaces_file_prompts_and_versions_the_key() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let transcript_id = h.transcript("M-000001").await;
    let first = h.request(&transcript_id).await;
    let original = h.orchestrator.process_single_meeting(&first).await.map_err(|e| e.to_string())?;

    h.records
        .create(&PromptConfig {
            config_version: "2".to_string(),
            schema_version: "mvp.v0.2.1".to_string(),
            system_prompt: Some("You are a stricter meeting coach.".to_string()),
            developer_message: Some("Taxonomy v1.4".to_string()),
            model: Some("gpt-4.1".to_string()),
            max_tokens: Some(4096),
            active: true,
        })
        .await
        .map_err(|e| e.to_string())?;

    let second = h.request(&transcript_id).await;
    let rerun = h.orchestrator.process_single_meeting(&second).await.map_err(|e| e.to_string())?;
    require!(!rerun.reused, "a new config version must not reuse the old run");
    require!(rerun.run_id != original.run_id);

    let calls = h.gateway.calls();
    require_eq!(calls.len(), 2);
    require_eq!(calls[1].system_prompt, "You are a stricter meeting coach.");
    require_eq!(calls[1].developer_context, "Taxonomy v1.4");
    require_eq!(calls[1].model, "gpt-4.1");
    require_eq!(calls[1].max_tokens, 4096);

    let run = h.records.get::<Run>(&rerun.run_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(run.config_version, "2");
    Ok(())
}

#[tokio::test]
async fn finished_request_is_not_rerun() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;
    h.records
        .patch::<RunRequest>(&request_id, json!({ "status": RunRequestStatus::Completed }))
        .await
        .map_err(|e| e.to_string())?;

    let error = match h.orchestrator.process_single_meeting(&request_id).await {
        Ok(outcome) => return Err(format!("completed request was processed again: {outcome:?}")),
        Err(error) => error,
    };
    require_eq!(error.error_class(), "domain");
    require!(!error.is_retryable());
    require_eq!(h.gateway.call_count(), 0);
    Ok(())
}

async fn seed_pack(h: &Harness, run_ids: &[String]) -> Result<String, String> {
    let pack = h
        .records
        .create(&BaselinePack {
            baseline_pack_id: "BP-000001".to_string(),
            coachee_id: h.coachee_id.clone(),
            target_speaker_name: "Alice".to_string(),
            target_speaker_label: "Alice".to_string(),
            status: BaselinePackStatus::Queued,
            last_run_id: None,
            active_experiment_id: None,
            role_consistency: None,
            meeting_type_consistency: None,
            error: None,
        })
        .await
        .map_err(|e| e.to_string())?;

    for (sequence, run_id) in (1u32..).zip(run_ids) {
        h.records
            .create(&BaselinePackItem {
                baseline_pack_id: pack.id.clone(),
                sequence,
                transcript_id: format!("rec_tr_{sequence}"),
                meeting_id: format!("M-00000{sequence}"),
                meeting_type: "exec_staff".to_string(),
                target_role: "chair".to_string(),
                run_id: Some(run_id.clone()),
                summary: None,
            })
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(pack.id)
}

async fn passed_runs(h: &Harness, count: usize) -> Result<Vec<String>, String> {
    let mut run_ids = Vec::new();
    for index in 1..=count {
        let transcript_id = h.transcript(&format!("M-00000{index}")).await;
        let request_id = h.request(&transcript_id).await;
        let outcome = h
            .orchestrator
            .process_single_meeting(&request_id)
            .await
            .map_err(|e| e.to_string())?;
        settle().await;
        run_ids.push(outcome.run_id);
    }
    Ok(run_ids)
}

#[tokio::test]
async fn baseline_pack_build_summarizes_items_and_activates_experiment() -> FlowResult {
    let gateway = ScriptedGateway::new()
        .then_text(VALID_SINGLE_MEETING)
        .then_text(VALID_SINGLE_MEETING)
        .then_text(VALID_SINGLE_MEETING)
        .then_text(baseline_pack_output().to_string());
    let h = harness(gateway).await;
    let run_ids = passed_runs(&h, 3).await?;
    let pack_id = seed_pack(&h, &run_ids).await?;

    let outcome = h.orchestrator.process_baseline_pack(&pack_id).await.map_err(|e| e.to_string())?;
    require!(outcome.gate1_passed);
    require_eq!(h.gateway.call_count(), 4);
    require!(h.gateway.calls()[3].user_payload.contains("BASELINE PACK INPUT (3 meetings)"));

    let pack = h.records.get::<BaselinePack>(&pack_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(pack.status, BaselinePackStatus::Ready);
    require_eq!(pack.last_run_id.as_deref(), Some(outcome.run_id.as_str()));
    require_eq!(pack.role_consistency, Some(Consistency::Consistent));
    require_eq!(pack.meeting_type_consistency, Some(Consistency::Consistent));

    let run = h.records.get::<Run>(&outcome.run_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(run.analysis_type, AnalysisType::BaselinePack);
    require_eq!(run.baseline_pack_id.as_deref(), Some(pack_id.as_str()));
    require_eq!(run.target_role, "chair");

    let items = h
        .records
        .search::<BaselinePackItem>(&Filter::eq("baseline_pack_id", pack_id.as_str()), 10)
        .await
        .map_err(|e| e.to_string())?;
    require!(items.iter().all(|item| item.value.summary.is_some()));
    require_eq!(
        items[0].value.summary.as_ref().and_then(|summary| summary["analysis_id"].as_str()),
        Some("A-260227")
    );

    let experiment = h
        .records
        .first::<Experiment>(&Filter::eq("origin_run_id", outcome.run_id.as_str()))
        .await
        .map_err(|e| e.to_string())?
        .ok_or("pack experiment")?;
    require_eq!(experiment.value.baseline_pack_id.as_deref(), Some(pack_id.as_str()));
    require_eq!(pack.active_experiment_id, Some(experiment.id.clone()));

    settle().await;
    require_eq!(h.user().await.active_experiment_id, Some(experiment.id.clone()));

    let rebuilt = h.orchestrator.process_baseline_pack(&pack_id).await.map_err(|e| e.to_string())?;
    require!(rebuilt.reused);
    require_eq!(rebuilt.run_id, outcome.run_id);
    require_eq!(h.gateway.call_count(), 4);
    Ok(())
}

#[tokio::test]
async fn baseline_pack_missing_items_is_a_fatal_precondition() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let run_ids = passed_runs(&h, 2).await?;
    let pack_id = seed_pack(&h, &run_ids).await?;

    let error = match h.orchestrator.process_baseline_pack(&pack_id).await {
        Ok(outcome) => return Err(format!("pack with two items built: {outcome:?}")),
        Err(error) => error,
    };
    require!(matches!(error, OrchestratorError::Precondition(_)), "{error}");
    require!(!error.is_retryable());
    require_eq!(h.gateway.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn baseline_pack_rejects_failed_prerequisite_runs() -> FlowResult {
    let gateway = ScriptedGateway::new()
        .then_text(VALID_SINGLE_MEETING)
        .then_text("not json")
        .then_text(VALID_SINGLE_MEETING);
    let h = harness(gateway).await;
    let run_ids = passed_runs(&h, 3).await?;
    let pack_id = seed_pack(&h, &run_ids).await?;

    let error = match h.orchestrator.process_baseline_pack(&pack_id).await {
        Ok(outcome) => return Err(format!("pack with a failed run built: {outcome:?}")),
        Err(error) => error,
    };
    require_eq!(error.error_class(), "precondition");
    require!(error.to_string().contains("pack item 2"), "{error}");
    Ok(())
}

fn instant(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO)
}

#[tokio::test]
async fn runner_retries_transient_llm_failures() -> FlowResult {
    let gateway = ScriptedGateway::new()
        .then_error(LlmError::Status { status: 503, body: "overloaded".to_string() })
        .then_text(VALID_SINGLE_MEETING);
    let h = harness(gateway).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;
    let runner = JobRunner::new(Arc::clone(&h.orchestrator), instant(4), instant(3), 200);

    let outcome = runner
        .run(&Job::SingleMeeting { run_request_id: request_id.clone() })
        .await
        .map_err(|e| e.to_string())?;

    require!(outcome.gate1_passed);
    require_eq!(h.gateway.call_count(), 2);
    let request = h.records.get::<RunRequest>(&request_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(request.status, RunRequestStatus::Completed);
    require_eq!(request.error, None);
    Ok(())
}

#[tokio::test]
async fn runner_marks_fatal_failures_with_truncated_error() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let pack_id = seed_pack(&h, &[]).await?;
    let runner = JobRunner::new(Arc::clone(&h.orchestrator), instant(4), instant(3), 20);

    let result = runner.run(&Job::BaselinePack { baseline_pack_id: pack_id.clone() }).await;
    require!(result.is_err());
    require_eq!(h.gateway.call_count(), 0);

    let pack = h.records.get::<BaselinePack>(&pack_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(pack.status, BaselinePackStatus::Error);
    let message = pack.error.ok_or("error message")?;
    require_eq!(message, "missing prerequisite");
    Ok(())
}

#[tokio::test]
async fn runner_gives_up_after_the_ceiling() -> FlowResult {
    let gateway = ScriptedGateway::new()
        .then_error(LlmError::Timeout)
        .then_error(LlmError::Timeout)
        .then_text(VALID_SINGLE_MEETING);
    let h = harness(gateway).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;
    let runner = JobRunner::new(Arc::clone(&h.orchestrator), instant(2), instant(2), 200);

    let result = runner.run(&Job::SingleMeeting { run_request_id: request_id.clone() }).await;
    require!(matches!(result, Err(OrchestratorError::Llm(LlmError::Timeout))));
    require_eq!(h.gateway.call_count(), 2);

    let request = h.records.get::<RunRequest>(&request_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(request.status, RunRequestStatus::Error);
    require_eq!(request.error.as_deref(), Some("llm call timed out"));
    Ok(())
}

#[tokio::test]
async fn issue_write_failure_is_repaired_when_the_run_is_reused() -> FlowResult {
    let h = harness(ScriptedGateway::always("not json")).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;
    h.records.store().arm(Fault::Create(Table::ValidationIssues));
    let runner = JobRunner::new(Arc::clone(&h.orchestrator), instant(3), instant(3), 200);

    let outcome = runner
        .run(&Job::SingleMeeting { run_request_id: request_id.clone() })
        .await
        .map_err(|e| e.to_string())?;
    require!(outcome.reused);
    require!(!outcome.gate1_passed);
    require_eq!(h.gateway.call_count(), 1);

    let run = h.records.get::<Run>(&outcome.run_id).await.map_err(|e| e.to_string())?.value;
    let issues = h
        .records
        .search::<StoredIssue>(&Filter::eq("run_id", outcome.run_id.as_str()), 10)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(run.issue_count, 1);
    require_eq!(issues.len(), run.issue_count);
    require_eq!(issues[0].value.issue.issue_code, IssueCode::JsonParseError);

    let request = h.records.get::<RunRequest>(&request_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(request.status, RunRequestStatus::Gate1Failed);

    // Replaying a complete run does not duplicate its issues.
    h.orchestrator.process_single_meeting(&request_id).await.map_err(|e| e.to_string())?;
    let replayed = h
        .records
        .search::<StoredIssue>(&Filter::eq("run_id", outcome.run_id.as_str()), 10)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(replayed.len(), 1);
    Ok(())
}

#[tokio::test]
async fn pack_item_summaries_are_written_when_the_build_is_reused() -> FlowResult {
    let gateway = ScriptedGateway::new()
        .then_text(VALID_SINGLE_MEETING)
        .then_text(VALID_SINGLE_MEETING)
        .then_text(VALID_SINGLE_MEETING)
        .then_text(baseline_pack_output().to_string());
    let h = harness(gateway).await;
    let run_ids = passed_runs(&h, 3).await?;
    let pack_id = seed_pack(&h, &run_ids).await?;
    h.records.store().arm(Fault::Update(Table::BaselinePackItems));
    let runner = JobRunner::new(Arc::clone(&h.orchestrator), instant(3), instant(3), 200);

    let outcome = runner
        .run(&Job::BaselinePack { baseline_pack_id: pack_id.clone() })
        .await
        .map_err(|e| e.to_string())?;
    require!(outcome.reused);
    require!(outcome.gate1_passed);
    require_eq!(h.gateway.call_count(), 4);

    let pack = h.records.get::<BaselinePack>(&pack_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(pack.status, BaselinePackStatus::Ready);
    require_eq!(pack.last_run_id.as_deref(), Some(outcome.run_id.as_str()));
    require_eq!(pack.role_consistency, Some(Consistency::Consistent));
    require_eq!(pack.meeting_type_consistency, Some(Consistency::Consistent));
    require_eq!(pack.error, None);

    let items = h
        .records
        .search::<BaselinePackItem>(&Filter::eq("baseline_pack_id", pack_id.as_str()), 10)
        .await
        .map_err(|e| e.to_string())?;
    require_eq!(items.len(), 3);
    require!(items.iter().all(|item| item.value.summary.is_some()));
    Ok(())
}

#[tokio::test]
async fn active_experiment_pointer_is_repaired_on_retry() -> FlowResult {
    let h = harness(ScriptedGateway::always(VALID_SINGLE_MEETING)).await;
    let transcript_id = h.transcript("M-000001").await;
    let request_id = h.request(&transcript_id).await;
    h.records.store().arm(Fault::Update(Table::Users));
    let runner = JobRunner::new(Arc::clone(&h.orchestrator), instant(3), instant(3), 200);

    let outcome = runner
        .run(&Job::SingleMeeting { run_request_id: request_id.clone() })
        .await
        .map_err(|e| e.to_string())?;
    require!(outcome.gate1_passed);
    require_eq!(h.gateway.call_count(), 1);
    require_eq!(h.experiments().await.len(), 1);

    let experiment = h
        .records
        .first::<Experiment>(&Filter::eq("origin_run_id", outcome.run_id.as_str()))
        .await
        .map_err(|e| e.to_string())?
        .ok_or("experiment record")?;
    require_eq!(h.user().await.active_experiment_id, Some(experiment.id));

    let request = h.records.get::<RunRequest>(&request_id).await.map_err(|e| e.to_string())?.value;
    require_eq!(request.status, RunRequestStatus::Completed);
    Ok(())
}
