use std::sync::Arc;
use std::time::Duration;

use huddle_agent::LlmGateway;
use huddle_core::config::WorkerConfig;
use huddle_core::domain::baseline::{BaselinePack, BaselinePackStatus};
use huddle_core::domain::run::{RunRequest, RunRequestStatus};
use huddle_core::retry::{RetryError, RetryPolicy};
use huddle_db::RecordStore;
use serde_json::json;

use crate::orchestrator::{OrchestratorError, RunOrchestrator, RunOutcome};

/// Backoff never grows past this multiple of the base delay.
const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    SingleMeeting { run_request_id: String },
    BaselinePack { baseline_pack_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SingleMeeting { .. } => "single_meeting",
            Self::BaselinePack { .. } => "baseline_pack",
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            Self::SingleMeeting { run_request_id } => run_request_id,
            Self::BaselinePack { baseline_pack_id } => baseline_pack_id,
        }
    }
}

/// Executes jobs with task-level retries. Pack builds cost three times the
/// tokens of a single meeting and get the lower ceiling.
pub struct JobRunner<S, G> {
    orchestrator: Arc<RunOrchestrator<S, G>>,
    single_meeting: RetryPolicy,
    baseline_pack: RetryPolicy,
    error_message_limit: usize,
}

impl<S, G> JobRunner<S, G>
where
    S: RecordStore + 'static,
    G: LlmGateway,
{
    pub fn new(
        orchestrator: Arc<RunOrchestrator<S, G>>,
        single_meeting: RetryPolicy,
        baseline_pack: RetryPolicy,
        error_message_limit: usize,
    ) -> Self {
        Self { orchestrator, single_meeting, baseline_pack, error_message_limit }
    }

    pub fn from_config(orchestrator: Arc<RunOrchestrator<S, G>>, config: &WorkerConfig) -> Self {
        Self::new(
            orchestrator,
            task_policy(config.single_meeting_max_retries, config.single_meeting_retry_delay_secs),
            task_policy(config.baseline_pack_max_retries, config.baseline_pack_retry_delay_secs),
            config.error_message_limit,
        )
    }

    pub fn orchestrator(&self) -> &RunOrchestrator<S, G> {
        &self.orchestrator
    }

    pub async fn run(&self, job: &Job) -> Result<RunOutcome, OrchestratorError> {
        let policy = match job {
            Job::SingleMeeting { .. } => &self.single_meeting,
            Job::BaselinePack { .. } => &self.baseline_pack,
        };
        let operation = format!("worker.{}", job.kind());

        policy
            .run(&operation, || self.attempt(job), OrchestratorError::is_retryable)
            .await
            .map_err(|error| {
                let attempts = match &error {
                    RetryError::Exhausted { attempts, .. } => *attempts,
                    RetryError::Fatal(_) => 1,
                };
                let error = error.into_inner();
                tracing::error!(
                    event_name = "worker.job.failed",
                    job = job.kind(),
                    record_id = job.record_id(),
                    attempts,
                    error_class = error.error_class(),
                    error = %error,
                    "job failed"
                );
                error
            })
    }

    async fn attempt(&self, job: &Job) -> Result<RunOutcome, OrchestratorError> {
        let result = match job {
            Job::SingleMeeting { run_request_id } => {
                self.orchestrator.process_single_meeting(run_request_id).await
            }
            Job::BaselinePack { baseline_pack_id } => {
                self.orchestrator.process_baseline_pack(baseline_pack_id).await
            }
        };

        if let Err(error) = &result {
            self.mark_failed(job, error).await;
        }
        result
    }

    /// Leaves a human-visible status on the originating record. A failure to
    /// write it is logged; the job error is what propagates.
    async fn mark_failed(&self, job: &Job, error: &OrchestratorError) {
        let message = truncate(&error.to_string(), self.error_message_limit);
        let records = self.orchestrator.records();
        let written = match job {
            Job::SingleMeeting { run_request_id } => records
                .patch::<RunRequest>(
                    run_request_id,
                    json!({ "status": RunRequestStatus::Error, "error": message }),
                )
                .await
                .map(|_| ()),
            Job::BaselinePack { baseline_pack_id } => records
                .patch::<BaselinePack>(
                    baseline_pack_id,
                    json!({ "status": BaselinePackStatus::Error, "error": message }),
                )
                .await
                .map(|_| ()),
        };

        if let Err(store_error) = written {
            tracing::warn!(
                event_name = "worker.job.mark_failed_error",
                job = job.kind(),
                record_id = job.record_id(),
                error = %store_error,
                "could not record job failure"
            );
        }
    }
}

fn task_policy(max_retries: u32, delay_secs: u64) -> RetryPolicy {
    let base = Duration::from_secs(delay_secs);
    RetryPolicy::new(max_retries.saturating_add(1), base, base.saturating_mul(MAX_BACKOFF_FACTOR))
}

fn truncate(message: &str, limit: usize) -> String {
    message.chars().take(limit).collect()
}
