//! Claims queued work from the record store and fans it out to workers.

use std::sync::Arc;
use std::time::Duration;

use huddle_agent::LlmGateway;
use huddle_core::domain::baseline::{BaselinePack, BaselinePackStatus};
use huddle_core::domain::run::{AnalysisType, RunRequest, RunRequestStatus};
use huddle_db::{Filter, RecordStore, Records, StoreError};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::runner::{Job, JobRunner};

pub struct QueuePoller<S> {
    records: Arc<Records<S>>,
    interval: Duration,
    batch_size: usize,
}

impl<S: RecordStore + 'static> QueuePoller<S> {
    pub fn new(records: Arc<Records<S>>, interval: Duration, batch_size: usize) -> Self {
        Self { records, interval, batch_size: batch_size.max(1) }
    }

    /// Moves up to one batch of queued requests and pack builds to their
    /// running state and returns them as jobs. Each move is conditioned on
    /// the record still being queued, so two pollers never claim the same
    /// record.
    pub async fn claim_batch(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();

        let still_queued = Filter::eq("status", RunRequestStatus::Queued.as_str());
        let queued_requests =
            still_queued.clone().and("analysis_type", AnalysisType::SingleMeeting.as_str());
        for request in self.records.search::<RunRequest>(&queued_requests, self.batch_size).await? {
            let claimed = self
                .records
                .patch_if::<RunRequest>(
                    &request.id,
                    &still_queued,
                    json!({ "status": RunRequestStatus::Running }),
                )
                .await?;
            if claimed.is_none() {
                tracing::debug!(event_name = "worker.poll.lost_claim", record_id = %request.id, "request claimed elsewhere");
                continue;
            }
            jobs.push(Job::SingleMeeting { run_request_id: request.id });
        }

        let queued_pack = Filter::eq("status", BaselinePackStatus::Queued.as_str());
        for pack in self.records.search::<BaselinePack>(&queued_pack, self.batch_size).await? {
            let claimed = self
                .records
                .patch_if::<BaselinePack>(
                    &pack.id,
                    &queued_pack,
                    json!({ "status": BaselinePackStatus::Building }),
                )
                .await?;
            if claimed.is_none() {
                tracing::debug!(event_name = "worker.poll.lost_claim", record_id = %pack.id, "pack claimed elsewhere");
                continue;
            }
            jobs.push(Job::BaselinePack { baseline_pack_id: pack.id });
        }

        Ok(jobs)
    }

    /// Polls until `shutdown` flips to true or every worker is gone. Sends
    /// block while the queue is full, so a slow pool throttles claiming.
    pub async fn run(self, jobs: mpsc::Sender<Job>, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.claim_batch().await {
                Ok(batch) => {
                    if !batch.is_empty() {
                        tracing::info!(event_name = "worker.poll.claimed", jobs = batch.len(), "claimed queued jobs");
                    }
                    for job in batch {
                        if jobs.send(job).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(event_name = "worker.poll.failed", error = %error, "queue poll failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Starts `concurrency` workers draining one shared queue. Each worker exits
/// once the sending side is dropped and the queue is empty.
pub fn spawn_workers<S, G>(
    runner: Arc<JobRunner<S, G>>,
    jobs: mpsc::Receiver<Job>,
    concurrency: usize,
) -> Vec<JoinHandle<()>>
where
    S: RecordStore + 'static,
    G: LlmGateway + 'static,
{
    let jobs = Arc::new(Mutex::new(jobs));
    (0..concurrency.max(1))
        .map(|worker| {
            let runner = Arc::clone(&runner);
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move {
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };
                    // Failures are logged and recorded by the runner.
                    let _ = runner.run(&job).await;
                }
                tracing::debug!(event_name = "worker.stopped", worker, "worker drained");
            })
        })
        .collect()
}
