//! Lookups that turn a repeated job into a no-op.
//!
//! Each check is a single `search` with limit 1. A hit means the side effect
//! already happened and the caller must reuse the existing record.

use huddle_core::domain::experiment::{Experiment, ExperimentEvent};
use huddle_core::domain::run::Run;
use huddle_core::idempotency::IdempotencyKey;

use crate::records::{Entity, Records, Stored};
use crate::store::{Filter, RecordStore, StoreError};

pub struct IdempotencyResolver<'a, S> {
    records: &'a Records<S>,
}

impl<'a, S: RecordStore> IdempotencyResolver<'a, S> {
    pub fn new(records: &'a Records<S>) -> Self {
        Self { records }
    }

    pub async fn check_run_exists(&self, key: &IdempotencyKey) -> Result<Option<Stored<Run>>, StoreError> {
        self.lookup("run", Filter::eq("idempotency_key", key.as_str()), key).await
    }

    /// At most one experiment is instantiated per originating run.
    pub async fn check_experiment_exists(
        &self,
        run_id: &str,
    ) -> Result<Option<Stored<Experiment>>, StoreError> {
        let hit = self.records.first::<Experiment>(&Filter::eq("origin_run_id", run_id)).await?;
        if let Some(existing) = &hit {
            tracing::info!(
                event_name = "idempotency.hit",
                kind = "experiment",
                run_id,
                record_id = %existing.id,
                "experiment already instantiated for run"
            );
        }
        Ok(hit)
    }

    pub async fn check_experiment_event_exists(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Stored<ExperimentEvent>>, StoreError> {
        self.lookup("experiment_event", Filter::eq("idempotency_key", key.as_str()), key).await
    }

    /// Pack builds persist their run under the pack key.
    pub async fn check_baseline_pack_run_exists(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Stored<Run>>, StoreError> {
        let filter = Filter::eq("idempotency_key", key.as_str()).and("analysis_type", "baseline_pack");
        self.lookup("baseline_pack_run", filter, key).await
    }

    async fn lookup<T: Entity>(
        &self,
        kind: &'static str,
        filter: Filter,
        key: &IdempotencyKey,
    ) -> Result<Option<Stored<T>>, StoreError> {
        let hit = self.records.first::<T>(&filter).await?;
        if let Some(existing) = &hit {
            tracing::info!(
                event_name = "idempotency.hit",
                kind,
                key = key.short(),
                record_id = %existing.id,
                "existing record found for idempotency key"
            );
        }
        Ok(hit)
    }
}
