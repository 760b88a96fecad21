//! Typed access to the record store.

use chrono::{DateTime, Utc};
use huddle_core::domain::baseline::{BaselinePack, BaselinePackItem};
use huddle_core::domain::coachee::{PromptConfig, User};
use huddle_core::domain::experiment::{Experiment, ExperimentEvent};
use huddle_core::domain::run::{Run, RunRequest};
use huddle_core::domain::transcript::Transcript;
use huddle_core::gate1::ValidationIssue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Fields, Filter, Record, RecordStore, StoreError, Table};

/// A domain type stored as the fields of one record.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;
}

macro_rules! entity {
    ($($ty:ty => $table:expr,)+) => {
        $(impl Entity for $ty {
            const TABLE: Table = $table;
        })+
    };
}

/// A validation issue attached to the run it was raised against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIssue {
    pub run_id: String,
    /// Index of the issue in the run's verdict.
    #[serde(default)]
    pub position: usize,
    #[serde(flatten)]
    pub issue: ValidationIssue,
}

entity! {
    Transcript => Table::Transcripts,
    RunRequest => Table::RunRequests,
    Run => Table::Runs,
    StoredIssue => Table::ValidationIssues,
    BaselinePack => Table::BaselinePacks,
    BaselinePackItem => Table::BaselinePackItems,
    Experiment => Table::Experiments,
    ExperimentEvent => Table::ExperimentEvents,
    User => Table::Users,
    PromptConfig => Table::Config,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stored<T> {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub value: T,
}

impl<T: Entity> Stored<T> {
    fn from_record(record: Record) -> Result<Self, StoreError> {
        let value = serde_json::from_value(Value::Object(record.fields)).map_err(|error| {
            StoreError::Decode(format!("{}/{}: {error}", record.table, record.id))
        })?;
        Ok(Self { id: record.id, created_at: record.created_at, value })
    }
}

pub(crate) fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StoreError::Decode(format!("expected an object, got `{other}`"))),
        Err(error) => Err(StoreError::Decode(error.to_string())),
    }
}

pub struct Records<S> {
    store: S,
}

impl<S: RecordStore> Records<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn get<T: Entity>(&self, id: &str) -> Result<Stored<T>, StoreError> {
        Stored::from_record(self.store.get(T::TABLE, id).await?)
    }

    pub async fn find<T: Entity>(&self, id: &str) -> Result<Option<Stored<T>>, StoreError> {
        match self.store.get(T::TABLE, id).await {
            Ok(record) => Stored::from_record(record).map(Some),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub async fn create<T: Entity>(&self, value: &T) -> Result<Stored<T>, StoreError> {
        Stored::from_record(self.store.create(T::TABLE, to_fields(value)?).await?)
    }

    /// Merge `patch` (a JSON object) into the stored entity.
    pub async fn patch<T: Entity>(&self, id: &str, patch: Value) -> Result<Stored<T>, StoreError> {
        let Value::Object(fields) = patch else {
            return Err(StoreError::Decode(format!("patch for {}/{id} is not an object", T::TABLE)));
        };
        Stored::from_record(self.store.update(T::TABLE, id, fields).await?)
    }

    /// Patches the record only if it still matches `expected`.
    pub async fn patch_if<T: Entity>(
        &self,
        id: &str,
        expected: &Filter,
        patch: Value,
    ) -> Result<Option<Stored<T>>, StoreError> {
        let Value::Object(fields) = patch else {
            return Err(StoreError::Decode(format!("patch for {}/{id} is not an object", T::TABLE)));
        };
        self.store.update_if(T::TABLE, id, expected, fields).await?.map(Stored::from_record).transpose()
    }

    pub async fn search<T: Entity>(
        &self,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Stored<T>>, StoreError> {
        self.store
            .search(T::TABLE, filter, limit)
            .await?
            .into_iter()
            .map(Stored::from_record)
            .collect()
    }

    pub async fn first<T: Entity>(&self, filter: &Filter) -> Result<Option<Stored<T>>, StoreError> {
        Ok(self.search(filter, 1).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use huddle_core::domain::coachee::User;
    use huddle_core::domain::run::{AnalysisType, RunRequest, RunRequestStatus};
    use huddle_core::gate1::{IssueCode, ValidationIssue};
    use serde_json::json;

    use super::{Records, StoredIssue};
    use crate::store::{Filter, InMemoryRecordStore, StoreError};

    fn request() -> RunRequest {
        RunRequest {
            transcript_id: "rec_tr".to_string(),
            coachee_id: "rec_user".to_string(),
            analysis_type: AnalysisType::SingleMeeting,
            target_speaker_name: "Alice Chen".to_string(),
            target_speaker_label: "Alice".to_string(),
            target_role: "chair".to_string(),
            status: RunRequestStatus::Queued,
            run_id: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn typed_create_get_and_patch() {
        let records = Records::new(InMemoryRecordStore::new());
        let created = records.create(&request()).await.expect("create");

        let patched = records
            .patch::<RunRequest>(&created.id, json!({"status": "error", "error": "llm 503"}))
            .await
            .expect("patch");
        assert_eq!(patched.value.status, RunRequestStatus::Error);
        assert_eq!(patched.value.error.as_deref(), Some("llm 503"));

        let cleared = records
            .patch::<RunRequest>(&created.id, json!({"status": "queued", "error": null}))
            .await
            .expect("patch");
        assert_eq!(cleared.value, request());
    }

    #[tokio::test]
    async fn find_maps_not_found_to_none() {
        let records = Records::new(InMemoryRecordStore::new());
        assert!(records.find::<User>("rec_missing").await.expect("find").is_none());
        assert!(matches!(
            records.get::<User>("rec_missing").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn issues_are_flattened_and_searchable_by_run() {
        let records = Records::new(InMemoryRecordStore::new());
        let issue = StoredIssue {
            run_id: "rec_run".to_string(),
            position: 0,
            issue: ValidationIssue::error(IssueCode::PatternOrder, "pattern_snapshot[0]", "out of order"),
        };
        records.create(&issue).await.expect("create");

        let found = records
            .search::<StoredIssue>(&Filter::eq("run_id", "rec_run").and("issue_code", "PATTERN_ORDER"), 10)
            .await
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, issue);
    }

    #[tokio::test]
    async fn non_object_patch_is_rejected() {
        let records = Records::new(InMemoryRecordStore::new());
        let created = records.create(&request()).await.expect("create");
        let error = records.patch::<RunRequest>(&created.id, json!(["status"])).await.unwrap_err();
        assert!(matches!(error, StoreError::Decode(_)));
    }
}
