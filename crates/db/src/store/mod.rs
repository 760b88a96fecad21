//! Generic record storage.
//!
//! Entities are stored as JSON documents grouped by [`Table`]. Updates merge
//! the given fields into the stored document; a `null` field removes the key.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod retrying;
pub mod sql;

pub use memory::InMemoryRecordStore;
pub use retrying::RetryingStore;
pub use sql::SqlRecordStore;

pub type Fields = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Transcripts,
    RunRequests,
    Runs,
    ValidationIssues,
    BaselinePacks,
    BaselinePackItems,
    Experiments,
    ExperimentEvents,
    Users,
    Config,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Table::Transcripts,
        Table::RunRequests,
        Table::Runs,
        Table::ValidationIssues,
        Table::BaselinePacks,
        Table::BaselinePackItems,
        Table::Experiments,
        Table::ExperimentEvents,
        Table::Users,
        Table::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcripts => "transcripts",
            Self::RunRequests => "run_requests",
            Self::Runs => "runs",
            Self::ValidationIssues => "validation_issues",
            Self::BaselinePacks => "baseline_packs",
            Self::BaselinePackItems => "baseline_pack_items",
            Self::Experiments => "experiments",
            Self::ExperimentEvents => "experiment_events",
            Self::Users => "users",
            Self::Config => "config",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == value.trim())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub id: String,
    pub table: Table,
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conjunction of top-level field equalities. Expecting `null` also matches
/// an absent field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.clauses.iter().all(|(field, expected)| match fields.get(field) {
            Some(actual) => actual == expected,
            None => expected.is_null(),
        })
    }

    /// Field names are plain identifiers; nested paths are not supported.
    pub fn validate(&self) -> Result<(), StoreError> {
        for (field, _) in &self.clauses {
            let valid = !field.is_empty()
                && field.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
            if !valid {
                return Err(StoreError::InvalidField(field.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record {table}/{id} not found")]
    NotFound { table: Table, id: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid filter field `{0}`")]
    InvalidField(String),
    #[error("record store rate limited")]
    RateLimited,
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store timed out")]
    Timeout,
    #[error("record store gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<StoreError> },
}

impl StoreError {
    /// Failures worth retrying: throttling, outages, timeouts and SQLite lock contention.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Unavailable(_) | Self::Timeout => true,
            Self::RetriesExhausted { .. } => true,
            Self::Database(error) => match error {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db_error) => {
                    let message = db_error.message();
                    message.contains("database is locked") || message.contains("database is busy")
                }
                _ => false,
            },
            Self::NotFound { .. } | Self::Decode(_) | Self::InvalidField(_) => false,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, table: Table, id: &str) -> Result<Record, StoreError>;
    async fn create(&self, table: Table, fields: Fields) -> Result<Record, StoreError>;
    async fn update(&self, table: Table, id: &str, fields: Fields) -> Result<Record, StoreError>;
    /// Applies `fields` only while the stored record still matches `expected`,
    /// as one atomic step. `Ok(None)` means the record exists but no longer
    /// matches.
    async fn update_if(
        &self,
        table: Table,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Record>, StoreError>;
    /// Matching records in creation order, at most `limit` of them.
    async fn search(
        &self,
        table: Table,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn get(&self, table: Table, id: &str) -> Result<Record, StoreError> {
        (**self).get(table, id).await
    }

    async fn create(&self, table: Table, fields: Fields) -> Result<Record, StoreError> {
        (**self).create(table, fields).await
    }

    async fn update(&self, table: Table, id: &str, fields: Fields) -> Result<Record, StoreError> {
        (**self).update(table, id, fields).await
    }

    async fn update_if(
        &self,
        table: Table,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Record>, StoreError> {
        (**self).update_if(table, id, expected, fields).await
    }

    async fn search(
        &self,
        table: Table,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        (**self).search(table, filter, limit).await
    }
}

/// Merge-patch `patch` into `target`: `null` removes, anything else replaces.
pub(crate) fn merge_fields(target: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

pub(crate) fn new_record_id() -> String {
    format!("rec{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{merge_fields, Fields, Filter, StoreError, Table};

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn filter_matches_conjunction_and_absent_null() {
        let record = fields(json!({"status": "queued", "gate1_passed": true}));

        assert!(Filter::eq("status", "queued").matches(&record));
        assert!(Filter::eq("status", "queued").and("gate1_passed", true).matches(&record));
        assert!(!Filter::eq("status", "queued").and("gate1_passed", false).matches(&record));
        assert!(Filter::eq("run_id", serde_json::Value::Null).matches(&record));
        assert!(Filter::all().matches(&record));
    }

    #[test]
    fn filter_rejects_path_like_fields() {
        assert!(Filter::eq("idempotency_key", "abc").validate().is_ok());
        let error = Filter::eq("meta.analysis_id", "A-000001").validate().unwrap_err();
        assert!(matches!(error, StoreError::InvalidField(field) if field == "meta.analysis_id"));
    }

    #[test]
    fn merge_replaces_and_removes() {
        let mut target = fields(json!({"status": "running", "error": "boom", "coachee_id": "u1"}));
        merge_fields(&mut target, fields(json!({"status": "completed", "error": null})));

        assert_eq!(target, fields(json!({"status": "completed", "coachee_id": "u1"})));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::RateLimited.is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Decode("bad".to_string()).is_transient());
        assert!(!StoreError::NotFound { table: Table::Runs, id: "rec1".to_string() }.is_transient());
    }

    #[test]
    fn table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(Table::parse(table.as_str()), Some(table));
        }
        assert_eq!(Table::parse("quotes"), None);
    }
}
