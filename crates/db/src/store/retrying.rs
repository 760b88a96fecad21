use huddle_core::retry::{RetryError, RetryPolicy};

use super::{Fields, Filter, Record, RecordStore, StoreError, Table};

const OPERATION: &str = "store";

/// Applies the shared retry policy to transient store failures.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn unwrap_retry(error: RetryError<StoreError>) -> StoreError {
    match error {
        RetryError::Fatal(error) => error,
        RetryError::Exhausted { attempts, last } => {
            StoreError::RetriesExhausted { attempts, last: Box::new(last) }
        }
    }
}

#[async_trait::async_trait]
impl<S: RecordStore> RecordStore for RetryingStore<S> {
    async fn get(&self, table: Table, id: &str) -> Result<Record, StoreError> {
        self.policy
            .run(OPERATION, || self.inner.get(table, id), StoreError::is_transient)
            .await
            .map_err(unwrap_retry)
    }

    async fn create(&self, table: Table, fields: Fields) -> Result<Record, StoreError> {
        self.policy
            .run(OPERATION, || self.inner.create(table, fields.clone()), StoreError::is_transient)
            .await
            .map_err(unwrap_retry)
    }

    async fn update(&self, table: Table, id: &str, fields: Fields) -> Result<Record, StoreError> {
        self.policy
            .run(OPERATION, || self.inner.update(table, id, fields.clone()), StoreError::is_transient)
            .await
            .map_err(unwrap_retry)
    }

    async fn update_if(
        &self,
        table: Table,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Record>, StoreError> {
        self.policy
            .run(
                OPERATION,
                || self.inner.update_if(table, id, expected, fields.clone()),
                StoreError::is_transient,
            )
            .await
            .map_err(unwrap_retry)
    }

    async fn search(
        &self,
        table: Table,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        self.policy
            .run(OPERATION, || self.inner.search(table, filter, limit), StoreError::is_transient)
            .await
            .map_err(unwrap_retry)
    }
}
