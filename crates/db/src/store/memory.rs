use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use super::{merge_fields, new_record_id, Fields, Filter, Record, RecordStore, StoreError, Table};

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<(Table, String), Record>>,
    order: RwLock<Vec<(Table, String)>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, table: Table) -> usize {
        self.records.read().await.keys().filter(|(entry, _)| *entry == table).count()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, table: Table, id: &str) -> Result<Record, StoreError> {
        self.records
            .read()
            .await
            .get(&(table, id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound { table, id: id.to_string() })
    }

    async fn create(&self, table: Table, fields: Fields) -> Result<Record, StoreError> {
        let now = Utc::now();
        let record =
            Record { id: new_record_id(), table, fields, created_at: now, updated_at: now };
        let key = (table, record.id.clone());

        self.records.write().await.insert(key.clone(), record.clone());
        self.order.write().await.push(key);
        Ok(record)
    }

    async fn update(&self, table: Table, id: &str, fields: Fields) -> Result<Record, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&(table, id.to_string()))
            .ok_or_else(|| StoreError::NotFound { table, id: id.to_string() })?;

        merge_fields(&mut record.fields, fields);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn update_if(
        &self,
        table: Table,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Record>, StoreError> {
        expected.validate()?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&(table, id.to_string()))
            .ok_or_else(|| StoreError::NotFound { table, id: id.to_string() })?;
        if !expected.matches(&record.fields) {
            return Ok(None);
        }

        merge_fields(&mut record.fields, fields);
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn search(
        &self,
        table: Table,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        filter.validate()?;

        let records = self.records.read().await;
        let order = self.order.read().await;
        Ok(order
            .iter()
            .filter(|(entry, _)| *entry == table)
            .filter_map(|key| records.get(key))
            .filter(|record| filter.matches(&record.fields))
            .take(limit)
            .cloned()
            .collect())
    }
}
