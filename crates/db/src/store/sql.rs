use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::Row;

use super::{merge_fields, new_record_id, Fields, Filter, Record, RecordStore, StoreError, Table};
use crate::DbPool;

/// Record store over the `records` table. Every write touches exactly one row.
#[derive(Clone)]
pub struct SqlRecordStore {
    pool: DbPool,
}

impl SqlRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl RecordStore for SqlRecordStore {
    async fn get(&self, table: Table, id: &str) -> Result<Record, StoreError> {
        let row = sqlx::query(
            "SELECT id, table_name, fields_json, created_at, updated_at
             FROM records
             WHERE id = ? AND table_name = ?",
        )
        .bind(id)
        .bind(table.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(row),
            None => Err(StoreError::NotFound { table, id: id.to_string() }),
        }
    }

    async fn create(&self, table: Table, fields: Fields) -> Result<Record, StoreError> {
        let now = Utc::now();
        let record =
            Record { id: new_record_id(), table, fields, created_at: now, updated_at: now };

        sqlx::query(
            "INSERT INTO records (id, table_name, fields_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(table.as_str())
        .bind(encode_fields(&record.fields)?)
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update(&self, table: Table, id: &str, fields: Fields) -> Result<Record, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, table_name, fields_json, created_at, updated_at
             FROM records
             WHERE id = ? AND table_name = ?",
        )
        .bind(id)
        .bind(table.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(StoreError::NotFound { table, id: id.to_string() });
        };

        let mut record = record_from_row(row)?;
        merge_fields(&mut record.fields, fields);
        record.updated_at = Utc::now();

        sqlx::query("UPDATE records SET fields_json = ?, updated_at = ? WHERE id = ?")
            .bind(encode_fields(&record.fields)?)
            .bind(format_timestamp(&record.updated_at))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    async fn update_if(
        &self,
        table: Table,
        id: &str,
        expected: &Filter,
        fields: Fields,
    ) -> Result<Option<Record>, StoreError> {
        expected.validate()?;

        let current = self.get(table, id).await?;
        if !expected.matches(&current.fields) {
            return Ok(None);
        }
        let mut record = current;
        merge_fields(&mut record.fields, fields);
        record.updated_at = Utc::now();

        // The guard is re-checked by the UPDATE itself; a concurrent writer
        // that moved the record first leaves zero rows affected.
        let mut sql = String::from(
            "UPDATE records SET fields_json = ?, updated_at = ? WHERE id = ? AND table_name = ?",
        );
        push_conditions(&mut sql, expected);
        let query = sqlx::query(&sql)
            .bind(encode_fields(&record.fields)?)
            .bind(format_timestamp(&record.updated_at))
            .bind(id)
            .bind(table.as_str());
        let result = bind_conditions(query, expected).execute(&self.pool).await?;

        Ok((result.rows_affected() == 1).then_some(record))
    }

    async fn search(
        &self,
        table: Table,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>, StoreError> {
        filter.validate()?;

        let mut sql = String::from(
            "SELECT id, table_name, fields_json, created_at, updated_at
             FROM records
             WHERE table_name = ?",
        );
        push_conditions(&mut sql, filter);
        sql.push_str(" ORDER BY created_at ASC, rowid ASC LIMIT ?");

        let query = bind_conditions(sqlx::query(&sql).bind(table.as_str()), filter);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.into_iter().map(record_from_row).collect()
    }
}

fn push_conditions(sql: &mut String, filter: &Filter) {
    for (_, expected) in filter.clauses() {
        if expected.is_null() {
            sql.push_str(" AND json_extract(fields_json, ?) IS NULL");
        } else {
            sql.push_str(" AND json_extract(fields_json, ?) = ?");
        }
    }
}

fn bind_conditions<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    filter: &Filter,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for (field, expected) in filter.clauses() {
        query = query.bind(format!("$.{field}"));
        query = match expected {
            Value::Null => query,
            Value::Bool(flag) => query.bind(i64::from(*flag)),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => query.bind(integer),
                None => query.bind(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => query.bind(text.clone()),
            nested @ (Value::Array(_) | Value::Object(_)) => query.bind(nested.to_string()),
        };
    }
    query
}

fn record_from_row(row: SqliteRow) -> Result<Record, StoreError> {
    let table_raw = row.try_get::<String, _>("table_name")?;
    let table = Table::parse(&table_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown table `{table_raw}`")))?;
    let fields_raw = row.try_get::<String, _>("fields_json")?;
    let fields = serde_json::from_str::<Fields>(&fields_raw)
        .map_err(|error| StoreError::Decode(format!("invalid fields_json: {error}")))?;

    Ok(Record {
        id: row.try_get("id")?,
        table,
        fields,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn encode_fields(fields: &Fields) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(|error| StoreError::Decode(error.to_string()))
}

/// Fixed-width so that text ordering matches time ordering.
fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| StoreError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})")),
    )
}
