pub mod connection;
pub mod idempotency;
pub mod migrations;
pub mod records;
pub mod store;

pub use connection::{connect_from_config, connect_with_settings, DbPool};
pub use idempotency::IdempotencyResolver;
pub use records::{Entity, Records, Stored, StoredIssue};
pub use store::{
    Fields, Filter, InMemoryRecordStore, Record, RecordStore, RetryingStore, SqlRecordStore,
    StoreError, Table,
};
