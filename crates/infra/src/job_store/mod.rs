//! Durable state behind the job manager.
//!
//! Jobs, sync queues, queue items and join entries live in one store. Every
//! mutation runs inside [`JobDataStore::transaction`]; scheduler-loop
//! election uses [`JobDataStore::try_lock`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryJobDataStore, InMemoryLease};
pub use postgres::{PgAdvisoryLease, PostgresJobDataStore};
pub use r#trait::{
    JobDataStore, JobRepository, JoinMapRepository, StoreError, StoreResult, StoreTx,
    SyncQueueItemRepository, SyncQueueRepository,
};
