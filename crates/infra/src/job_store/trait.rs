use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use asyncjob_core::{JobId, NodeId, QueueId, QueueItemId};

use crate::jobs::types::{
    Job, JoinMapEntry, NewJob, NewJoin, ResourceKey, Signals, SyncQueue, SyncQueueItem,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Job data store error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Uniqueness violation or lost optimistic race.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store refused a write because it is out of capacity.
    #[error("store full: {0}")]
    StoreFull(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Job table access inside a transaction.
///
/// `lock_*` methods read with row-level write intent (`SELECT ... FOR UPDATE`
/// on Postgres); plain `find_*` methods do not lock.
pub trait JobRepository {
    fn insert_job(
        &mut self,
        new: &NewJob,
        init_node: NodeId,
        executing_node: Option<NodeId>,
        now: DateTime<Utc>,
    ) -> StoreResult<Job>;

    fn find_job(&mut self, id: JobId) -> StoreResult<Option<Job>>;

    fn lock_job(&mut self, id: JobId) -> StoreResult<Option<Job>>;

    /// Persist every mutable column of `job`. The transient `sync_source` is ignored.
    fn update_job(&mut self, job: &Job) -> StoreResult<()>;

    /// Hard delete. Returns whether a row was removed.
    fn expunge_job(&mut self, id: JobId) -> StoreResult<bool>;

    /// Compare-and-set `executing_node_id` from `NULL` to `node` for an
    /// in-progress job. Returns the claimed job, or `None` when someone else owns it.
    fn claim_unowned_job(
        &mut self,
        id: JobId,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Job>>;

    /// In-progress jobs whose `executing_node_id` is `node`.
    fn jobs_executing_on(&mut self, node: NodeId) -> StoreResult<Vec<Job>>;

    /// In-progress, unowned jobs carrying `signal` and no queue item.
    fn signaled_unowned_jobs(&mut self, signal: Signals, limit: usize) -> StoreResult<Vec<JobId>>;

    /// In-progress jobs created before `cutoff`.
    fn expired_unfinished_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobId>>;

    /// Terminal jobs last updated before `cutoff`.
    fn expired_completed_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobId>>;

    /// In-progress jobs attached to a resource instance.
    fn active_jobs_for_instance(
        &mut self,
        instance_type: &str,
        instance_id: i64,
    ) -> StoreResult<Vec<Job>>;
}

/// Sync queue table access inside a transaction.
pub trait SyncQueueRepository {
    /// Fetch the queue for `key`, creating it when absent. An existing queue's
    /// limit is only ever raised to `size_limit`.
    fn ensure_queue(
        &mut self,
        key: &ResourceKey,
        size_limit: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncQueue>;

    fn find_queue(&mut self, id: QueueId) -> StoreResult<Option<SyncQueue>>;

    fn find_queue_by_key(&mut self, key: &ResourceKey) -> StoreResult<Option<SyncQueue>>;

    fn lock_queue(&mut self, id: QueueId) -> StoreResult<Option<SyncQueue>>;

    fn update_queue(&mut self, queue: &SyncQueue) -> StoreResult<()>;
}

/// Sync queue item table access inside a transaction.
pub trait SyncQueueItemRepository {
    fn insert_item(
        &mut self,
        queue_id: QueueId,
        content_type: &str,
        content_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncQueueItem>;

    fn find_item(&mut self, id: QueueItemId) -> StoreResult<Option<SyncQueueItem>>;

    fn lock_item(&mut self, id: QueueItemId) -> StoreResult<Option<SyncQueueItem>>;

    fn find_item_by_content(
        &mut self,
        content_type: &str,
        content_id: i64,
    ) -> StoreResult<Option<SyncQueueItem>>;

    fn update_item(&mut self, item: &SyncQueueItem) -> StoreResult<()>;

    fn delete_item(&mut self, id: QueueItemId) -> StoreResult<bool>;

    /// Number of claimed items in a queue.
    fn active_item_count(&mut self, queue_id: QueueId) -> StoreResult<u32>;

    /// Oldest unclaimed item of a queue.
    fn next_unclaimed_item(&mut self, queue_id: QueueId) -> StoreResult<Option<SyncQueueItem>>;

    /// Oldest unclaimed items across all queues, at most `limit`.
    fn unclaimed_items(&mut self, limit: usize) -> StoreResult<Vec<SyncQueueItem>>;

    fn items_claimed_by(&mut self, node: NodeId) -> StoreResult<Vec<SyncQueueItem>>;

    /// Claimed items whose claim is older than `cutoff`.
    fn items_claimed_before(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<SyncQueueItem>>;
}

/// Join map table access inside a transaction.
pub trait JoinMapRepository {
    fn insert_join(&mut self, join: &NewJoin, now: DateTime<Utc>) -> StoreResult<JoinMapEntry>;

    fn find_join(&mut self, job_id: JobId, join_job_id: JobId) -> StoreResult<Option<JoinMapEntry>>;

    /// Entries whose waiter is waiting on `join_job_id`.
    fn joins_awaiting(&mut self, join_job_id: JobId) -> StoreResult<Vec<JoinMapEntry>>;

    /// Entries where `job_id` is the waiter.
    fn joins_of_waiter(&mut self, job_id: JobId) -> StoreResult<Vec<JoinMapEntry>>;

    fn update_join(&mut self, entry: &JoinMapEntry) -> StoreResult<()>;

    fn delete_join(&mut self, job_id: JobId, join_job_id: JobId) -> StoreResult<bool>;

    /// Delete every entry where `job_id` is either side. Returns how many went.
    fn delete_joins_involving(&mut self, job_id: JobId) -> StoreResult<usize>;

    /// Unexpired entries whose `next_wakeup_time` has passed.
    fn joins_due_for_wakeup(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<JoinMapEntry>>;

    fn expired_joins(&mut self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<JoinMapEntry>>;
}

/// Everything reachable inside one store transaction.
pub trait StoreTx:
    JobRepository + SyncQueueRepository + SyncQueueItemRepository + JoinMapRepository
{
}

impl<T> StoreTx for T where
    T: JobRepository + SyncQueueRepository + SyncQueueItemRepository + JoinMapRepository
{
}

/// Transactional job data store shared by every node of the cluster.
///
/// ## Transactions
///
/// `transaction()` runs `f` against a single unit of work: all of its writes
/// commit together when `f` returns `Ok`, and none of them are visible when it
/// returns `Err`.
///
/// ## Named locks
///
/// `try_lock()` is a non-blocking cluster-wide mutex used to gate the periodic
/// scheduler loops. The lock is held until the returned lease is dropped.
pub trait JobDataStore: Send + Sync {
    type Lease: Send;

    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<R, E>,
        E: From<StoreError>;

    fn try_lock(&self, name: &str, ttl: Duration) -> StoreResult<Option<Self::Lease>>;
}

impl<S> JobDataStore for Arc<S>
where
    S: JobDataStore + ?Sized,
{
    type Lease = S::Lease;

    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<R, E>,
        E: From<StoreError>,
    {
        (**self).transaction(f)
    }

    fn try_lock(&self, name: &str, ttl: Duration) -> StoreResult<Option<Self::Lease>> {
        (**self).try_lock(name, ttl)
    }
}
