//! In-memory job data store for tests and single-node development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use asyncjob_core::{JobId, JobStatus, JoinId, NodeId, QueueId, QueueItemId};

use super::r#trait::{
    JobDataStore, JobRepository, JoinMapRepository, StoreError, StoreResult, StoreTx,
    SyncQueueItemRepository, SyncQueueRepository,
};
use crate::jobs::types::{
    Job, JoinMapEntry, NewJob, NewJoin, ResourceKey, Signals, SyncQueue, SyncQueueItem,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    jobs: BTreeMap<JobId, Job>,
    queues: BTreeMap<QueueId, SyncQueue>,
    items: BTreeMap<QueueItemId, SyncQueueItem>,
    joins: BTreeMap<JoinId, JoinMapEntry>,
    last_job_id: i64,
    last_queue_id: i64,
    last_item_id: i64,
    last_join_id: i64,
}

/// In-memory job data store.
///
/// - Transactions are serialized behind one mutex. The first write copies the
///   tables; the copy replaces the live tables only on commit, so read-only
///   transactions copy nothing
/// - Every write transaction still costs a full copy: fine for tests and a
///   single development node, not for production volumes
/// - Named locks honour their TTL so a forgotten lease eventually expires
/// - An optional row capacity simulates a full store
#[derive(Debug, Default)]
pub struct InMemoryJobDataStore {
    tables: Mutex<Tables>,
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: u64,
    expires: Instant,
}

impl InMemoryJobDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Refuse inserts once jobs + queue items reach `rows`.
    pub fn with_capacity(mut self, rows: usize) -> Self {
        self.capacity = Some(rows);
        self
    }

    /// Committed snapshot of a job (test/inspection helper).
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.tables.lock().ok()?.jobs.get(&id).cloned()
    }

    /// Committed snapshot of every queue item.
    pub fn items(&self) -> Vec<SyncQueueItem> {
        self.tables
            .lock()
            .map(|t| t.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed snapshot of every queue.
    pub fn queues(&self) -> Vec<SyncQueue> {
        self.tables
            .lock()
            .map(|t| t.queues.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed snapshot of every join entry.
    pub fn joins(&self) -> Vec<JoinMapEntry> {
        self.tables
            .lock()
            .map(|t| t.joins.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Lease on a named in-memory lock; released on drop.
#[derive(Debug)]
pub struct InMemoryLease {
    name: String,
    token: u64,
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            // An expired lease may have been taken over; only release our own.
            if locks.get(&self.name).is_some_and(|e| e.token == self.token) {
                locks.remove(&self.name);
            }
        }
    }
}

static NEXT_LEASE_TOKEN: AtomicU64 = AtomicU64::new(1);

impl JobDataStore for InMemoryJobDataStore {
    type Lease = InMemoryLease;

    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<R, E>,
        E: From<StoreError>,
    {
        let mut live = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut tx = InMemoryTx {
            live: &*live,
            scratch: None,
            capacity: self.capacity,
        };
        let out = f(&mut tx)?;
        let scratch = tx.scratch;
        if let Some(committed) = scratch {
            *live = committed;
        }
        Ok(out)
    }

    fn try_lock(&self, name: &str, ttl: Duration) -> StoreResult<Option<InMemoryLease>> {
        let mut locks = self.locks.lock().map_err(|_| StoreError::LockPoisoned)?;
        let now = Instant::now();
        if locks.get(name).is_some_and(|e| e.expires > now) {
            return Ok(None);
        }
        let token = NEXT_LEASE_TOKEN.fetch_add(1, Ordering::Relaxed);
        locks.insert(
            name.to_string(),
            LockEntry {
                token,
                expires: now + ttl,
            },
        );
        Ok(Some(InMemoryLease {
            name: name.to_string(),
            token,
            locks: self.locks.clone(),
        }))
    }
}

/// Reads go to the live tables until the first write, which copies them.
struct InMemoryTx<'a> {
    live: &'a Tables,
    scratch: Option<Tables>,
    capacity: Option<usize>,
}

impl InMemoryTx<'_> {
    fn read(&self) -> &Tables {
        self.scratch.as_ref().unwrap_or(self.live)
    }

    fn write(&mut self) -> &mut Tables {
        let live = self.live;
        self.scratch.get_or_insert_with(|| live.clone())
    }

    fn ensure_capacity(&self, what: &str) -> StoreResult<()> {
        match self.capacity {
            Some(cap) if self.read().jobs.len() + self.read().items.len() >= cap => {
                Err(StoreError::StoreFull(format!("cannot insert {what}: {cap} rows in use")))
            }
            _ => Ok(()),
        }
    }
}

impl JobRepository for InMemoryTx<'_> {
    fn insert_job(
        &mut self,
        new: &NewJob,
        init_node: NodeId,
        executing_node: Option<NodeId>,
        now: DateTime<Utc>,
    ) -> StoreResult<Job> {
        self.ensure_capacity("job")?;
        self.write().last_job_id += 1;
        let id = JobId::new(self.read().last_job_id);
        let job = Job::from_new(id, new, init_node, executing_node, now);
        self.write().jobs.insert(id, job.clone());
        Ok(job)
    }

    fn find_job(&mut self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.read().jobs.get(&id).cloned())
    }

    fn lock_job(&mut self, id: JobId) -> StoreResult<Option<Job>> {
        self.find_job(id)
    }

    fn update_job(&mut self, job: &Job) -> StoreResult<()> {
        let slot = self
            .write()
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
        *slot = Job {
            sync_source: None,
            ..job.clone()
        };
        Ok(())
    }

    fn expunge_job(&mut self, id: JobId) -> StoreResult<bool> {
        Ok(self.write().jobs.remove(&id).is_some())
    }

    fn claim_unowned_job(
        &mut self,
        id: JobId,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        match self.write().jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::InProgress && job.executing_node_id.is_none() => {
                job.executing_node_id = Some(node);
                job.last_updated = now;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    fn jobs_executing_on(&mut self, node: NodeId) -> StoreResult<Vec<Job>> {
        Ok(self
            .read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::InProgress && j.executing_node_id == Some(node))
            .cloned()
            .collect())
    }

    fn signaled_unowned_jobs(&mut self, signal: Signals, limit: usize) -> StoreResult<Vec<JobId>> {
        let tables = self.read();
        Ok(tables
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::InProgress
                    && j.executing_node_id.is_none()
                    && j.pending_signals.contains(signal)
                    && !tables.items.values().any(|i| i.job_id() == Some(j.id))
            })
            .take(limit)
            .map(|j| j.id)
            .collect())
    }

    fn expired_unfinished_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobId>> {
        Ok(self
            .read()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::InProgress && j.created < cutoff)
            .take(limit)
            .map(|j| j.id)
            .collect())
    }

    fn expired_completed_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobId>> {
        Ok(self
            .read()
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.last_updated < cutoff)
            .take(limit)
            .map(|j| j.id)
            .collect())
    }

    fn active_jobs_for_instance(
        &mut self,
        instance_type: &str,
        instance_id: i64,
    ) -> StoreResult<Vec<Job>> {
        Ok(self
            .read()
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::InProgress
                    && j.instance_type.as_deref() == Some(instance_type)
                    && j.instance_id == Some(instance_id)
            })
            .cloned()
            .collect())
    }
}

impl SyncQueueRepository for InMemoryTx<'_> {
    fn ensure_queue(
        &mut self,
        key: &ResourceKey,
        size_limit: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncQueue> {
        if let Some(queue) = self.write().queues.values_mut().find(|q| q.key == *key) {
            if size_limit > queue.size_limit {
                queue.size_limit = size_limit;
                queue.last_updated = now;
            }
            return Ok(queue.clone());
        }

        self.write().last_queue_id += 1;
        let queue = SyncQueue {
            id: QueueId::new(self.read().last_queue_id),
            key: key.clone(),
            size_limit,
            queue_size: 0,
            last_process_number: 0,
            created: now,
            last_updated: now,
        };
        self.write().queues.insert(queue.id, queue.clone());
        Ok(queue)
    }

    fn find_queue(&mut self, id: QueueId) -> StoreResult<Option<SyncQueue>> {
        Ok(self.read().queues.get(&id).cloned())
    }

    fn find_queue_by_key(&mut self, key: &ResourceKey) -> StoreResult<Option<SyncQueue>> {
        Ok(self.read().queues.values().find(|q| q.key == *key).cloned())
    }

    fn lock_queue(&mut self, id: QueueId) -> StoreResult<Option<SyncQueue>> {
        self.find_queue(id)
    }

    fn update_queue(&mut self, queue: &SyncQueue) -> StoreResult<()> {
        let slot = self
            .write()
            .queues
            .get_mut(&queue.id)
            .ok_or_else(|| StoreError::NotFound(format!("sync queue {}", queue.id)))?;
        *slot = queue.clone();
        Ok(())
    }
}

impl SyncQueueItemRepository for InMemoryTx<'_> {
    fn insert_item(
        &mut self,
        queue_id: QueueId,
        content_type: &str,
        content_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncQueueItem> {
        self.ensure_capacity("sync queue item")?;
        if !self.read().queues.contains_key(&queue_id) {
            return Err(StoreError::NotFound(format!("sync queue {queue_id}")));
        }
        if self
            .read()
            .items
            .values()
            .any(|i| i.content_type == content_type && i.content_id == content_id)
        {
            return Err(StoreError::Conflict(format!(
                "{content_type} {content_id} is already queued"
            )));
        }

        self.write().last_item_id += 1;
        let item = SyncQueueItem {
            id: QueueItemId::new(self.read().last_item_id),
            queue_id,
            content_type: content_type.to_string(),
            content_id,
            created: now,
            last_process_msid: None,
            last_process_number: None,
            last_process_time: None,
        };
        self.write().items.insert(item.id, item.clone());
        Ok(item)
    }

    fn find_item(&mut self, id: QueueItemId) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self.read().items.get(&id).cloned())
    }

    fn lock_item(&mut self, id: QueueItemId) -> StoreResult<Option<SyncQueueItem>> {
        self.find_item(id)
    }

    fn find_item_by_content(
        &mut self,
        content_type: &str,
        content_id: i64,
    ) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self
            .read()
            .items
            .values()
            .find(|i| i.content_type == content_type && i.content_id == content_id)
            .cloned())
    }

    fn update_item(&mut self, item: &SyncQueueItem) -> StoreResult<()> {
        let slot = self
            .write()
            .items
            .get_mut(&item.id)
            .ok_or_else(|| StoreError::NotFound(format!("sync queue item {}", item.id)))?;
        *slot = item.clone();
        Ok(())
    }

    fn delete_item(&mut self, id: QueueItemId) -> StoreResult<bool> {
        Ok(self.write().items.remove(&id).is_some())
    }

    fn active_item_count(&mut self, queue_id: QueueId) -> StoreResult<u32> {
        Ok(self
            .read()
            .items
            .values()
            .filter(|i| i.queue_id == queue_id && i.is_claimed())
            .count() as u32)
    }

    fn next_unclaimed_item(&mut self, queue_id: QueueId) -> StoreResult<Option<SyncQueueItem>> {
        Ok(self
            .read()
            .items
            .values()
            .find(|i| i.queue_id == queue_id && !i.is_claimed())
            .cloned())
    }

    fn unclaimed_items(&mut self, limit: usize) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self
            .read()
            .items
            .values()
            .filter(|i| !i.is_claimed())
            .take(limit)
            .cloned()
            .collect())
    }

    fn items_claimed_by(&mut self, node: NodeId) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self
            .read()
            .items
            .values()
            .filter(|i| i.last_process_msid == Some(node))
            .cloned()
            .collect())
    }

    fn items_claimed_before(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self
            .read()
            .items
            .values()
            .filter(|i| i.is_claimed() && i.last_process_time.is_some_and(|t| t < cutoff))
            .cloned()
            .collect())
    }
}

impl JoinMapRepository for InMemoryTx<'_> {
    fn insert_join(&mut self, join: &NewJoin, now: DateTime<Utc>) -> StoreResult<JoinMapEntry> {
        if self
            .read()
            .joins
            .values()
            .any(|e| e.job_id == join.job_id && e.join_job_id == join.join_job_id)
        {
            return Err(StoreError::Conflict(format!(
                "job {} already joined to {}",
                join.job_id, join.join_job_id
            )));
        }

        self.write().last_join_id += 1;
        let entry = JoinMapEntry {
            id: JoinId::new(self.read().last_join_id),
            job_id: join.job_id,
            join_job_id: join.join_job_id,
            join_status: JobStatus::InProgress,
            join_result: None,
            join_node_id: join.join_node_id,
            complete_node_id: None,
            wakeup_handler: join.wakeup_handler.clone(),
            wakeup_dispatcher: join.wakeup_dispatcher.clone(),
            wakeup_interval_ms: join.wakeup_interval_ms,
            next_wakeup_time: join.next_wakeup_time,
            expiration: join.expiration,
            sync_source_id: join.sync_source_id,
            created: now,
            last_updated: now,
        };
        self.write().joins.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn find_join(&mut self, job_id: JobId, join_job_id: JobId) -> StoreResult<Option<JoinMapEntry>> {
        Ok(self
            .read()
            .joins
            .values()
            .find(|e| e.job_id == job_id && e.join_job_id == join_job_id)
            .cloned())
    }

    fn joins_awaiting(&mut self, join_job_id: JobId) -> StoreResult<Vec<JoinMapEntry>> {
        Ok(self
            .read()
            .joins
            .values()
            .filter(|e| e.join_job_id == join_job_id)
            .cloned()
            .collect())
    }

    fn joins_of_waiter(&mut self, job_id: JobId) -> StoreResult<Vec<JoinMapEntry>> {
        Ok(self
            .read()
            .joins
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    fn update_join(&mut self, entry: &JoinMapEntry) -> StoreResult<()> {
        let slot = self
            .write()
            .joins
            .get_mut(&entry.id)
            .ok_or_else(|| StoreError::NotFound(format!("join {}", entry.id)))?;
        *slot = entry.clone();
        Ok(())
    }

    fn delete_join(&mut self, job_id: JobId, join_job_id: JobId) -> StoreResult<bool> {
        let before = self.read().joins.len();
        self.write()
            .joins
            .retain(|_, e| !(e.job_id == job_id && e.join_job_id == join_job_id));
        Ok(self.read().joins.len() < before)
    }

    fn delete_joins_involving(&mut self, job_id: JobId) -> StoreResult<usize> {
        let before = self.read().joins.len();
        self.write()
            .joins
            .retain(|_, e| e.job_id != job_id && e.join_job_id != job_id);
        Ok(before - self.read().joins.len())
    }

    fn joins_due_for_wakeup(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<JoinMapEntry>> {
        Ok(self
            .read()
            .joins
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect())
    }

    fn expired_joins(&mut self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<JoinMapEntry>> {
        Ok(self
            .read()
            .joins
            .values()
            .filter(|e| e.is_expired(now))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewJob {
        NewJob::new("noop", "run", serde_json::json!({}))
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let store = InMemoryJobDataStore::new();

        let res: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert_job(&new_job(), NodeId::new(1), None, Utc::now())?;
            Err(StoreError::Conflict("boom".into()))
        });
        assert!(res.is_err());
        assert!(store.job(JobId::new(1)).is_none());

        let job = store
            .transaction::<_, StoreError, _>(|tx| {
                tx.insert_job(&new_job(), NodeId::new(1), None, Utc::now())
            })
            .unwrap();
        assert!(store.job(job.id).is_some());
    }

    #[test]
    fn writes_are_visible_later_in_the_same_transaction() {
        let store = InMemoryJobDataStore::new();
        let id = store
            .transaction::<_, StoreError, _>(|tx| {
                tx.insert_job(&new_job(), NodeId::new(1), None, Utc::now())
            })
            .unwrap()
            .id;

        // Read first, then write, then read back the write.
        let res: Result<(), StoreError> = store.transaction(|tx| {
            let mut job = tx.find_job(id)?.unwrap();
            assert!(job.executing_node_id.is_none());
            job.executing_node_id = Some(NodeId::new(2));
            tx.update_job(&job)?;
            assert_eq!(tx.find_job(id)?.unwrap().executing_node_id, Some(NodeId::new(2)));
            Err(StoreError::Conflict("roll back".into()))
        });
        assert!(res.is_err());
        assert!(store.job(id).unwrap().executing_node_id.is_none());

        let seen = store
            .transaction::<_, StoreError, _>(|tx| tx.find_job(id))
            .unwrap();
        assert_eq!(seen, store.job(id));
    }

    #[test]
    fn content_can_only_be_queued_once() {
        let store = InMemoryJobDataStore::new();
        let key = ResourceKey::new("VirtualMachine", 1);

        let err = store
            .transaction::<_, StoreError, _>(|tx| {
                let q = tx.ensure_queue(&key, 1, Utc::now())?;
                tx.insert_item(q.id, "AsyncJob", 5, Utc::now())?;
                tx.insert_item(q.id, "AsyncJob", 5, Utc::now())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.items().is_empty());
    }

    #[test]
    fn queue_limit_is_raise_only() {
        let store = InMemoryJobDataStore::new();
        let key = ResourceKey::new("Network", 3);

        let limits: Vec<u32> = [2, 1, 5]
            .into_iter()
            .map(|limit| {
                store
                    .transaction::<_, StoreError, _>(|tx| tx.ensure_queue(&key, limit, Utc::now()))
                    .unwrap()
                    .size_limit
            })
            .collect();
        assert_eq!(limits, vec![2, 2, 5]);
        assert_eq!(store.queues().len(), 1);
    }

    #[test]
    fn capacity_reports_store_full() {
        let store = InMemoryJobDataStore::new().with_capacity(1);
        store
            .transaction::<_, StoreError, _>(|tx| tx.insert_job(&new_job(), NodeId::new(1), None, Utc::now()))
            .unwrap();
        let err = store
            .transaction::<_, StoreError, _>(|tx| tx.insert_job(&new_job(), NodeId::new(1), None, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::StoreFull(_)));
    }

    #[test]
    fn claim_unowned_is_compare_and_set() {
        let store = InMemoryJobDataStore::new();
        let job = store
            .transaction::<_, StoreError, _>(|tx| tx.insert_job(&new_job(), NodeId::new(1), None, Utc::now()))
            .unwrap();

        let first = store
            .transaction::<_, StoreError, _>(|tx| tx.claim_unowned_job(job.id, NodeId::new(1), Utc::now()))
            .unwrap();
        let second = store
            .transaction::<_, StoreError, _>(|tx| tx.claim_unowned_job(job.id, NodeId::new(2), Utc::now()))
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.job(job.id).unwrap().executing_node_id, Some(NodeId::new(1)));
    }

    #[test]
    fn named_lock_is_exclusive_until_dropped() {
        let store = InMemoryJobDataStore::new();
        let lease = store.try_lock("heartbeat", Duration::from_secs(60)).unwrap();
        assert!(lease.is_some());
        assert!(store.try_lock("heartbeat", Duration::from_secs(60)).unwrap().is_none());
        assert!(store.try_lock("gc", Duration::from_secs(60)).unwrap().is_some());

        drop(lease);
        assert!(store.try_lock("heartbeat", Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn named_lock_expires_after_ttl() {
        let store = InMemoryJobDataStore::new();
        let stale = store.try_lock("gc", Duration::ZERO).unwrap();
        assert!(stale.is_some());
        let fresh = store.try_lock("gc", Duration::from_secs(60)).unwrap();
        assert!(fresh.is_some());

        drop(stale);
        assert!(store.try_lock("gc", Duration::from_secs(60)).unwrap().is_none());
    }
}
