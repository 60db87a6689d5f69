//! Postgres-backed job data store.
//!
//! The store traits are synchronous; every call is bridged onto the async
//! `sqlx` pool with a captured [`tokio::runtime::Handle`]. Callers must be on
//! plain OS threads (the manager's pools and scheduler loops) or inside
//! `spawn_blocking`, never directly on a runtime worker.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate queue content or join pair |
//! | Database (foreign key violation) | `23503` | `NotFound` | Item inserted into a missing queue |
//! | Database (lock not available) | `55P03` | `Storage` | `lock_timeout` elapsed |
//! | Database (disk full / out of memory) | `53100` / `53200` | `StoreFull` | Store cannot grow |
//! | Other | Any other | `Storage` | Connectivity, decoding, etc. |
//!
//! ## Locking
//!
//! `lock_*` methods use `SELECT ... FOR UPDATE`. Every transaction sets a local
//! `lock_timeout` so a stuck row lock surfaces as an error instead of a hang.
//! Loop election uses session-level advisory locks held on a dedicated pooled
//! connection for the lifetime of the lease.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use asyncjob_core::{JobId, JobStatus, JoinId, NodeId, QueueId, QueueItemId};

use super::r#trait::{
    JobDataStore, JobRepository, JoinMapRepository, StoreError, StoreResult, StoreTx,
    SyncQueueItemRepository, SyncQueueRepository,
};
use crate::jobs::types::{
    JOB_CONTENT_TYPE, Job, JoinMapEntry, NewJob, NewJoin, ResourceKey, Signals, SyncQueue,
    SyncQueueItem,
};

const SCHEMA: &str = include_str!("../../migrations/0001_async_jobs.sql");

macro_rules! job_columns {
    () => {
        "id, uuid, dispatcher, cmd, cmd_payload, instance_type, instance_id, related, \
         init_msid, executing_msid, complete_msid, status, process_status, result_code, \
         result, pending_signals, wakeup_dispatcher, created, last_updated, last_polled, removed"
    };
}

macro_rules! queue_columns {
    () => {
        "id, resource_type, resource_id, size_limit, queue_size, last_process_number, \
         created, last_updated"
    };
}

macro_rules! item_columns {
    () => {
        "id, queue_id, content_type, content_id, created, last_process_msid, \
         last_process_number, last_process_time"
    };
}

macro_rules! join_columns {
    () => {
        "id, job_id, join_job_id, join_status, join_result, join_msid, complete_msid, \
         wakeup_handler, wakeup_dispatcher, wakeup_interval_ms, next_wakeup_time, expiration, \
         sync_source_id, created, last_updated"
    };
}

/// Job data store on a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobDataStore {
    pool: PgPool,
    handle: Handle,
    lock_wait_timeout: Duration,
}

impl PostgresJobDataStore {
    /// Wrap an existing pool. Must be called from within a tokio runtime; the
    /// runtime's handle is captured for later blocking calls.
    pub fn new(pool: PgPool, lock_wait_timeout: Duration) -> StoreResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::Runtime(
                "PostgresJobDataStore requires a tokio runtime; create it from within one"
                    .to_string(),
            )
        })?;
        Ok(Self {
            pool,
            handle,
            lock_wait_timeout,
        })
    }

    /// Connect to `database_url` and wrap the resulting pool.
    #[instrument(skip(database_url), err)]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        lock_wait_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::new(pool, lock_wait_timeout)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        debug!("job schema ensured");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_wait_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
        Ok(tx)
    }

    #[instrument(skip(self), err)]
    async fn acquire_advisory(&self, name: &str) -> StoreResult<Option<PoolConnection<Postgres>>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("try_advisory_lock", e))?;
        Ok(locked.then_some(conn))
    }
}

impl JobDataStore for PostgresJobDataStore {
    type Lease = PgAdvisoryLease;

    fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<R, E>,
        E: From<StoreError>,
    {
        let tx = self.handle.block_on(self.begin())?;
        let mut store_tx = PgStoreTx {
            tx,
            handle: self.handle.clone(),
        };
        match f(&mut store_tx) {
            Ok(value) => {
                self.handle
                    .block_on(store_tx.tx.commit())
                    .map_err(|e| map_sqlx_error("commit", e))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.handle.block_on(store_tx.tx.rollback()) {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Advisory locks are session-scoped, so `ttl` is not needed: the lock
    /// disappears with the connection if this process dies.
    fn try_lock(&self, name: &str, _ttl: Duration) -> StoreResult<Option<Self::Lease>> {
        let conn = self.handle.block_on(self.acquire_advisory(name))?;
        Ok(conn.map(|conn| PgAdvisoryLease {
            name: name.to_string(),
            conn: Some(conn),
            handle: self.handle.clone(),
        }))
    }
}

/// Held advisory lock; unlocked when dropped.
#[derive(Debug)]
pub struct PgAdvisoryLease {
    name: String,
    conn: Option<PoolConnection<Postgres>>,
    handle: Handle,
}

impl PgAdvisoryLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PgAdvisoryLease {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let name = std::mem::take(&mut self.name);
        let unlock = async move {
            let res = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(&name)
                .execute(&mut *conn)
                .await;
            if let Err(e) = res {
                warn!(lock = %name, error = %e, "failed to release advisory lock, closing connection");
                let _ = conn.close().await;
            }
        };
        if Handle::try_current().is_ok() {
            self.handle.spawn(unlock);
        } else {
            self.handle.block_on(unlock);
        }
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
    handle: Handle,
}

impl PgStoreTx {
    fn conn(&mut self) -> (&mut PgConnection, &Handle) {
        (&mut *self.tx, &self.handle)
    }

    fn fetch_optional(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<Option<PgRow>> {
        let (conn, handle) = self.conn();
        handle
            .block_on(query.fetch_optional(conn))
            .map_err(|e| map_sqlx_error(op, e))
    }

    fn fetch_one(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<PgRow> {
        let (conn, handle) = self.conn();
        handle
            .block_on(query.fetch_one(conn))
            .map_err(|e| map_sqlx_error(op, e))
    }

    fn fetch_all(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<Vec<PgRow>> {
        let (conn, handle) = self.conn();
        handle
            .block_on(query.fetch_all(conn))
            .map_err(|e| map_sqlx_error(op, e))
    }

    /// Returns the number of affected rows.
    fn execute(&mut self, op: &'static str, query: Query<'_, Postgres, PgArguments>) -> StoreResult<u64> {
        let (conn, handle) = self.conn();
        handle
            .block_on(query.execute(conn))
            .map(|done| done.rows_affected())
            .map_err(|e| map_sqlx_error(op, e))
    }

    fn job_opt(&mut self, op: &'static str, query: Query<'_, Postgres, PgArguments>) -> StoreResult<Option<Job>> {
        self.fetch_optional(op, query)?
            .map(|row| job_from_row(&row).map_err(|e| map_sqlx_error(op, e)))
            .transpose()
    }

    fn job_ids(&mut self, op: &'static str, query: Query<'_, Postgres, PgArguments>) -> StoreResult<Vec<JobId>> {
        self.fetch_all(op, query)?
            .iter()
            .map(|row| {
                row.try_get::<i64, _>("id")
                    .map(JobId::new)
                    .map_err(|e| map_sqlx_error(op, e))
            })
            .collect()
    }

    fn queue_opt(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<Option<SyncQueue>> {
        self.fetch_optional(op, query)?
            .map(|row| queue_from_row(&row).map_err(|e| map_sqlx_error(op, e)))
            .transpose()
    }

    fn item_opt(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<Option<SyncQueueItem>> {
        self.fetch_optional(op, query)?
            .map(|row| item_from_row(&row).map_err(|e| map_sqlx_error(op, e)))
            .transpose()
    }

    fn items(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<Vec<SyncQueueItem>> {
        self.fetch_all(op, query)?
            .iter()
            .map(|row| item_from_row(row).map_err(|e| map_sqlx_error(op, e)))
            .collect()
    }

    fn joins(
        &mut self,
        op: &'static str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> StoreResult<Vec<JoinMapEntry>> {
        self.fetch_all(op, query)?
            .iter()
            .map(|row| join_from_row(row).map_err(|e| map_sqlx_error(op, e)))
            .collect()
    }
}

impl JobRepository for PgStoreTx {
    fn insert_job(
        &mut self,
        new: &NewJob,
        init_node: NodeId,
        executing_node: Option<NodeId>,
        now: DateTime<Utc>,
    ) -> StoreResult<Job> {
        let draft = Job::from_new(JobId::new(0), new, init_node, executing_node, now);
        let row = self.fetch_one(
            "insert_job",
            sqlx::query(
                "INSERT INTO async_job (uuid, dispatcher, cmd, cmd_payload, instance_type, \
                 instance_id, related, init_msid, executing_msid, status, process_status, \
                 result_code, pending_signals, created, last_updated) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14) \
                 RETURNING id",
            )
            .bind(draft.uuid)
            .bind(&draft.dispatcher)
            .bind(&draft.cmd)
            .bind(&draft.cmd_payload)
            .bind(&draft.instance_type)
            .bind(draft.instance_id)
            .bind(draft.related.map(|r| r.get()))
            .bind(init_node.as_db())
            .bind(executing_node.map(|n| n.as_db()))
            .bind(draft.status.as_str())
            .bind(draft.process_status)
            .bind(draft.result_code)
            .bind(draft.pending_signals.bits() as i32)
            .bind(now),
        )?;
        let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(Job {
            id: JobId::new(id),
            ..draft
        })
    }

    fn find_job(&mut self, id: JobId) -> StoreResult<Option<Job>> {
        self.job_opt(
            "find_job",
            sqlx::query(concat!("SELECT ", job_columns!(), " FROM async_job WHERE id = $1"))
                .bind(id.get()),
        )
    }

    fn lock_job(&mut self, id: JobId) -> StoreResult<Option<Job>> {
        self.job_opt(
            "lock_job",
            sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                " FROM async_job WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.get()),
        )
    }

    fn update_job(&mut self, job: &Job) -> StoreResult<()> {
        let updated = self.execute(
            "update_job",
            sqlx::query(
                "UPDATE async_job SET dispatcher = $2, cmd = $3, cmd_payload = $4, \
                 instance_type = $5, instance_id = $6, related = $7, executing_msid = $8, \
                 complete_msid = $9, status = $10, process_status = $11, result_code = $12, \
                 result = $13, pending_signals = $14, wakeup_dispatcher = $15, \
                 last_updated = $16, last_polled = $17, removed = $18 \
                 WHERE id = $1",
            )
            .bind(job.id.get())
            .bind(&job.dispatcher)
            .bind(&job.cmd)
            .bind(&job.cmd_payload)
            .bind(&job.instance_type)
            .bind(job.instance_id)
            .bind(job.related.map(|r| r.get()))
            .bind(job.executing_node_id.map(|n| n.as_db()))
            .bind(job.complete_node_id.map(|n| n.as_db()))
            .bind(job.status.as_str())
            .bind(job.process_status)
            .bind(job.result_code)
            .bind(&job.result)
            .bind(job.pending_signals.bits() as i32)
            .bind(&job.wakeup_dispatcher)
            .bind(job.last_updated)
            .bind(job.last_polled)
            .bind(job.removed),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    fn expunge_job(&mut self, id: JobId) -> StoreResult<bool> {
        let deleted = self.execute(
            "expunge_job",
            sqlx::query("DELETE FROM async_job WHERE id = $1").bind(id.get()),
        )?;
        Ok(deleted > 0)
    }

    fn claim_unowned_job(
        &mut self,
        id: JobId,
        node: NodeId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        self.job_opt(
            "claim_unowned_job",
            sqlx::query(concat!(
                "UPDATE async_job SET executing_msid = $2, last_updated = $3 \
                 WHERE id = $1 AND status = 'IN_PROGRESS' AND executing_msid IS NULL \
                 RETURNING ",
                job_columns!()
            ))
            .bind(id.get())
            .bind(node.as_db())
            .bind(now),
        )
    }

    fn jobs_executing_on(&mut self, node: NodeId) -> StoreResult<Vec<Job>> {
        let op = "jobs_executing_on";
        self.fetch_all(
            op,
            sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                " FROM async_job WHERE status = 'IN_PROGRESS' AND executing_msid = $1 \
                 ORDER BY id FOR UPDATE"
            ))
            .bind(node.as_db()),
        )?
        .iter()
        .map(|row| job_from_row(row).map_err(|e| map_sqlx_error(op, e)))
        .collect()
    }

    fn signaled_unowned_jobs(&mut self, signal: Signals, limit: usize) -> StoreResult<Vec<JobId>> {
        self.job_ids(
            "signaled_unowned_jobs",
            sqlx::query(
                "SELECT j.id FROM async_job j \
                 WHERE j.status = 'IN_PROGRESS' AND j.executing_msid IS NULL \
                 AND j.pending_signals & $1 = $1 AND $1 <> 0 \
                 AND NOT EXISTS (SELECT 1 FROM sync_queue_item i \
                                 WHERE i.content_type = $2 AND i.content_id = j.id) \
                 ORDER BY j.id LIMIT $3",
            )
            .bind(signal.bits() as i32)
            .bind(JOB_CONTENT_TYPE)
            .bind(limit as i64),
        )
    }

    fn expired_unfinished_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobId>> {
        self.job_ids(
            "expired_unfinished_jobs",
            sqlx::query(
                "SELECT id FROM async_job WHERE status = 'IN_PROGRESS' AND created < $1 \
                 ORDER BY id LIMIT $2",
            )
            .bind(cutoff)
            .bind(limit as i64),
        )
    }

    fn expired_completed_jobs(
        &mut self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobId>> {
        self.job_ids(
            "expired_completed_jobs",
            sqlx::query(
                "SELECT id FROM async_job WHERE status <> 'IN_PROGRESS' AND last_updated < $1 \
                 ORDER BY id LIMIT $2",
            )
            .bind(cutoff)
            .bind(limit as i64),
        )
    }

    fn active_jobs_for_instance(
        &mut self,
        instance_type: &str,
        instance_id: i64,
    ) -> StoreResult<Vec<Job>> {
        let op = "active_jobs_for_instance";
        self.fetch_all(
            op,
            sqlx::query(concat!(
                "SELECT ",
                job_columns!(),
                " FROM async_job WHERE status = 'IN_PROGRESS' \
                 AND instance_type = $1 AND instance_id = $2 ORDER BY id"
            ))
            .bind(instance_type)
            .bind(instance_id),
        )?
        .iter()
        .map(|row| job_from_row(row).map_err(|e| map_sqlx_error(op, e)))
        .collect()
    }
}

impl SyncQueueRepository for PgStoreTx {
    fn ensure_queue(
        &mut self,
        key: &ResourceKey,
        size_limit: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncQueue> {
        let queue = self.queue_opt(
            "ensure_queue",
            sqlx::query(concat!(
                "INSERT INTO sync_queue (resource_type, resource_id, size_limit, queue_size, \
                 last_process_number, created, last_updated) \
                 VALUES ($1, $2, $3, 0, 0, $4, $4) \
                 ON CONFLICT (resource_type, resource_id) DO UPDATE SET \
                 size_limit = GREATEST(sync_queue.size_limit, EXCLUDED.size_limit), \
                 last_updated = CASE WHEN EXCLUDED.size_limit > sync_queue.size_limit \
                 THEN EXCLUDED.last_updated ELSE sync_queue.last_updated END \
                 RETURNING ",
                queue_columns!()
            ))
            .bind(&key.resource_type)
            .bind(key.resource_id)
            .bind(i32::try_from(size_limit).unwrap_or(i32::MAX))
            .bind(now),
        )?;
        queue.ok_or_else(|| StoreError::Storage(format!("ensure_queue returned no row for {key}")))
    }

    fn find_queue(&mut self, id: QueueId) -> StoreResult<Option<SyncQueue>> {
        self.queue_opt(
            "find_queue",
            sqlx::query(concat!("SELECT ", queue_columns!(), " FROM sync_queue WHERE id = $1"))
                .bind(id.get()),
        )
    }

    fn find_queue_by_key(&mut self, key: &ResourceKey) -> StoreResult<Option<SyncQueue>> {
        self.queue_opt(
            "find_queue_by_key",
            sqlx::query(concat!(
                "SELECT ",
                queue_columns!(),
                " FROM sync_queue WHERE resource_type = $1 AND resource_id = $2"
            ))
            .bind(&key.resource_type)
            .bind(key.resource_id),
        )
    }

    fn lock_queue(&mut self, id: QueueId) -> StoreResult<Option<SyncQueue>> {
        self.queue_opt(
            "lock_queue",
            sqlx::query(concat!(
                "SELECT ",
                queue_columns!(),
                " FROM sync_queue WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.get()),
        )
    }

    fn update_queue(&mut self, queue: &SyncQueue) -> StoreResult<()> {
        let updated = self.execute(
            "update_queue",
            sqlx::query(
                "UPDATE sync_queue SET size_limit = $2, queue_size = $3, \
                 last_process_number = $4, last_updated = $5 WHERE id = $1",
            )
            .bind(queue.id.get())
            .bind(i32::try_from(queue.size_limit).unwrap_or(i32::MAX))
            .bind(i32::try_from(queue.queue_size).unwrap_or(i32::MAX))
            .bind(queue.last_process_number)
            .bind(queue.last_updated),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("sync queue {}", queue.id)));
        }
        Ok(())
    }
}

impl SyncQueueItemRepository for PgStoreTx {
    fn insert_item(
        &mut self,
        queue_id: QueueId,
        content_type: &str,
        content_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncQueueItem> {
        let item = self.item_opt(
            "insert_item",
            sqlx::query(concat!(
                "INSERT INTO sync_queue_item (queue_id, content_type, content_id, created) \
                 VALUES ($1, $2, $3, $4) RETURNING ",
                item_columns!()
            ))
            .bind(queue_id.get())
            .bind(content_type)
            .bind(content_id)
            .bind(now),
        )?;
        item.ok_or_else(|| StoreError::Storage("insert_item returned no row".to_string()))
    }

    fn find_item(&mut self, id: QueueItemId) -> StoreResult<Option<SyncQueueItem>> {
        self.item_opt(
            "find_item",
            sqlx::query(concat!("SELECT ", item_columns!(), " FROM sync_queue_item WHERE id = $1"))
                .bind(id.get()),
        )
    }

    fn lock_item(&mut self, id: QueueItemId) -> StoreResult<Option<SyncQueueItem>> {
        self.item_opt(
            "lock_item",
            sqlx::query(concat!(
                "SELECT ",
                item_columns!(),
                " FROM sync_queue_item WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.get()),
        )
    }

    fn find_item_by_content(
        &mut self,
        content_type: &str,
        content_id: i64,
    ) -> StoreResult<Option<SyncQueueItem>> {
        self.item_opt(
            "find_item_by_content",
            sqlx::query(concat!(
                "SELECT ",
                item_columns!(),
                " FROM sync_queue_item WHERE content_type = $1 AND content_id = $2"
            ))
            .bind(content_type)
            .bind(content_id),
        )
    }

    fn update_item(&mut self, item: &SyncQueueItem) -> StoreResult<()> {
        let updated = self.execute(
            "update_item",
            sqlx::query(
                "UPDATE sync_queue_item SET last_process_msid = $2, last_process_number = $3, \
                 last_process_time = $4 WHERE id = $1",
            )
            .bind(item.id.get())
            .bind(item.last_process_msid.map(|n| n.as_db()))
            .bind(item.last_process_number)
            .bind(item.last_process_time),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("sync queue item {}", item.id)));
        }
        Ok(())
    }

    fn delete_item(&mut self, id: QueueItemId) -> StoreResult<bool> {
        let deleted = self.execute(
            "delete_item",
            sqlx::query("DELETE FROM sync_queue_item WHERE id = $1").bind(id.get()),
        )?;
        Ok(deleted > 0)
    }

    fn active_item_count(&mut self, queue_id: QueueId) -> StoreResult<u32> {
        let row = self.fetch_one(
            "active_item_count",
            sqlx::query(
                "SELECT COUNT(*) AS active FROM sync_queue_item \
                 WHERE queue_id = $1 AND last_process_msid IS NOT NULL",
            )
            .bind(queue_id.get()),
        )?;
        let active: i64 = row
            .try_get("active")
            .map_err(|e| map_sqlx_error("active_item_count", e))?;
        Ok(u32::try_from(active).unwrap_or(u32::MAX))
    }

    fn next_unclaimed_item(&mut self, queue_id: QueueId) -> StoreResult<Option<SyncQueueItem>> {
        self.item_opt(
            "next_unclaimed_item",
            sqlx::query(concat!(
                "SELECT ",
                item_columns!(),
                " FROM sync_queue_item WHERE queue_id = $1 AND last_process_msid IS NULL \
                 ORDER BY id LIMIT 1"
            ))
            .bind(queue_id.get()),
        )
    }

    fn unclaimed_items(&mut self, limit: usize) -> StoreResult<Vec<SyncQueueItem>> {
        self.items(
            "unclaimed_items",
            sqlx::query(concat!(
                "SELECT ",
                item_columns!(),
                " FROM sync_queue_item WHERE last_process_msid IS NULL ORDER BY id LIMIT $1"
            ))
            .bind(limit as i64),
        )
    }

    fn items_claimed_by(&mut self, node: NodeId) -> StoreResult<Vec<SyncQueueItem>> {
        self.items(
            "items_claimed_by",
            sqlx::query(concat!(
                "SELECT ",
                item_columns!(),
                " FROM sync_queue_item WHERE last_process_msid = $1 ORDER BY id"
            ))
            .bind(node.as_db()),
        )
    }

    fn items_claimed_before(&mut self, cutoff: DateTime<Utc>) -> StoreResult<Vec<SyncQueueItem>> {
        self.items(
            "items_claimed_before",
            sqlx::query(concat!(
                "SELECT ",
                item_columns!(),
                " FROM sync_queue_item WHERE last_process_msid IS NOT NULL \
                 AND last_process_time < $1 ORDER BY id"
            ))
            .bind(cutoff),
        )
    }
}

impl JoinMapRepository for PgStoreTx {
    fn insert_join(&mut self, join: &NewJoin, now: DateTime<Utc>) -> StoreResult<JoinMapEntry> {
        let mut entries = self.joins(
            "insert_join",
            sqlx::query(concat!(
                "INSERT INTO async_job_join_map (job_id, join_job_id, join_status, join_msid, \
                 wakeup_handler, wakeup_dispatcher, wakeup_interval_ms, next_wakeup_time, \
                 expiration, sync_source_id, created, last_updated) \
                 VALUES ($1, $2, 'IN_PROGRESS', $3, $4, $5, $6, $7, $8, $9, $10, $10) \
                 RETURNING ",
                join_columns!()
            ))
            .bind(join.job_id.get())
            .bind(join.join_job_id.get())
            .bind(join.join_node_id.as_db())
            .bind(&join.wakeup_handler)
            .bind(&join.wakeup_dispatcher)
            .bind(i64::try_from(join.wakeup_interval_ms).unwrap_or(i64::MAX))
            .bind(join.next_wakeup_time)
            .bind(join.expiration)
            .bind(join.sync_source_id.map(|i| i.get()))
            .bind(now),
        )?;
        entries
            .pop()
            .ok_or_else(|| StoreError::Storage("insert_join returned no row".to_string()))
    }

    fn find_join(&mut self, job_id: JobId, join_job_id: JobId) -> StoreResult<Option<JoinMapEntry>> {
        let mut entries = self.joins(
            "find_join",
            sqlx::query(concat!(
                "SELECT ",
                join_columns!(),
                " FROM async_job_join_map WHERE job_id = $1 AND join_job_id = $2"
            ))
            .bind(job_id.get())
            .bind(join_job_id.get()),
        )?;
        Ok(entries.pop())
    }

    fn joins_awaiting(&mut self, join_job_id: JobId) -> StoreResult<Vec<JoinMapEntry>> {
        self.joins(
            "joins_awaiting",
            sqlx::query(concat!(
                "SELECT ",
                join_columns!(),
                " FROM async_job_join_map WHERE join_job_id = $1 ORDER BY id FOR UPDATE"
            ))
            .bind(join_job_id.get()),
        )
    }

    fn joins_of_waiter(&mut self, job_id: JobId) -> StoreResult<Vec<JoinMapEntry>> {
        self.joins(
            "joins_of_waiter",
            sqlx::query(concat!(
                "SELECT ",
                join_columns!(),
                " FROM async_job_join_map WHERE job_id = $1 ORDER BY id"
            ))
            .bind(job_id.get()),
        )
    }

    fn update_join(&mut self, entry: &JoinMapEntry) -> StoreResult<()> {
        let updated = self.execute(
            "update_join",
            sqlx::query(
                "UPDATE async_job_join_map SET join_status = $2, join_result = $3, \
                 complete_msid = $4, next_wakeup_time = $5, last_updated = $6 WHERE id = $1",
            )
            .bind(entry.id.get())
            .bind(entry.join_status.as_str())
            .bind(&entry.join_result)
            .bind(entry.complete_node_id.map(|n| n.as_db()))
            .bind(entry.next_wakeup_time)
            .bind(entry.last_updated),
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("join entry {}", entry.id)));
        }
        Ok(())
    }

    fn delete_join(&mut self, job_id: JobId, join_job_id: JobId) -> StoreResult<bool> {
        let deleted = self.execute(
            "delete_join",
            sqlx::query("DELETE FROM async_job_join_map WHERE job_id = $1 AND join_job_id = $2")
                .bind(job_id.get())
                .bind(join_job_id.get()),
        )?;
        Ok(deleted > 0)
    }

    fn delete_joins_involving(&mut self, job_id: JobId) -> StoreResult<usize> {
        let deleted = self.execute(
            "delete_joins_involving",
            sqlx::query("DELETE FROM async_job_join_map WHERE job_id = $1 OR join_job_id = $1")
                .bind(job_id.get()),
        )?;
        Ok(deleted as usize)
    }

    fn joins_due_for_wakeup(&mut self, now: DateTime<Utc>) -> StoreResult<Vec<JoinMapEntry>> {
        self.joins(
            "joins_due_for_wakeup",
            sqlx::query(concat!(
                "SELECT ",
                join_columns!(),
                " FROM async_job_join_map WHERE join_status = 'IN_PROGRESS' \
                 AND expiration > $1 AND next_wakeup_time <= $1 ORDER BY id FOR UPDATE SKIP LOCKED"
            ))
            .bind(now),
        )
    }

    fn expired_joins(&mut self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<JoinMapEntry>> {
        self.joins(
            "expired_joins",
            sqlx::query(concat!(
                "SELECT ",
                join_columns!(),
                " FROM async_job_join_map WHERE expiration <= $1 ORDER BY id LIMIT $2 \
                 FOR UPDATE SKIP LOCKED"
            ))
            .bind(now)
            .bind(limit as i64),
        )
    }
}

// Row mappers

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn status_from_row(row: &PgRow, column: &str) -> Result<JobStatus, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(decode_err)
}

fn node_from_row(row: &PgRow, column: &str) -> Result<Option<NodeId>, sqlx::Error> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(NodeId::from_db))
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    Ok(Job {
        id: JobId::new(row.try_get("id")?),
        uuid: row.try_get("uuid")?,
        dispatcher: row.try_get("dispatcher")?,
        cmd: row.try_get("cmd")?,
        cmd_payload: row.try_get("cmd_payload")?,
        instance_type: row.try_get("instance_type")?,
        instance_id: row.try_get("instance_id")?,
        related: row.try_get::<Option<i64>, _>("related")?.map(JobId::new),
        init_node_id: NodeId::from_db(row.try_get("init_msid")?),
        executing_node_id: node_from_row(row, "executing_msid")?,
        complete_node_id: node_from_row(row, "complete_msid")?,
        status: status_from_row(row, "status")?,
        process_status: row.try_get("process_status")?,
        result_code: row.try_get("result_code")?,
        result: row.try_get("result")?,
        pending_signals: Signals::from_bits(row.try_get::<i32, _>("pending_signals")? as u32),
        wakeup_dispatcher: row.try_get("wakeup_dispatcher")?,
        created: row.try_get("created")?,
        last_updated: row.try_get("last_updated")?,
        last_polled: row.try_get("last_polled")?,
        removed: row.try_get("removed")?,
        sync_source: None,
    })
}

fn queue_from_row(row: &PgRow) -> Result<SyncQueue, sqlx::Error> {
    Ok(SyncQueue {
        id: QueueId::new(row.try_get("id")?),
        key: ResourceKey::new(
            row.try_get::<String, _>("resource_type")?,
            row.try_get("resource_id")?,
        ),
        size_limit: row.try_get::<i32, _>("size_limit")?.max(0) as u32,
        queue_size: row.try_get::<i32, _>("queue_size")?.max(0) as u32,
        last_process_number: row.try_get("last_process_number")?,
        created: row.try_get("created")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<SyncQueueItem, sqlx::Error> {
    Ok(SyncQueueItem {
        id: QueueItemId::new(row.try_get("id")?),
        queue_id: QueueId::new(row.try_get("queue_id")?),
        content_type: row.try_get("content_type")?,
        content_id: row.try_get("content_id")?,
        created: row.try_get("created")?,
        last_process_msid: node_from_row(row, "last_process_msid")?,
        last_process_number: row.try_get("last_process_number")?,
        last_process_time: row.try_get("last_process_time")?,
    })
}

fn join_from_row(row: &PgRow) -> Result<JoinMapEntry, sqlx::Error> {
    Ok(JoinMapEntry {
        id: JoinId::new(row.try_get("id")?),
        job_id: JobId::new(row.try_get("job_id")?),
        join_job_id: JobId::new(row.try_get("join_job_id")?),
        join_status: status_from_row(row, "join_status")?,
        join_result: row.try_get("join_result")?,
        join_node_id: NodeId::from_db(row.try_get("join_msid")?),
        complete_node_id: node_from_row(row, "complete_msid")?,
        wakeup_handler: row.try_get("wakeup_handler")?,
        wakeup_dispatcher: row.try_get("wakeup_dispatcher")?,
        wakeup_interval_ms: row.try_get::<i64, _>("wakeup_interval_ms")?.max(0) as u64,
        next_wakeup_time: row.try_get("next_wakeup_time")?,
        expiration: row.try_get("expiration")?,
        sync_source_id: row
            .try_get::<Option<i64>, _>("sync_source_id")?
            .map(QueueItemId::new),
        created: row.try_get("created")?,
        last_updated: row.try_get("last_updated")?,
    })
}

/// Map sqlx errors to `StoreError`, keyed by SQLSTATE.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                Some("53100") | Some("53200") => StoreError::StoreFull(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Storage(format!("timed out waiting for a connection in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
