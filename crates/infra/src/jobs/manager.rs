//! Job manager: submission, completion, status, joins and waits.
//!
//! ## Ownership
//!
//! `executing_node_id` names the node currently running a job. It is set when a
//! job is submitted for direct dispatch or claimed from its sync queue, and
//! cleared when the job parks or when a hand-off to a worker pool fails.
//! Re-claiming an unowned job is a compare-and-set, so at most one node
//! redispatches a woken waiter.
//!
//! ## Completion
//!
//! `complete` is idempotent. Its effects (terminal status, waiter wakeups, join
//! deletion, queue purge) commit in one transaction; the notification is
//! published only after the commit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use asyncjob_core::{JobId, JobStatus, NodeId, QueueId, QueueItemId};
use asyncjob_events::{EventBus, JobNotification};

use crate::job_store::{JobDataStore, StoreResult, StoreTx};

use super::config::JobManagerConfig;
use super::control::JobControl;
use super::error::{JobManagerError, PoolError};
use super::monitor::{ActiveJob, ActiveJobRegistry};
use super::pool::WorkerPool;
use super::recovery::RecoveryHook;
use super::registry::{DispatcherRegistry, PoolKind};
use super::sync_queue::{
    SyncQueueManager, purge_content_in_tx, purge_item_in_tx, queue_in_tx, return_item_in_tx,
    to_chrono,
};
use super::types::{
    JOB_CONTENT_TYPE, Job, JoinMapEntry, JoinRequest, MAX_QUEUE_SIZE_LIMIT, NewJob, NewJoin,
    ResourceKey, SyncQueueItem,
};

pub(super) struct ManagerInner<S, B> {
    pub(super) config: JobManagerConfig,
    pub(super) store: Arc<S>,
    pub(super) bus: B,
    pub(super) queues: SyncQueueManager<S>,
    pub(super) registry: DispatcherRegistry,
    pub(super) api_pool: WorkerPool,
    pub(super) worker_pool: WorkerPool,
    pub(super) active: ActiveJobRegistry,
    pub(super) accepting: AtomicBool,
    /// Directly submitted jobs that found their pool saturated.
    pub(super) overflow: Mutex<VecDeque<JobId>>,
    pub(super) hooks: RwLock<HashMap<String, Arc<dyn RecoveryHook>>>,
}

/// A waiter marked with WAKEUP inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Woken {
    pub(super) job_id: JobId,
    /// The waiter still has a sync queue item, so the heartbeat redraws it.
    pub(super) queued: bool,
}

/// Committed effects of one completion.
#[derive(Debug, Clone)]
pub(super) struct Completion {
    pub(super) job: Job,
    pub(super) woken: Vec<Woken>,
}

/// Durable, multi-node-safe async job manager.
///
/// Cheap to clone; clones share the same pools and registries.
pub struct JobManager<S, B> {
    pub(super) inner: Arc<ManagerInner<S, B>>,
}

impl<S, B> Clone for JobManager<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, B> JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    pub fn new(
        config: JobManagerConfig,
        store: Arc<S>,
        bus: B,
        registry: DispatcherRegistry,
    ) -> Self {
        let node = config.node_id;
        let api_pool = WorkerPool::new(
            format!("api-job-{node}"),
            config.api_pool_size,
            config.pool_queue_capacity,
        );
        let worker_pool = WorkerPool::new(
            format!("worker-job-{node}"),
            config.worker_pool_size,
            config.pool_queue_capacity,
        );
        info!(
            node_id = %node,
            dispatchers = ?registry.names(),
            api_pool_size = api_pool.size(),
            worker_pool_size = worker_pool.size(),
            "job manager created"
        );

        Self {
            inner: Arc::new(ManagerInner {
                accepting: AtomicBool::new(config.accepting_jobs),
                queues: SyncQueueManager::new(store.clone()),
                config,
                store,
                bus,
                registry,
                api_pool,
                worker_pool,
                active: ActiveJobRegistry::new(),
                overflow: Mutex::new(VecDeque::new()),
                hooks: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn sync_queue(&self) -> &SyncQueueManager<S> {
        &self.inner.queues
    }

    pub fn registry(&self) -> &DispatcherRegistry {
        &self.inner.registry
    }

    /// Enable or disable new submissions (controlled shutdown).
    pub fn set_accepting(&self, accepting: bool) {
        let was = self.inner.accepting.swap(accepting, Ordering::SeqCst);
        if was != accepting {
            info!(node_id = %self.node_id(), accepting, "job submission state changed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Jobs this node is dispatching right now.
    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.inner.active.snapshot()
    }

    /// Stop accepting jobs and drain both worker pools.
    pub fn shutdown(&self) {
        self.set_accepting(false);
        if !self.inner.active.is_empty() {
            let in_flight = self.inner.active.len();
            info!(node_id = %self.node_id(), in_flight, "waiting for running jobs");
        }
        self.inner.api_pool.shutdown();
        self.inner.worker_pool.shutdown();
        info!(node_id = %self.node_id(), "job manager stopped");
    }

    fn admit(&self, new: &NewJob) -> Result<(), JobManagerError> {
        if !self.is_accepting() {
            return Err(JobManagerError::ShuttingDown);
        }
        if !self.inner.registry.contains(&new.dispatcher) {
            return Err(JobManagerError::UnknownDispatcher(new.dispatcher.clone()));
        }
        Ok(())
    }

    pub fn submit(&self, new: NewJob) -> Result<JobId, JobManagerError> {
        self.admit(&new)?;
        let node = self.node_id();
        let job = self
            .inner
            .store
            .transaction(|tx| tx.insert_job(&new, node, Some(node), Utc::now()))?;
        let job_id = job.id;
        info!(job_id = %job_id, dispatcher = %job.dispatcher, cmd = %job.cmd, "submitted job");

        if let Err(e) = self.schedule(job) {
            warn!(job_id = %job_id, error = %e, "pool saturated, deferring direct dispatch");
            self.retry_later(job_id);
        }
        Ok(job_id)
    }

    pub fn submit_serialized(
        &self,
        new: NewJob,
        key: &ResourceKey,
        size_limit: u32,
    ) -> Result<JobId, JobManagerError> {
        if size_limit > MAX_QUEUE_SIZE_LIMIT {
            return Err(JobManagerError::InvalidArgument(format!(
                "queue size limit {size_limit} exceeds {MAX_QUEUE_SIZE_LIMIT}"
            )));
        }
        self.admit(&new)?;
        let node = self.node_id();
        let (job, item) = self.inner.store.transaction(|tx| {
            let now = Utc::now();
            let job = tx.insert_job(&new, node, None, now)?;
            let (_, item) = queue_in_tx(tx, key, JOB_CONTENT_TYPE, job.id.get(), size_limit, now)?;
            Ok::<_, JobManagerError>((job, item))
        })?;
        info!(
            job_id = %job.id,
            dispatcher = %job.dispatcher,
            resource = %key,
            queue_id = %item.queue_id,
            "submitted job to sync queue"
        );
        Ok(job.id)
    }

    pub fn query_job(
        &self,
        job_id: JobId,
        update_poll_time: bool,
    ) -> Result<Option<Job>, JobManagerError> {
        if !update_poll_time {
            return Ok(self.inner.store.transaction(|tx| tx.find_job(job_id))?);
        }
        Ok(self.inner.store.transaction(|tx| {
            let Some(mut job) = tx.lock_job(job_id)? else {
                return Ok::<_, JobManagerError>(None);
            };
            job.last_polled = Some(Utc::now());
            tx.update_job(&job)?;
            Ok(Some(job))
        })?)
    }

    /// In-progress jobs attached to a resource instance.
    pub fn find_active_by_instance(
        &self,
        instance_type: &str,
        instance_id: i64,
    ) -> Result<Vec<Job>, JobManagerError> {
        Ok(self
            .inner
            .store
            .transaction(|tx| tx.active_jobs_for_instance(instance_type, instance_id))?)
    }

    /// Re-tag the resource a job concerns. No-op if the job is gone.
    pub fn update_attachment(
        &self,
        job_id: JobId,
        instance_type: &str,
        instance_id: i64,
    ) -> Result<(), JobManagerError> {
        self.inner.store.transaction(|tx| {
            if let Some(mut job) = tx.lock_job(job_id)? {
                job.instance_type = Some(instance_type.to_string());
                job.instance_id = Some(instance_id);
                job.last_updated = Utc::now();
                tx.update_job(&job)?;
            }
            Ok::<_, JobManagerError>(())
        })
    }

    /// Best-effort progress update. No-op if the job is gone or finished.
    pub fn update_progress(
        &self,
        job_id: JobId,
        process_status: i32,
        result: Option<JsonValue>,
    ) -> Result<(), JobManagerError> {
        self.inner.store.transaction(|tx| {
            match tx.lock_job(job_id)? {
                Some(mut job) if job.is_in_progress() => {
                    job.process_status = process_status;
                    if result.is_some() {
                        job.result = result;
                    }
                    job.last_updated = Utc::now();
                    tx.update_job(&job)?;
                    debug!(job_id = %job_id, process_status, "updated job progress");
                }
                _ => debug!(job_id = %job_id, "progress update for missing or finished job ignored"),
            }
            Ok::<_, JobManagerError>(())
        })
    }

    /// Move a job to a terminal status and wake its waiters.
    ///
    /// Returns the ids of the waiters that were woken. Completing a missing or
    /// already finished job is a no-op that returns an empty list.
    pub fn complete(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result: Option<JsonValue>,
    ) -> Result<Vec<JobId>, JobManagerError> {
        if !status.is_terminal() {
            return Err(JobManagerError::InvalidArgument(format!(
                "cannot complete job {job_id} with status {status}"
            )));
        }
        let node = self.node_id();
        let completion = self.inner.store.transaction(|tx| {
            complete_in_tx(tx, node, job_id, status, result_code, result, Utc::now())
        })?;

        let Some(completion) = completion else {
            debug!(job_id = %job_id, "complete on missing or finished job ignored");
            return Ok(Vec::new());
        };
        info!(
            job_id = %job_id,
            status = %status,
            result_code,
            woken = completion.woken.len(),
            "completed job"
        );
        self.publish(job_id, status);
        Ok(self.after_wakeups(&completion.woken))
    }

    /// Make `request.job_id` wait for `request.join_job_id`.
    pub fn join(&self, request: JoinRequest) -> Result<(), JobManagerError> {
        if request.timeout.is_zero() {
            return Err(JobManagerError::InvalidArgument(
                "join timeout must be positive".into(),
            ));
        }
        if request.job_id == request.join_job_id {
            return Err(JobManagerError::InvalidArgument(format!(
                "job {} cannot join itself",
                request.job_id
            )));
        }

        let node = self.node_id();
        let woken: Vec<Woken> = self.inner.store.transaction(|tx| {
            let now = Utc::now();
            if tx.find_join(request.job_id, request.join_job_id)?.is_some() {
                return Ok::<_, JobManagerError>(Vec::new());
            }
            // Row lock, so a concurrent completion either sees this entry or
            // is seen here as finished.
            let awaited_running = tx
                .lock_job(request.join_job_id)?
                .is_some_and(|j| j.is_in_progress());
            if !awaited_running {
                // Nothing left to wait for; fire the wakeup straight away.
                return match request.wakeup_dispatcher.clone() {
                    Some(d) => Ok(signal_waiter_in_tx(tx, request.job_id, Some(d), now)?
                        .into_iter()
                        .collect()),
                    None => Ok(Vec::new()),
                };
            }

            let expiration = now + to_chrono(request.timeout);
            let next_wakeup_time = (request.wakeup_dispatcher.is_some()
                && !request.wakeup_interval.is_zero())
            .then(|| (now + to_chrono(request.wakeup_interval)).min(expiration));
            let sync_source_id = tx
                .find_item_by_content(JOB_CONTENT_TYPE, request.job_id.get())?
                .map(|i| i.id);

            let entry = tx.insert_join(
                &NewJoin {
                    job_id: request.job_id,
                    join_job_id: request.join_job_id,
                    join_node_id: node,
                    wakeup_handler: request.wakeup_handler.clone(),
                    wakeup_dispatcher: request.wakeup_dispatcher.clone(),
                    wakeup_interval_ms: request.wakeup_interval.as_millis() as u64,
                    next_wakeup_time,
                    expiration,
                    sync_source_id,
                },
                now,
            )?;
            debug!(
                job_id = %entry.job_id,
                join_job_id = %entry.join_job_id,
                expiration = %entry.expiration,
                "joined job"
            );
            Ok(Vec::new())
        })?;

        self.after_wakeups(&woken);
        Ok(())
    }

    pub fn disjoin(&self, job_id: JobId, join_job_id: JobId) -> Result<(), JobManagerError> {
        let removed = self
            .inner
            .store
            .transaction(|tx| tx.delete_join(job_id, join_job_id))?;
        debug!(job_id = %job_id, join_job_id = %join_job_id, removed, "disjoined job");
        Ok(())
    }

    pub fn join_entries(&self, job_id: JobId) -> Result<Vec<JoinMapEntry>, JobManagerError> {
        Ok(self.inner.store.transaction(|tx| tx.joins_of_waiter(job_id))?)
    }

    /// Record an outcome on every join waiting for `join_job_id` and wake the
    /// waiters, without touching the awaited job itself.
    pub fn complete_join(
        &self,
        join_job_id: JobId,
        status: JobStatus,
        result: Option<JsonValue>,
    ) -> Result<(), JobManagerError> {
        if !status.is_terminal() {
            return Err(JobManagerError::InvalidArgument(format!(
                "cannot resolve joins on {join_job_id} with status {status}"
            )));
        }
        let node = self.node_id();
        let woken = self.inner.store.transaction(|tx| {
            let now = Utc::now();
            let mut woken = Vec::new();
            for mut entry in tx.joins_awaiting(join_job_id)? {
                entry.join_status = status;
                entry.join_result = result.clone();
                entry.complete_node_id = Some(node);
                entry.next_wakeup_time = None;
                entry.last_updated = now;
                tx.update_join(&entry)?;
                woken.extend(signal_join_waiter_in_tx(tx, &entry, now)?);
            }
            Ok::<_, JobManagerError>(woken)
        })?;
        debug!(join_job_id = %join_job_id, status = %status, woken = woken.len(), "resolved joins");
        self.after_wakeups(&woken);
        Ok(())
    }

    /// Cooperative wait: returns `true` once `job_id` is finished (or gone) or
    /// `predicate` holds, `false` when `timeout` elapses first.
    ///
    /// Blocks on a bus subscription for at most `poll_interval` at a time and
    /// re-reads the store after every wake, so a lost notification only costs
    /// latency.
    pub fn wait_and_check(
        &self,
        job_id: JobId,
        topics: &[&str],
        poll_interval: Duration,
        timeout: Option<Duration>,
        mut predicate: impl FnMut() -> bool,
    ) -> bool {
        let subscription = self.inner.bus.subscribe();
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll_interval = poll_interval.max(Duration::from_millis(1));

        loop {
            match self.inner.store.transaction(|tx| tx.find_job(job_id)) {
                Ok(Some(job)) if job.status.is_terminal() => return true,
                Ok(None) => return true,
                Ok(Some(_)) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "wait_and_check failed to read job"),
            }
            if predicate() {
                return true;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(poll_interval)
                }
                None => poll_interval,
            };

            let wake_deadline = Instant::now() + wait;
            loop {
                let remaining = wake_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match subscription.recv_timeout(remaining) {
                    Ok(n) if n.matches_any(topics) => break,
                    Ok(_) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => break,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        std::thread::sleep(remaining);
                        break;
                    }
                }
            }
        }
    }

    pub(super) fn publish(&self, job_id: JobId, status: JobStatus) {
        if let Err(e) = self.inner.bus.publish(JobNotification::job_state(job_id, status)) {
            warn!(job_id = %job_id, error = ?e, "failed to publish job notification");
        }
    }

    /// Redispatch standalone waiters; queued ones are redrawn by the heartbeat.
    pub(super) fn after_wakeups(&self, woken: &[Woken]) -> Vec<JobId> {
        let standalone: Vec<JobId> = woken.iter().filter(|w| !w.queued).map(|w| w.job_id).collect();
        self.reschedule_woken(&standalone);
        woken.iter().map(|w| w.job_id).collect()
    }

    /// Claim and dispatch unowned waiters. Returns how many were dispatched.
    pub(super) fn reschedule_woken(&self, job_ids: &[JobId]) -> usize {
        let node = self.node_id();
        let mut dispatched = 0;
        for &job_id in job_ids {
            let claimed = self
                .inner
                .store
                .transaction(|tx| tx.claim_unowned_job(job_id, node, Utc::now()));
            match claimed {
                Ok(Some(job)) => {
                    if let Err(e) = self.schedule(job) {
                        warn!(job_id = %job_id, error = %e, "pool saturated, leaving woken job for the heartbeat");
                        self.release_ownership(job_id);
                    } else {
                        dispatched += 1;
                    }
                }
                Ok(None) => debug!(job_id = %job_id, "woken job already owned or finished"),
                Err(e) => error!(job_id = %job_id, error = %e, "failed to claim woken job"),
            }
        }
        dispatched
    }

    /// Hand a job to the pool its dispatcher was registered on.
    pub(super) fn schedule(&self, job: Job) -> Result<(), PoolError> {
        let pool_kind = self.inner.registry.pool_kind(&job.dispatcher);
        let pool = match pool_kind {
            PoolKind::Api => &self.inner.api_pool,
            PoolKind::Worker => &self.inner.worker_pool,
        };
        let manager = self.clone();
        pool.try_execute(move || manager.run_job(job, pool_kind))
    }

    /// Clear `executing_node_id` if this node still holds it.
    pub(super) fn release_ownership(&self, job_id: JobId) {
        let node = self.node_id();
        let res = self.inner.store.transaction(|tx| -> StoreResult<()> {
            if let Some(mut job) = tx.lock_job(job_id)? {
                if job.is_in_progress() && job.executing_node_id == Some(node) {
                    job.executing_node_id = None;
                    job.last_updated = Utc::now();
                    tx.update_job(&job)?;
                }
            }
            Ok(())
        });
        if let Err(e) = res {
            error!(job_id = %job_id, error = %e, "failed to release job ownership");
        }
    }

    /// Take ownership of the job behind a claimed item and dispatch it.
    ///
    /// Returns `false` when the item had to be returned to its queue (pool
    /// saturated or store failure), so callers stop draining that queue.
    pub(super) fn execute_queue_item(&self, item: SyncQueueItem) -> bool {
        let Some(job_id) = item.job_id() else {
            warn!(item_id = %item.id, content_type = %item.content_type, "purging queue item with unknown content");
            self.purge_quietly(item.id);
            return true;
        };

        let node = self.node_id();
        let claimed = self.inner.store.transaction(|tx| -> StoreResult<Option<Job>> {
            let now = Utc::now();
            match tx.lock_job(job_id)? {
                Some(mut job) if job.is_in_progress() => {
                    job.executing_node_id = Some(node);
                    job.last_updated = now;
                    tx.update_job(&job)?;
                    Ok(Some(job))
                }
                _ => {
                    purge_item_in_tx(tx, item.id, now)?;
                    Ok(None)
                }
            }
        });

        match claimed {
            Ok(Some(mut job)) => {
                job.sync_source = Some(item.clone());
                match self.schedule(job) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(job_id = %job_id, item_id = %item.id, error = %e, "returning queue item");
                        self.return_quietly(item.id);
                        self.release_ownership(job_id);
                        false
                    }
                }
            }
            Ok(None) => {
                debug!(job_id = %job_id, item_id = %item.id, "purged queue item of missing or finished job");
                true
            }
            Err(e) => {
                error!(job_id = %job_id, item_id = %item.id, error = %e, "failed to take queued job");
                self.return_quietly(item.id);
                false
            }
        }
    }

    /// Drain one queue up to its capacity.
    pub(super) fn check_queue(&self, queue_id: QueueId) {
        loop {
            match self.inner.queues.dequeue_from_one(queue_id, self.node_id()) {
                Ok(Some(item)) => {
                    if !self.execute_queue_item(item) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(queue_id = %queue_id, error = %e, "failed to dequeue");
                    break;
                }
            }
        }
    }

    /// Retry direct dispatches that found their pool full.
    pub(super) fn drain_overflow(&self) {
        let node = self.node_id();
        loop {
            let Some(job_id) = self.inner.overflow.lock().ok().and_then(|mut q| q.pop_front()) else {
                return;
            };
            let job = match self.inner.store.transaction(|tx| tx.find_job(job_id)) {
                Ok(Some(job)) if job.is_in_progress() && job.executing_node_id == Some(node) => job,
                Ok(_) => continue,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to reload deferred job");
                    self.defer(job_id);
                    return;
                }
            };
            if self.schedule(job).is_err() {
                self.defer(job_id);
                return;
            }
        }
    }

    /// Queue an owned job for the next heartbeat's overflow drain.
    pub(super) fn retry_later(&self, job_id: JobId) {
        if let Ok(mut overflow) = self.inner.overflow.lock() {
            overflow.push_back(job_id);
        }
    }

    fn defer(&self, job_id: JobId) {
        if let Ok(mut overflow) = self.inner.overflow.lock() {
            overflow.push_front(job_id);
        }
    }

    pub(super) fn purge_quietly(&self, item_id: QueueItemId) {
        if let Err(e) = self.inner.queues.purge_item(item_id) {
            error!(item_id = %item_id, error = %e, "failed to purge queue item");
        }
    }

    pub(super) fn return_quietly(&self, item_id: QueueItemId) {
        if let Err(e) = self.inner.queues.return_item(item_id) {
            error!(item_id = %item_id, error = %e, "failed to return queue item");
        }
    }
}

/// Terminal transition plus every durable side effect, inside one transaction.
///
/// `Ok(None)` means the job was missing or already terminal; any leftover
/// queue item is purged in that case too.
pub(super) fn complete_in_tx(
    tx: &mut dyn StoreTx,
    node: NodeId,
    job_id: JobId,
    status: JobStatus,
    result_code: i32,
    result: Option<JsonValue>,
    now: DateTime<Utc>,
) -> StoreResult<Option<Completion>> {
    let job = tx.lock_job(job_id)?;
    let Some(mut job) = job else {
        purge_content_in_tx(tx, JOB_CONTENT_TYPE, job_id.get(), now)?;
        return Ok(None);
    };
    if !job.mark_completed(status, result_code, result, node, now) {
        purge_content_in_tx(tx, JOB_CONTENT_TYPE, job_id.get(), now)?;
        return Ok(None);
    }
    tx.update_job(&job)?;

    let woken = wake_waiters_in_tx(tx, job_id, now)?;
    tx.delete_joins_involving(job_id)?;
    purge_content_in_tx(tx, JOB_CONTENT_TYPE, job_id.get(), now)?;

    Ok(Some(Completion { job, woken }))
}

/// Signal every waiter on `join_job_id` that registered a wakeup dispatcher.
pub(super) fn wake_waiters_in_tx(
    tx: &mut dyn StoreTx,
    join_job_id: JobId,
    now: DateTime<Utc>,
) -> StoreResult<Vec<Woken>> {
    let mut woken = Vec::new();
    for entry in tx.joins_awaiting(join_job_id)? {
        woken.extend(signal_join_waiter_in_tx(tx, &entry, now)?);
    }
    Ok(woken)
}

/// Signal the waiter of one join, if it registered a wakeup dispatcher. The
/// queue item recorded at join time is used while it still backs the waiter.
pub(super) fn signal_join_waiter_in_tx(
    tx: &mut dyn StoreTx,
    entry: &JoinMapEntry,
    now: DateTime<Utc>,
) -> StoreResult<Option<Woken>> {
    if entry.wakeup_dispatcher.is_none() {
        return Ok(None);
    }
    signal_in_tx(
        tx,
        entry.job_id,
        entry.wakeup_dispatcher.clone(),
        entry.sync_source_id,
        now,
    )
}

/// Raise WAKEUP on a waiter. A claimed queue item backing a waiter that is not
/// running anywhere is released so the heartbeat redraws it.
pub(super) fn signal_waiter_in_tx(
    tx: &mut dyn StoreTx,
    waiter_id: JobId,
    dispatcher: Option<String>,
    now: DateTime<Utc>,
) -> StoreResult<Option<Woken>> {
    signal_in_tx(tx, waiter_id, dispatcher, None, now)
}

fn signal_in_tx(
    tx: &mut dyn StoreTx,
    waiter_id: JobId,
    dispatcher: Option<String>,
    sync_source: Option<QueueItemId>,
    now: DateTime<Utc>,
) -> StoreResult<Option<Woken>> {
    let Some(mut waiter) = tx.lock_job(waiter_id)? else {
        return Ok(None);
    };
    if !waiter.is_in_progress() {
        return Ok(None);
    }
    waiter.signal_wakeup(dispatcher, now);
    tx.update_job(&waiter)?;

    let recorded = match sync_source {
        Some(id) => tx.find_item(id)?.filter(|i| i.job_id() == Some(waiter_id)),
        None => None,
    };
    let item = match recorded {
        Some(item) => Some(item),
        None => tx.find_item_by_content(JOB_CONTENT_TYPE, waiter_id.get())?,
    };
    let queued = match item {
        Some(item) => {
            if item.is_claimed() && waiter.executing_node_id.is_none() {
                return_item_in_tx(tx, item.id, now)?;
            }
            true
        }
        None => false,
    };
    Ok(Some(Woken {
        job_id: waiter_id,
        queued,
    }))
}

impl<S, B> JobControl for JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    fn node_id(&self) -> NodeId {
        JobManager::node_id(self)
    }

    fn submit(&self, job: NewJob) -> Result<JobId, JobManagerError> {
        JobManager::submit(self, job)
    }

    fn submit_serialized(
        &self,
        job: NewJob,
        key: &ResourceKey,
        size_limit: u32,
    ) -> Result<JobId, JobManagerError> {
        JobManager::submit_serialized(self, job, key, size_limit)
    }

    fn query_job(&self, job_id: JobId, update_poll_time: bool) -> Result<Option<Job>, JobManagerError> {
        JobManager::query_job(self, job_id, update_poll_time)
    }

    fn complete(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result: Option<JsonValue>,
    ) -> Result<Vec<JobId>, JobManagerError> {
        JobManager::complete(self, job_id, status, result_code, result)
    }

    fn update_progress(
        &self,
        job_id: JobId,
        process_status: i32,
        result: Option<JsonValue>,
    ) -> Result<(), JobManagerError> {
        JobManager::update_progress(self, job_id, process_status, result)
    }

    fn join(&self, request: JoinRequest) -> Result<(), JobManagerError> {
        JobManager::join(self, request)
    }

    fn disjoin(&self, job_id: JobId, join_job_id: JobId) -> Result<(), JobManagerError> {
        JobManager::disjoin(self, job_id, join_job_id)
    }

    fn join_entries(&self, job_id: JobId) -> Result<Vec<JoinMapEntry>, JobManagerError> {
        JobManager::join_entries(self, job_id)
    }

    fn complete_join(
        &self,
        join_job_id: JobId,
        status: JobStatus,
        result: Option<JsonValue>,
    ) -> Result<(), JobManagerError> {
        JobManager::complete_join(self, join_job_id, status, result)
    }

    fn wait_and_check(
        &self,
        job_id: JobId,
        topics: &[&str],
        poll_interval: Duration,
        timeout: Option<Duration>,
        predicate: &mut dyn FnMut() -> bool,
    ) -> bool {
        JobManager::wait_and_check(self, job_id, topics, poll_interval, timeout, || predicate())
    }
}
