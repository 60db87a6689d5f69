//! Heartbeat and GC loops.
//!
//! Every node runs both loops; a cluster-wide lease from
//! [`JobDataStore::try_lock`] elects a single runner per tick. Each tick is
//! also exposed as `run_*_once` so it can be driven directly.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use asyncjob_core::{JobId, JobStatus, QueueId};
use asyncjob_events::{EventBus, JobNotification};

use crate::job_store::{JobDataStore, StoreResult};

use super::manager::{JobManager, Woken, signal_join_waiter_in_tx, wake_waiters_in_tx};
use super::sync_queue::{purge_content_in_tx, to_chrono};
use super::types::{JOB_CONTENT_TYPE, Signals, result_code};

pub const HEARTBEAT_LOCK: &str = "job-heartbeat";
pub const GC_LOCK: &str = "job-gc";

/// Result payload of jobs cancelled for holding their queue slot too long.
pub const BLOCKED_TOO_LONG_MESSAGE: &str =
    "Job is cancelled as it has been blocking others for too long";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    /// Another node held the heartbeat lease.
    pub skipped: bool,
    pub dequeued_items: usize,
    pub woken_jobs: Vec<JobId>,
    pub redispatched: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Another node held the GC lease.
    pub skipped: bool,
    pub cancelled_jobs: Vec<JobId>,
    pub expired_joins: usize,
    pub expunged_jobs: Vec<JobId>,
}

impl<S, B> JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    /// One heartbeat tick: drain ready queue items, then run the wakeup scan.
    pub fn run_heartbeat_once(&self) -> HeartbeatReport {
        // Local overflow is this node's own work; no election needed.
        self.drain_overflow();

        let lease = match self
            .inner
            .store
            .try_lock(HEARTBEAT_LOCK, self.inner.config.loop_lock_ttl)
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(node_id = %self.node_id(), "heartbeat lease held elsewhere, skipping tick");
                return HeartbeatReport {
                    skipped: true,
                    ..HeartbeatReport::default()
                };
            }
            Err(e) => {
                error!(node_id = %self.node_id(), error = %e, "failed to acquire heartbeat lease");
                return HeartbeatReport {
                    skipped: true,
                    ..HeartbeatReport::default()
                };
            }
        };

        let mut report = HeartbeatReport::default();
        match self
            .inner
            .queues
            .dequeue_from_any(self.node_id(), self.inner.config.dequeue_batch_size)
        {
            Ok(items) => {
                report.dequeued_items = items.len();
                for item in items {
                    self.execute_queue_item(item);
                }
            }
            Err(e) => error!(error = %e, "failed to dequeue ready items"),
        }

        let woken = self.wakeup_scan();
        report.woken_jobs = woken.iter().map(|w| w.job_id).collect();

        let mut candidates: BTreeSet<JobId> =
            woken.iter().filter(|w| !w.queued).map(|w| w.job_id).collect();
        match self.inner.store.transaction(|tx| {
            tx.signaled_unowned_jobs(Signals::WAKEUP, self.inner.config.dequeue_batch_size)
        }) {
            Ok(ids) => candidates.extend(ids),
            Err(e) => error!(error = %e, "failed to scan signalled jobs"),
        }
        let candidates: Vec<JobId> = candidates.into_iter().collect();
        report.redispatched = self.reschedule_woken(&candidates);
        drop(lease);

        debug!(
            node_id = %self.node_id(),
            dequeued = report.dequeued_items,
            woken = report.woken_jobs.len(),
            redispatched = report.redispatched,
            "heartbeat tick"
        );
        report
    }

    /// Signal the waiters of every join whose next wakeup time has passed.
    fn wakeup_scan(&self) -> Vec<Woken> {
        let scanned = self.inner.store.transaction(|tx| -> StoreResult<Vec<Woken>> {
            let now = Utc::now();
            let mut woken = Vec::new();
            for mut entry in tx.joins_due_for_wakeup(now)? {
                entry.schedule_next_wakeup(now);
                tx.update_join(&entry)?;
                woken.extend(signal_join_waiter_in_tx(tx, &entry, now)?);
            }
            Ok(woken)
        });
        scanned.unwrap_or_else(|e| {
            error!(error = %e, "wakeup scan failed");
            Vec::new()
        })
    }

    /// One GC tick: cancel blocking items, drop expired joins, expunge old jobs.
    pub fn run_gc_once(&self) -> GcReport {
        let lease = match self
            .inner
            .store
            .try_lock(GC_LOCK, self.inner.config.loop_lock_ttl)
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(node_id = %self.node_id(), "gc lease held elsewhere, skipping tick");
                return GcReport {
                    skipped: true,
                    ..GcReport::default()
                };
            }
            Err(e) => {
                error!(node_id = %self.node_id(), error = %e, "failed to acquire gc lease");
                return GcReport {
                    skipped: true,
                    ..GcReport::default()
                };
            }
        };

        let report = GcReport {
            skipped: false,
            cancelled_jobs: self.cancel_blocked_items(),
            expired_joins: self.cleanup_expired_joins(),
            expunged_jobs: self.expunge_expired_jobs(),
        };
        drop(lease);

        debug!(
            node_id = %self.node_id(),
            cancelled = report.cancelled_jobs.len(),
            expired_joins = report.expired_joins,
            expunged = report.expunged_jobs.len(),
            "gc tick"
        );
        report
    }

    fn cancel_blocked_items(&self) -> Vec<JobId> {
        let items = match self
            .inner
            .queues
            .blocked_items(self.inner.config.job_cancel_threshold)
        {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to list blocked queue items");
                return Vec::new();
            }
        };

        let mut cancelled = Vec::new();
        let mut queues = BTreeSet::new();
        for item in items {
            queues.insert(item.queue_id);
            if let Some(job_id) = item.job_id() {
                warn!(
                    job_id = %job_id,
                    item_id = %item.id,
                    queue_id = %item.queue_id,
                    claimed_by = ?item.last_process_msid,
                    "cancelling job blocking its queue"
                );
                match self.complete(
                    job_id,
                    JobStatus::Failed,
                    result_code::INTERNAL_ERROR,
                    Some(json!({ "error": BLOCKED_TOO_LONG_MESSAGE })),
                ) {
                    Ok(_) => cancelled.push(job_id),
                    Err(e) => error!(job_id = %job_id, error = %e, "failed to cancel blocked job"),
                }
            }
            // Completion already purged a job item; this covers other content.
            self.purge_quietly(item.id);
        }
        for queue_id in queues {
            self.check_queue(queue_id);
        }
        cancelled
    }

    /// Delete joins past their expiration and give each waiter one last wakeup.
    fn cleanup_expired_joins(&self) -> usize {
        let limit = self.inner.config.expunge_batch_size;
        let expired = self.inner.store.transaction(|tx| -> StoreResult<(usize, Vec<Woken>)> {
            let now = Utc::now();
            let entries = tx.expired_joins(now, limit)?;
            let mut woken = Vec::new();
            for entry in &entries {
                tx.delete_join(entry.job_id, entry.join_job_id)?;
                warn!(
                    job_id = %entry.job_id,
                    join_job_id = %entry.join_job_id,
                    expiration = %entry.expiration,
                    "join timed out"
                );
                woken.extend(signal_join_waiter_in_tx(tx, entry, now)?);
            }
            Ok((entries.len(), woken))
        });
        match expired {
            Ok((count, woken)) => {
                self.after_wakeups(&woken);
                count
            }
            Err(e) => {
                error!(error = %e, "failed to clean up expired joins");
                0
            }
        }
    }

    fn expunge_expired_jobs(&self) -> Vec<JobId> {
        let cutoff = Utc::now() - to_chrono(self.inner.config.job_expire);
        let limit = self.inner.config.expunge_batch_size;
        let candidates = self.inner.store.transaction(|tx| -> StoreResult<Vec<JobId>> {
            let mut ids = tx.expired_unfinished_jobs(cutoff, limit)?;
            ids.extend(tx.expired_completed_jobs(cutoff, limit)?);
            Ok(ids)
        });
        let candidates = match candidates {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "failed to list expired jobs");
                return Vec::new();
            }
        };

        let mut expunged = Vec::new();
        let mut queues: BTreeSet<QueueId> = BTreeSet::new();
        for job_id in candidates {
            let result = self.inner.store.transaction(
                |tx| -> StoreResult<Option<(Option<QueueId>, Vec<Woken>)>> {
                    let now = Utc::now();
                    let Some(job) = tx.lock_job(job_id)? else {
                        return Ok(None);
                    };
                    let purged = purge_content_in_tx(tx, JOB_CONTENT_TYPE, job_id.get(), now)?;
                    let woken = if job.is_in_progress() {
                        wake_waiters_in_tx(tx, job_id, now)?
                    } else {
                        Vec::new()
                    };
                    tx.delete_joins_involving(job_id)?;
                    tx.expunge_job(job_id)?;
                    Ok(Some((purged.map(|i| i.queue_id), woken)))
                },
            );
            match result {
                Ok(Some((queue_id, woken))) => {
                    info!(job_id = %job_id, "expunged expired job");
                    queues.extend(queue_id);
                    self.after_wakeups(&woken);
                    expunged.push(job_id);
                }
                Ok(None) => {}
                Err(e) => error!(job_id = %job_id, error = %e, "failed to expunge job"),
            }
        }
        for queue_id in queues {
            self.check_queue(queue_id);
        }
        expunged
    }
}

/// Loop statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub heartbeat_ticks: u64,
    pub heartbeat_skipped: u64,
    pub gc_ticks: u64,
    pub gc_skipped: u64,
    pub jobs_cancelled: u64,
    pub jobs_expunged: u64,
    pub uptime_secs: u64,
}

/// Handle to the running heartbeat and GC threads.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
    started: Instant,
}

impl SchedulerHandle {
    /// Stop both loops and wait for the in-flight tick to finish.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
        info!("job scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

pub struct JobScheduler;

impl JobScheduler {
    /// Spawn the heartbeat and GC loops on their own threads.
    pub fn spawn<S, B>(manager: JobManager<S, B>) -> std::io::Result<SchedulerHandle>
    where
        S: JobDataStore + 'static,
        B: EventBus<JobNotification> + 'static,
    {
        let node = manager.node_id();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let heartbeat_interval = manager.config().heartbeat_interval;
        let gc_interval = manager.config().gc_interval;

        let (hb_tx, hb_rx) = mpsc::channel::<()>();
        let hb_manager = manager.clone();
        let hb_stats = stats.clone();
        let heartbeat = thread::Builder::new()
            .name(format!("job-heartbeat-{node}"))
            .spawn(move || {
                tick_loop(hb_rx, heartbeat_interval, || {
                    let report = hb_manager.run_heartbeat_once();
                    if let Ok(mut s) = hb_stats.lock() {
                        s.heartbeat_ticks += 1;
                        s.heartbeat_skipped += u64::from(report.skipped);
                    }
                })
            })?;

        let (gc_tx, gc_rx) = mpsc::channel::<()>();
        let gc_stats = stats.clone();
        let gc = match thread::Builder::new()
            .name(format!("job-gc-{node}"))
            .spawn(move || {
                tick_loop(gc_rx, gc_interval, || {
                    let report = manager.run_gc_once();
                    if let Ok(mut s) = gc_stats.lock() {
                        s.gc_ticks += 1;
                        s.gc_skipped += u64::from(report.skipped);
                        s.jobs_cancelled += report.cancelled_jobs.len() as u64;
                        s.jobs_expunged += report.expunged_jobs.len() as u64;
                    }
                })
            }) {
            Ok(join) => join,
            Err(e) => {
                let _ = hb_tx.send(());
                let _ = heartbeat.join();
                return Err(e);
            }
        };

        info!(
            node_id = %node,
            heartbeat_ms = heartbeat_interval.as_millis() as u64,
            gc_ms = gc_interval.as_millis() as u64,
            "job scheduler started"
        );
        Ok(SchedulerHandle {
            shutdown: vec![hb_tx, gc_tx],
            joins: vec![heartbeat, gc],
            stats,
            started: Instant::now(),
        })
    }
}

/// Run `tick` every `interval` until a shutdown message arrives or the handle
/// is dropped.
fn tick_loop(shutdown_rx: mpsc::Receiver<()>, interval: Duration, mut tick: impl FnMut()) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => tick(),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}
