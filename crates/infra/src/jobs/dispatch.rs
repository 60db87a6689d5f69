//! Per-job dispatch loop.
//!
//! Runs on a pool thread. Whatever the dispatcher does (returns, errors,
//! panics) the run ends with the job either completed or parked, and the queue
//! item that granted the run is purged by [`RunGuard`]. If the job cannot even
//! be loaded, the item goes back to its queue instead.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use asyncjob_core::JobId;
use asyncjob_events::{EventBus, JobNotification};

use crate::job_store::{JobDataStore, StoreResult};

use super::manager::JobManager;
use super::monitor::RunToken;
use super::registry::{DispatchContext, DispatchOutcome, PoolKind};
use super::sync_queue::purge_content_in_tx;
use super::types::{JOB_CONTENT_TYPE, Job, Signals, SyncQueueItem, result_code};

/// How a run ended, as far as the caller has to act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Finished,
    /// Parked, but a wakeup arrived while it was still running.
    WakeAgain,
    /// The job row could not be read; the dispatcher never ran.
    LoadFailed,
}

/// Releases the run's queue slot, drains the queue behind it and unregisters
/// the run, even if the dispatch path unwinds.
struct RunGuard<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    manager: JobManager<S, B>,
    job_id: JobId,
    sync_source: Option<SyncQueueItem>,
    token: RunToken,
}

impl<S, B> Drop for RunGuard<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    fn drop(&mut self) {
        if let Some(item) = self.sync_source.take() {
            self.manager.purge_quietly(item.id);
            self.manager.check_queue(item.queue_id);
        }
        self.manager.inner.active.unregister(self.job_id, self.token);
    }
}

impl<S, B> JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    pub(super) fn run_job(&self, mut job: Job, pool: PoolKind) {
        let job_id = job.id;
        let token = self.inner.active.register(job_id, &job.dispatcher, pool);
        let mut guard = RunGuard {
            manager: self.clone(),
            job_id,
            sync_source: job.sync_source.take(),
            token,
        };

        let end = self.dispatch(job_id, guard.sync_source.as_ref());
        if end == RunEnd::LoadFailed {
            // Nothing ran: hand the work back instead of dropping it.
            match guard.sync_source.take() {
                Some(item) => {
                    self.release_ownership(job_id);
                    self.return_quietly(item.id);
                }
                None => self.retry_later(job_id),
            }
        }
        drop(guard);

        if end == RunEnd::WakeAgain {
            self.reschedule_woken(&[job_id]);
        }
    }

    fn dispatch(&self, job_id: JobId, sync_source: Option<&SyncQueueItem>) -> RunEnd {
        let taken = self.inner.store.transaction(|tx| -> StoreResult<_> {
            let Some(mut job) = tx.lock_job(job_id)? else {
                return Ok(None);
            };
            if !job.is_in_progress() {
                return Ok(None);
            }
            let (signals, wakeup_dispatcher) = job.take_signals();
            if !signals.is_empty() {
                tx.update_job(&job)?;
            }
            let fallback = if signals.contains(Signals::WAKEUP) && wakeup_dispatcher.is_none() {
                tx.joins_of_waiter(job_id)?
                    .into_iter()
                    .find_map(|e| e.wakeup_dispatcher)
            } else {
                None
            };
            Ok(Some((job, signals, wakeup_dispatcher.or(fallback))))
        });

        let (job, signals, wakeup_dispatcher) = match taken {
            Ok(Some(taken)) => taken,
            Ok(None) => {
                debug!(job_id = %job_id, "job finished before dispatch, nothing to run");
                return RunEnd::Finished;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to load job for dispatch");
                return RunEnd::LoadFailed;
            }
        };

        let wakeup = signals.contains(Signals::WAKEUP);
        let dispatcher_name = match (wakeup, wakeup_dispatcher) {
            (true, Some(name)) => name,
            _ => job.dispatcher.clone(),
        };
        let Some(dispatcher) = self.inner.registry.get(&dispatcher_name) else {
            error!(job_id = %job_id, dispatcher = %dispatcher_name, "dispatcher not registered");
            self.finish(
                job_id,
                DispatchOutcome::failed(
                    result_code::INTERNAL_ERROR,
                    Some(json!({ "error": format!("unknown dispatcher: {dispatcher_name}") })),
                ),
            );
            return RunEnd::Finished;
        };

        debug!(
            job_id = %job_id,
            dispatcher = %dispatcher_name,
            wakeup,
            related = ?job.related,
            queue_item = ?sync_source.map(|i| i.id),
            "dispatching job"
        );
        let ctx = DispatchContext::new(self, wakeup);
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| dispatcher.run(&job, &ctx))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(job_id = %job_id, dispatcher = %dispatcher_name, error = %e, "dispatcher failed");
                DispatchOutcome::failed(
                    result_code::INTERNAL_ERROR,
                    Some(json!({ "error": e.to_string() })),
                )
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(job_id = %job_id, dispatcher = %dispatcher_name, panic = %message, "dispatcher panicked");
                DispatchOutcome::failed(
                    result_code::INTERNAL_ERROR,
                    Some(json!({ "error": message })),
                )
            }
        };

        if self.finish(job_id, outcome) {
            RunEnd::WakeAgain
        } else {
            RunEnd::Finished
        }
    }

    /// Returns `true` when the job parked with a wakeup already pending.
    fn finish(&self, job_id: JobId, outcome: DispatchOutcome) -> bool {
        match outcome {
            DispatchOutcome::Completed {
                status,
                result_code,
                result,
            } => {
                if let Err(e) = self.complete(job_id, status, result_code, result) {
                    error!(job_id = %job_id, error = %e, "failed to complete job");
                }
                false
            }
            DispatchOutcome::Parked => self.park(job_id),
        }
    }

    /// Release a job that is waiting on a join. Returns whether a wakeup
    /// arrived while it was still running.
    fn park(&self, job_id: JobId) -> bool {
        let node = self.node_id();
        let parked = self.inner.store.transaction(|tx| -> StoreResult<bool> {
            let now = Utc::now();
            let Some(mut job) = tx.lock_job(job_id)? else {
                return Ok(false);
            };
            if !job.is_in_progress() || job.executing_node_id != Some(node) {
                return Ok(false);
            }
            job.executing_node_id = None;
            job.last_updated = now;
            tx.update_job(&job)?;
            purge_content_in_tx(tx, JOB_CONTENT_TYPE, job_id.get(), now)?;
            Ok(job.pending_signals.contains(Signals::WAKEUP))
        });
        match parked {
            Ok(wake_again) => {
                info!(job_id = %job_id, wake_again, "parked job");
                wake_again
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to park job");
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "dispatcher panicked".to_string()
    }
}
