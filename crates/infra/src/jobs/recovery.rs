//! Crash recovery: reclaim work a dead node left behind.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use asyncjob_core::{JobId, JobStatus, NodeId, QueueId};
use asyncjob_events::{ClusterEvent, ClusterMembershipListener, EventBus, JobNotification};

use crate::job_store::{JobDataStore, StoreError, StoreResult, StoreTx};

use super::error::JobManagerError;
use super::manager::{Completion, JobManager, complete_in_tx};
use super::sync_queue::{purge_item_in_tx, return_item_in_tx};
use super::types::{Job, result_code};

/// Result payload of jobs failed because their node went away.
pub const NODE_GONE_MESSAGE: &str =
    "job cancelled because of management server restart or shutdown";

const RECOVERY_ATTEMPTS: u32 = 3;
const RECOVERY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Resource-specific cleanup for jobs reclaimed from a dead node, keyed by the
/// job's `instance_type`.
///
/// Called after the recovery transaction has committed. Implementations must
/// be idempotent: the same dead node can be reported more than once.
pub trait RecoveryHook: Send + Sync {
    fn on_job_reclaimed(&self, job: &Job);
}

impl<F> RecoveryHook for F
where
    F: Fn(&Job) + Send + Sync,
{
    fn on_job_reclaimed(&self, job: &Job) {
        self(job)
    }
}

/// What one recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub dead_node: Option<NodeId>,
    pub purged_items: usize,
    pub returned_items: usize,
    pub failed_jobs: Vec<JobId>,
    pub woken_jobs: Vec<JobId>,
}

struct Reclaimed {
    purged_items: usize,
    returned_items: usize,
    queues: BTreeSet<QueueId>,
    completions: Vec<Completion>,
}

impl<S, B> JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    pub fn register_recovery_hook(&self, instance_type: impl Into<String>, hook: Arc<dyn RecoveryHook>) {
        let instance_type = instance_type.into();
        match self.inner.hooks.write() {
            Ok(mut hooks) => {
                if hooks.insert(instance_type.clone(), hook).is_some() {
                    warn!(instance_type = %instance_type, "replaced recovery hook");
                }
            }
            Err(_) => error!(instance_type = %instance_type, "recovery hook table poisoned"),
        }
    }

    /// Reclaim jobs left IN_PROGRESS by this node's previous incarnation.
    pub fn start(&self) -> Result<RecoveryReport, JobManagerError> {
        info!(node_id = %self.node_id(), "starting job manager, reclaiming previous run");
        self.cleanup_left_over_jobs(self.node_id())
    }

    /// Fail every job `dead` was executing and free the queue slots it held.
    ///
    /// Items `dead` claimed for jobs it never started go back to their queue.
    /// The transaction is retried a few times if the store aborts it.
    pub fn cleanup_left_over_jobs(&self, dead: NodeId) -> Result<RecoveryReport, JobManagerError> {
        let node = self.node_id();
        let mut attempt = 1;
        let reclaimed = loop {
            match self
                .inner
                .store
                .transaction(|tx| reclaim_in_tx(tx, node, dead, Utc::now()))
            {
                Ok(reclaimed) => break reclaimed,
                Err(StoreError::Storage(e)) if attempt < RECOVERY_ATTEMPTS => {
                    warn!(dead_node = %dead, attempt, error = %e, "recovery transaction aborted, retrying");
                    thread::sleep(RECOVERY_RETRY_DELAY * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut report = RecoveryReport {
            dead_node: Some(dead),
            purged_items: reclaimed.purged_items,
            returned_items: reclaimed.returned_items,
            ..RecoveryReport::default()
        };
        for completion in &reclaimed.completions {
            let job = &completion.job;
            warn!(
                job_id = %job.id,
                dead_node = %dead,
                dispatcher = %job.dispatcher,
                "failed job left over by departed node"
            );
            self.publish(job.id, job.status);
            self.run_recovery_hook(job);
            report.failed_jobs.push(job.id);
            report
                .woken_jobs
                .extend(self.after_wakeups(&completion.woken));
        }
        for queue_id in reclaimed.queues {
            self.check_queue(queue_id);
        }

        info!(
            dead_node = %dead,
            purged_items = report.purged_items,
            returned_items = report.returned_items,
            failed_jobs = report.failed_jobs.len(),
            "recovered jobs of departed node"
        );
        Ok(report)
    }

    fn run_recovery_hook(&self, job: &Job) {
        let Some(instance_type) = job.instance_type.as_deref() else {
            return;
        };
        let hook = match self.inner.hooks.read() {
            Ok(hooks) => hooks.get(instance_type).cloned(),
            Err(_) => {
                error!(instance_type = %instance_type, "recovery hook table poisoned");
                None
            }
        };
        if let Some(hook) = hook {
            debug!(job_id = %job.id, instance_type = %instance_type, "running recovery hook");
            hook.on_job_reclaimed(job);
        }
    }
}

/// Reclaim `dead`'s work. Job rows are locked before queue rows, the same
/// order completion and claiming use.
fn reclaim_in_tx(
    tx: &mut dyn StoreTx,
    node: NodeId,
    dead: NodeId,
    now: DateTime<Utc>,
) -> StoreResult<Reclaimed> {
    let claimed = tx.items_claimed_by(dead)?;
    let queues: BTreeSet<QueueId> = claimed.iter().map(|i| i.queue_id).collect();

    let mut completions = Vec::new();
    for job in tx.jobs_executing_on(dead)? {
        let completion = complete_in_tx(
            tx,
            node,
            job.id,
            JobStatus::Failed,
            result_code::INTERNAL_ERROR,
            Some(json!({ "error": NODE_GONE_MESSAGE })),
            now,
        )?;
        completions.extend(completion);
    }

    // Whatever is still claimed belongs to jobs `dead` never took ownership of.
    let mut purged_items = claimed.len();
    let mut returned_items = 0;
    for item in tx.items_claimed_by(dead)? {
        purged_items = purged_items.saturating_sub(1);
        let unstarted = match item.job_id() {
            Some(job_id) => tx
                .lock_job(job_id)?
                .is_some_and(|j| j.is_in_progress() && j.executing_node_id.is_none()),
            None => false,
        };
        if unstarted {
            if return_item_in_tx(tx, item.id, now)? {
                returned_items += 1;
            }
        } else if purge_item_in_tx(tx, item.id, now)?.is_some() {
            purged_items += 1;
        }
    }

    Ok(Reclaimed {
        purged_items,
        returned_items,
        queues,
        completions,
    })
}

impl<S, B> ClusterMembershipListener for JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    fn on_cluster_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::NodeLeft { node_ids } => {
                for &dead in node_ids {
                    if dead == self.node_id() {
                        warn!(node_id = %dead, "cluster reports this node as departed, ignoring");
                        continue;
                    }
                    if let Err(e) = self.cleanup_left_over_jobs(dead) {
                        error!(dead_node = %dead, error = %e, "crash recovery failed");
                    }
                }
            }
            ClusterEvent::NodeJoined { node_ids } => {
                debug!(node_ids = ?node_ids, "nodes joined");
            }
            ClusterEvent::NodeIsolated => {
                warn!(node_id = %self.node_id(), "this node is isolated from the cluster");
            }
        }
    }
}
