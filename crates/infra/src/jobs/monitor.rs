//! Node-local registry of jobs currently being dispatched.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use asyncjob_core::JobId;

use super::registry::PoolKind;

/// One job running on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub dispatcher: String,
    pub pool: PoolKind,
    pub thread: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    run: u64,
}

/// Identifies one registration; only the matching run can unregister it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RunToken(u64);

#[derive(Debug, Default)]
pub struct ActiveJobRegistry {
    jobs: Mutex<HashMap<JobId, ActiveJob>>,
    next_run: AtomicU64,
}

impl ActiveJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job as running on the current thread.
    ///
    /// A newer run of the same job replaces the older entry; the older run's
    /// `unregister` then leaves the newer one alone.
    pub fn register(&self, job_id: JobId, dispatcher: &str, pool: PoolKind) -> RunToken {
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(
                job_id,
                ActiveJob {
                    job_id,
                    dispatcher: dispatcher.to_string(),
                    pool,
                    thread: std::thread::current().name().map(str::to_string),
                    started_at: Utc::now(),
                    run,
                },
            );
        }
        RunToken(run)
    }

    pub fn unregister(&self, job_id: JobId, token: RunToken) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if jobs.get(&job_id).is_some_and(|j| j.run == token.0) {
                jobs.remove(&job_id);
            }
        }
    }

    /// Snapshot ordered by start time.
    pub fn snapshot(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self
            .jobs
            .lock()
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default();
        jobs.sort_by_key(|j| (j.started_at, j.job_id));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_run_cannot_unregister_newer_one() {
        let registry = ActiveJobRegistry::new();
        let first = registry.register(JobId::new(1), "vm", PoolKind::Worker);
        let second = registry.register(JobId::new(1), "vm-wakeup", PoolKind::Worker);

        registry.unregister(JobId::new(1), first);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].dispatcher, "vm-wakeup");

        registry.unregister(JobId::new(1), second);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_lists_running_jobs() {
        let registry = ActiveJobRegistry::new();
        registry.register(JobId::new(2), "a", PoolKind::Api);
        registry.register(JobId::new(3), "b", PoolKind::Worker);
        let ids: Vec<_> = registry.snapshot().into_iter().map(|j| j.job_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&JobId::new(2)) && ids.contains(&JobId::new(3)));
    }
}
