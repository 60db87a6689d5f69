use serde::{Deserialize, Serialize};

use asyncjob_core::{JobId, JobStatus};

/// Topic published whenever a job reaches a terminal status.
pub const JOB_STATE_TOPIC: &str = "job.state";

/// "Job state changed" notification.
///
/// Carries just enough to let a waiter decide whether to re-read the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    topic: String,
    job_id: JobId,
    status: JobStatus,
}

impl JobNotification {
    pub fn new(topic: impl Into<String>, job_id: JobId, status: JobStatus) -> Self {
        Self {
            topic: topic.into(),
            job_id,
            status,
        }
    }

    /// Notification on [`JOB_STATE_TOPIC`].
    pub fn job_state(job_id: JobId, status: JobStatus) -> Self {
        Self::new(JOB_STATE_TOPIC, job_id, status)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Whether this notification is on one of `topics` (empty = any topic).
    pub fn matches_any(&self, topics: &[&str]) -> bool {
        topics.is_empty() || topics.iter().any(|t| *t == self.topic)
    }
}
