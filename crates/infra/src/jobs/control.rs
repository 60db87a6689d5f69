//! Object-safe view of the job manager handed to dispatchers and outer layers.

use std::time::Duration;

use serde_json::Value as JsonValue;

use asyncjob_core::{JobId, JobStatus, NodeId};

use super::error::JobManagerError;
use super::types::{Job, JoinMapEntry, JoinRequest, NewJob, ResourceKey};

pub trait JobControl: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Persist a job and dispatch it right away on this node.
    fn submit(&self, job: NewJob) -> Result<JobId, JobManagerError>;

    /// Persist a job behind the sync queue for `key`; the heartbeat dispatches it.
    fn submit_serialized(
        &self,
        job: NewJob,
        key: &ResourceKey,
        size_limit: u32,
    ) -> Result<JobId, JobManagerError>;

    fn query_job(&self, job_id: JobId, update_poll_time: bool) -> Result<Option<Job>, JobManagerError>;

    /// Returns the waiters woken by this completion.
    fn complete(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result: Option<JsonValue>,
    ) -> Result<Vec<JobId>, JobManagerError>;

    fn update_progress(
        &self,
        job_id: JobId,
        process_status: i32,
        result: Option<JsonValue>,
    ) -> Result<(), JobManagerError>;

    fn join(&self, request: JoinRequest) -> Result<(), JobManagerError>;

    fn disjoin(&self, job_id: JobId, join_job_id: JobId) -> Result<(), JobManagerError>;

    /// Join entries where `job_id` is the waiter.
    fn join_entries(&self, job_id: JobId) -> Result<Vec<JoinMapEntry>, JobManagerError>;

    /// Resolve every join waiting on `join_job_id` without completing that job.
    fn complete_join(
        &self,
        join_job_id: JobId,
        status: JobStatus,
        result: Option<JsonValue>,
    ) -> Result<(), JobManagerError>;

    /// Block until `job_id` is terminal or `predicate` holds. `timeout: None`
    /// waits forever. Returns `false` on timeout.
    fn wait_and_check(
        &self,
        job_id: JobId,
        topics: &[&str],
        poll_interval: Duration,
        timeout: Option<Duration>,
        predicate: &mut dyn FnMut() -> bool,
    ) -> bool;
}
