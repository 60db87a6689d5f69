//! Core job, sync-queue and join-map records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use asyncjob_core::{JobId, JobStatus, JoinId, NodeId, QueueId, QueueItemId};

/// Sync-queue content type used for job-backed queue items.
pub const JOB_CONTENT_TYPE: &str = "AsyncJob";

/// Largest concurrency a sync queue can be given; the column is a 32-bit int.
pub const MAX_QUEUE_SIZE_LIMIT: u32 = i32::MAX as u32;

/// Well-known result codes written by the manager itself.
///
/// Dispatchers are free to use any other code.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const INTERNAL_ERROR: i32 = 530;
}

/// Pending-signal bitmask carried on a job record.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signals(u32);

impl Signals {
    pub const NONE: Signals = Signals(0);
    /// The job was woken by a join and should run its wakeup dispatcher.
    pub const WAKEUP: Signals = Signals(0x1);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Signals) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Signals) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Signals) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Logical resource a sync queue serializes work on (e.g. `("VirtualMachine", 42)`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub resource_id: i64,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, resource_id: i64) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id,
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.resource_type, self.resource_id)
    }
}

/// Caller-supplied description of a job to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Registered dispatcher that executes the job.
    pub dispatcher: String,
    /// Handler-defined command name.
    pub cmd: String,
    /// Opaque handler input.
    pub cmd_payload: JsonValue,
    pub instance_type: Option<String>,
    pub instance_id: Option<i64>,
    /// Logical parent job, for log correlation.
    pub related: Option<JobId>,
}

impl NewJob {
    pub fn new(dispatcher: impl Into<String>, cmd: impl Into<String>, cmd_payload: JsonValue) -> Self {
        Self {
            dispatcher: dispatcher.into(),
            cmd: cmd.into(),
            cmd_payload,
            instance_type: None,
            instance_id: None,
            related: None,
        }
    }

    /// Attach the job to the resource it concerns (audit/attachment lookups).
    pub fn with_instance(mut self, instance_type: impl Into<String>, instance_id: i64) -> Self {
        self.instance_type = Some(instance_type.into());
        self.instance_id = Some(instance_id);
        self
    }

    pub fn related_to(mut self, parent: JobId) -> Self {
        self.related = Some(parent);
        self
    }
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// External-facing identifier.
    pub uuid: Uuid,
    pub dispatcher: String,
    pub cmd: String,
    pub cmd_payload: JsonValue,
    pub instance_type: Option<String>,
    pub instance_id: Option<i64>,
    pub related: Option<JobId>,

    pub init_node_id: NodeId,
    /// Node currently running the job; `None` while queued or parked.
    pub executing_node_id: Option<NodeId>,
    pub complete_node_id: Option<NodeId>,

    pub status: JobStatus,
    /// Handler-defined progress marker.
    pub process_status: i32,
    pub result_code: i32,
    pub result: Option<JsonValue>,

    pub pending_signals: Signals,
    /// Wakeup dispatcher captured when the WAKEUP signal was raised.
    pub wakeup_dispatcher: Option<String>,

    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_polled: Option<DateTime<Utc>>,
    /// Soft-delete marker, set at completion.
    pub removed: Option<DateTime<Utc>>,

    /// Queue item holding this job's execution slot for the current run.
    #[serde(skip)]
    pub sync_source: Option<SyncQueueItem>,
}

impl Job {
    /// Materialize a freshly inserted record.
    pub fn from_new(
        id: JobId,
        new: &NewJob,
        init_node_id: NodeId,
        executing_node_id: Option<NodeId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            uuid: Uuid::now_v7(),
            dispatcher: new.dispatcher.clone(),
            cmd: new.cmd.clone(),
            cmd_payload: new.cmd_payload.clone(),
            instance_type: new.instance_type.clone(),
            instance_id: new.instance_id,
            related: new.related,
            init_node_id,
            executing_node_id,
            complete_node_id: None,
            status: JobStatus::InProgress,
            process_status: 0,
            result_code: result_code::SUCCESS,
            result: None,
            pending_signals: Signals::NONE,
            wakeup_dispatcher: None,
            created: now,
            last_updated: now,
            last_polled: None,
            removed: None,
            sync_source: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Apply a terminal transition. Returns `false` (and leaves the record
    /// untouched) when the job is already terminal.
    pub fn mark_completed(
        &mut self,
        status: JobStatus,
        result_code: i32,
        result: Option<JsonValue>,
        completed_by: NodeId,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.result_code = result_code;
        self.result = result;
        self.complete_node_id = Some(completed_by);
        self.executing_node_id = None;
        self.pending_signals = Signals::NONE;
        self.wakeup_dispatcher = None;
        self.last_updated = now;
        self.removed = Some(now);
        true
    }

    /// Raise WAKEUP, remembering which dispatcher should handle it.
    pub fn signal_wakeup(&mut self, dispatcher: Option<String>, now: DateTime<Utc>) {
        self.pending_signals.insert(Signals::WAKEUP);
        if dispatcher.is_some() {
            self.wakeup_dispatcher = dispatcher;
        }
        self.last_updated = now;
    }

    /// Consume pending signals together with the captured wakeup dispatcher.
    pub fn take_signals(&mut self) -> (Signals, Option<String>) {
        let signals = std::mem::take(&mut self.pending_signals);
        (signals, self.wakeup_dispatcher.take())
    }
}

/// A per-resource, capacity-bounded FIFO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueue {
    pub id: QueueId,
    pub key: ResourceKey,
    /// Max concurrently claimed items.
    pub size_limit: u32,
    /// Claimed-item bookkeeping: incremented on claim, decremented on purge/return
    /// of a claimed item.
    pub queue_size: u32,
    /// Monotonic claim sequence number (also the total number of claims ever made).
    pub last_process_number: i64,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// One enqueued unit of work inside a sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: QueueItemId,
    pub queue_id: QueueId,
    pub content_type: String,
    pub content_id: i64,
    pub created: DateTime<Utc>,
    /// Node holding the claim; `None` = unclaimed.
    pub last_process_msid: Option<NodeId>,
    pub last_process_number: Option<i64>,
    pub last_process_time: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    pub fn is_claimed(&self) -> bool {
        self.last_process_msid.is_some()
    }

    /// Job this item stands for, if it is job-backed.
    pub fn job_id(&self) -> Option<JobId> {
        (self.content_type == JOB_CONTENT_TYPE).then(|| JobId::new(self.content_id))
    }

    pub fn claim(&mut self, node: NodeId, process_number: i64, now: DateTime<Utc>) {
        self.last_process_msid = Some(node);
        self.last_process_number = Some(process_number);
        self.last_process_time = Some(now);
    }

    pub fn release_claim(&mut self) {
        self.last_process_msid = None;
        self.last_process_number = None;
        self.last_process_time = None;
    }
}

/// "Job `job_id` is waiting for job `join_job_id`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinMapEntry {
    pub id: JoinId,
    pub job_id: JobId,
    pub join_job_id: JobId,
    pub join_status: JobStatus,
    pub join_result: Option<JsonValue>,
    pub join_node_id: NodeId,
    pub complete_node_id: Option<NodeId>,
    pub wakeup_handler: Option<String>,
    pub wakeup_dispatcher: Option<String>,
    pub wakeup_interval_ms: u64,
    pub next_wakeup_time: Option<DateTime<Utc>>,
    pub expiration: DateTime<Utc>,
    pub sync_source_id: Option<QueueItemId>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl JoinMapEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Unresolved, unexpired and past its next wakeup time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.join_status == JobStatus::InProgress
            && !self.is_expired(now)
            && self.next_wakeup_time.is_some_and(|t| t <= now)
    }

    /// Push the next wakeup out by one interval, never past `expiration`.
    pub fn schedule_next_wakeup(&mut self, now: DateTime<Utc>) {
        let next = now + chrono::Duration::milliseconds(self.wakeup_interval_ms as i64);
        self.next_wakeup_time = Some(next.min(self.expiration));
        self.last_updated = now;
    }
}

/// Store-level insert shape for a join entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJoin {
    pub job_id: JobId,
    pub join_job_id: JobId,
    pub join_node_id: NodeId,
    pub wakeup_handler: Option<String>,
    pub wakeup_dispatcher: Option<String>,
    pub wakeup_interval_ms: u64,
    pub next_wakeup_time: Option<DateTime<Utc>>,
    pub expiration: DateTime<Utc>,
    pub sync_source_id: Option<QueueItemId>,
}

/// Caller request to make one job wait for another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub job_id: JobId,
    pub join_job_id: JobId,
    pub wakeup_handler: Option<String>,
    pub wakeup_dispatcher: Option<String>,
    pub wakeup_interval: Duration,
    pub timeout: Duration,
}

impl JoinRequest {
    /// Join without redispatch; the waiter is expected to block in `wait_and_check`.
    pub fn new(job_id: JobId, join_job_id: JobId, timeout: Duration) -> Self {
        Self {
            job_id,
            join_job_id,
            wakeup_handler: None,
            wakeup_dispatcher: None,
            wakeup_interval: Duration::ZERO,
            timeout,
        }
    }

    /// Redispatch the waiter through `dispatcher` when woken.
    pub fn with_wakeup(
        mut self,
        dispatcher: impl Into<String>,
        handler: Option<String>,
        interval: Duration,
    ) -> Self {
        self.wakeup_dispatcher = Some(dispatcher.into());
        self.wakeup_handler = handler;
        self.wakeup_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        let new = NewJob::new("vm", "start", serde_json::json!({"vm": 1})).with_instance("VirtualMachine", 1);
        Job::from_new(JobId::new(1), &new, NodeId::new(7), Some(NodeId::new(7)), Utc::now())
    }

    #[test]
    fn signals_bitmask() {
        let mut s = Signals::NONE;
        assert!(!s.contains(Signals::WAKEUP));
        s.insert(Signals::WAKEUP);
        assert!(s.contains(Signals::WAKEUP));
        assert_eq!(s.bits(), 1);
        s.remove(Signals::WAKEUP);
        assert!(s.is_empty());
        assert!(!Signals::from_bits(0xff).contains(Signals::NONE));
    }

    #[test]
    fn completion_is_one_way() {
        let mut j = job();
        let now = Utc::now();
        assert!(j.mark_completed(JobStatus::Succeeded, 0, None, NodeId::new(2), now));
        assert_eq!(j.complete_node_id, Some(NodeId::new(2)));
        assert_eq!(j.removed, Some(now));
        assert!(j.executing_node_id.is_none());

        assert!(!j.mark_completed(JobStatus::Failed, 530, None, NodeId::new(3), now));
        assert_eq!(j.status, JobStatus::Succeeded);
        assert_eq!(j.complete_node_id, Some(NodeId::new(2)));
    }

    #[test]
    fn wakeup_signal_is_consumed_with_its_dispatcher() {
        let mut j = job();
        j.signal_wakeup(Some("vm-wakeup".into()), Utc::now());
        let (signals, dispatcher) = j.take_signals();
        assert!(signals.contains(Signals::WAKEUP));
        assert_eq!(dispatcher.as_deref(), Some("vm-wakeup"));
        assert!(j.pending_signals.is_empty());
        assert!(j.wakeup_dispatcher.is_none());
    }

    #[test]
    fn next_wakeup_never_passes_expiration() {
        let now = Utc::now();
        let mut e = JoinMapEntry {
            id: JoinId::new(1),
            job_id: JobId::new(1),
            join_job_id: JobId::new(2),
            join_status: JobStatus::InProgress,
            join_result: None,
            join_node_id: NodeId::new(1),
            complete_node_id: None,
            wakeup_handler: None,
            wakeup_dispatcher: Some("w".into()),
            wakeup_interval_ms: 60_000,
            next_wakeup_time: Some(now),
            expiration: now + chrono::Duration::seconds(10),
            sync_source_id: None,
            created: now,
            last_updated: now,
        };
        assert!(e.is_due(now));
        e.schedule_next_wakeup(now);
        assert_eq!(e.next_wakeup_time, Some(e.expiration));
        assert!(!e.is_due(e.expiration));
    }

    #[test]
    fn queue_item_claim_cycle() {
        let mut item = SyncQueueItem {
            id: QueueItemId::new(1),
            queue_id: QueueId::new(1),
            content_type: JOB_CONTENT_TYPE.into(),
            content_id: 9,
            created: Utc::now(),
            last_process_msid: None,
            last_process_number: None,
            last_process_time: None,
        };
        assert_eq!(item.job_id(), Some(JobId::new(9)));
        item.claim(NodeId::new(1), 4, Utc::now());
        assert!(item.is_claimed());
        item.release_claim();
        assert!(!item.is_claimed());
        assert!(item.last_process_time.is_none());
    }
}
