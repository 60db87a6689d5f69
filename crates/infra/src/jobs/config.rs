//! Job manager configuration.

use std::time::Duration;

use asyncjob_core::NodeId;

/// Job manager configuration.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// This node's cluster identity (`msid`).
    pub node_id: NodeId,
    /// Age after which jobs (finished or not) are expunged.
    pub job_expire: Duration,
    /// Age after which a claimed queue item is force-cancelled.
    pub job_cancel_threshold: Duration,
    /// Row-lock wait bound applied to every store transaction.
    pub lock_wait_timeout: Duration,
    /// Threads serving API-triggered jobs.
    pub api_pool_size: usize,
    /// Threads serving background jobs.
    pub worker_pool_size: usize,
    /// Hand-off slots per pool; a full pool rejects new work.
    pub pool_queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub gc_interval: Duration,
    /// Queue items claimed per heartbeat tick.
    pub dequeue_batch_size: usize,
    /// Jobs expunged per GC tick and category.
    pub expunge_batch_size: usize,
    /// How long a loop-election lease stays valid.
    pub loop_lock_ttl: Duration,
    /// Initial admin state.
    pub accepting_jobs: bool,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            job_expire: Duration::from_secs(1440 * 60),
            job_cancel_threshold: Duration::from_secs(60 * 60),
            lock_wait_timeout: Duration::from_secs(5),
            api_pool_size: 8,
            worker_pool_size: 16,
            pool_queue_capacity: 64,
            heartbeat_interval: Duration::from_secs(2),
            gc_interval: Duration::from_secs(10),
            dequeue_batch_size: 10,
            expunge_batch_size: 100,
            loop_lock_ttl: Duration::from_secs(30),
            accepting_jobs: true,
        }
    }
}

impl JobManagerConfig {
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_job_expire(mut self, expire: Duration) -> Self {
        self.job_expire = expire;
        self
    }

    pub fn with_job_cancel_threshold(mut self, threshold: Duration) -> Self {
        self.job_cancel_threshold = threshold;
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_pool_sizes(mut self, api: usize, worker: usize) -> Self {
        self.api_pool_size = api;
        self.worker_pool_size = worker;
        self
    }

    pub fn with_pool_queue_capacity(mut self, capacity: usize) -> Self {
        self.pool_queue_capacity = capacity;
        self
    }

    pub fn with_intervals(mut self, heartbeat: Duration, gc: Duration) -> Self {
        self.heartbeat_interval = heartbeat;
        self.gc_interval = gc;
        self
    }

    pub fn with_dequeue_batch_size(mut self, size: usize) -> Self {
        self.dequeue_batch_size = size;
        self
    }

    pub fn with_accepting_jobs(mut self, accepting: bool) -> Self {
        self.accepting_jobs = accepting;
        self
    }
}
