//! Async job manager.
//!
//! ## Design
//!
//! - Jobs are persisted before they run and finish exactly once
//! - Conflicting work on one resource is serialized through a sync queue with
//!   a per-resource concurrency limit
//! - Jobs can join other jobs and are redispatched when those finish
//! - Heartbeat and GC loops are elected cluster-wide per tick
//! - A departed node's in-flight jobs are failed by the survivors
//!
//! ## Components
//!
//! - `JobManager`: submission, completion, joins, waits, dispatch
//! - `SyncQueueManager`: per-resource queues and claims
//! - `DispatcherRegistry`: named dispatchers and the pool each runs on
//! - `JobScheduler`: heartbeat and GC threads

pub mod config;
pub mod control;
mod dispatch;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod sync_queue;
pub mod types;

pub use config::JobManagerConfig;
pub use control::JobControl;
pub use error::{JobManagerError, PoolError, RegistryError};
pub use manager::JobManager;
pub use monitor::{ActiveJob, ActiveJobRegistry};
pub use pool::WorkerPool;
pub use recovery::{NODE_GONE_MESSAGE, RecoveryHook, RecoveryReport};
pub use registry::{
    DispatchContext, DispatchError, DispatchOutcome, DispatcherRegistry,
    DispatcherRegistryBuilder, JobDispatcher, PoolKind,
};
pub use scheduler::{
    BLOCKED_TOO_LONG_MESSAGE, GcReport, HeartbeatReport, JobScheduler, SchedulerHandle,
    SchedulerStats,
};
pub use sync_queue::SyncQueueManager;
pub use types::{
    JOB_CONTENT_TYPE, Job, JoinMapEntry, JoinRequest, MAX_QUEUE_SIZE_LIMIT, NewJob, ResourceKey,
    Signals, SyncQueue, SyncQueueItem, result_code,
};
