//! Infrastructure wiring: store, bus, registry, manager and scheduler.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use asyncjob_core::NodeId;
use asyncjob_events::{ClusterMembershipListener, EventBus, InMemoryEventBus, JobNotification};
use asyncjob_infra::job_store::{InMemoryJobDataStore, JobDataStore, PostgresJobDataStore, StoreError};
use asyncjob_infra::jobs::{
    ActiveJob, DispatcherRegistry, JobControl, JobManager, JobManagerError, JobScheduler,
    RecoveryReport, SchedulerHandle, SchedulerStats,
};

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Jobs(#[from] JobManagerError),
    #[error("event bus: {0}")]
    Bus(String),
    #[error("failed to spawn scheduler threads: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("wiring task failed: {0}")]
    Join(String),
}

/// What the HTTP layer needs from a job manager, whatever store and bus it
/// was built on.
pub trait JobService: JobControl + ClusterMembershipListener {
    fn active_jobs(&self) -> Vec<ActiveJob>;
    fn set_accepting(&self, accepting: bool);
    fn is_accepting(&self) -> bool;
    fn start(&self) -> Result<RecoveryReport, JobManagerError>;
    fn shutdown(&self);
}

impl<S, B> JobService for JobManager<S, B>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    fn active_jobs(&self) -> Vec<ActiveJob> {
        JobManager::active_jobs(self)
    }

    fn set_accepting(&self, accepting: bool) {
        JobManager::set_accepting(self, accepting)
    }

    fn is_accepting(&self) -> bool {
        JobManager::is_accepting(self)
    }

    fn start(&self) -> Result<RecoveryReport, JobManagerError> {
        JobManager::start(self)
    }

    fn shutdown(&self) {
        JobManager::shutdown(self)
    }
}

pub struct AppServices {
    pub jobs: Arc<dyn JobService>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl AppServices {
    pub fn node_id(&self) -> NodeId {
        self.jobs.node_id()
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.scheduler
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(SchedulerHandle::stats))
    }

    /// Stop the loops and the pools. Blocks until in-flight ticks finish.
    pub fn shutdown(&self) {
        self.jobs.set_accepting(false);
        let handle = self.scheduler.lock().ok().and_then(|mut s| s.take());
        if let Some(handle) = handle {
            handle.shutdown();
        }
        self.jobs.shutdown();
        info!(node_id = %self.node_id(), "job services stopped");
    }
}

/// Connect the store, build the manager, reclaim this node's leftovers and
/// start the scheduler loops.
pub async fn build_services(
    config: &ServerConfig,
    registry: DispatcherRegistry,
) -> Result<AppServices, ServiceError> {
    let config = config.clone();
    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresJobDataStore::connect(
                &url,
                config.db_max_connections,
                config.job.lock_wait_timeout,
            )
            .await?;
            store.ensure_schema().await?;
            info!(max_connections = config.db_max_connections, "using postgres job store");
            // The store blocks on the runtime; wire it from a blocking thread.
            tokio::task::spawn_blocking(move || with_bus(&config, Arc::new(store), registry))
                .await
                .map_err(|e| ServiceError::Join(e.to_string()))?
        }
        None => {
            warn!("using in-memory job store: single node, development only");
            with_bus(&config, InMemoryJobDataStore::arc(), registry)
        }
    }
}

fn with_bus<S>(
    config: &ServerConfig,
    store: Arc<S>,
    registry: DispatcherRegistry,
) -> Result<AppServices, ServiceError>
where
    S: JobDataStore + 'static,
{
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let bus = asyncjob_infra::event_bus::RedisPubSubBus::new(url)
            .map_err(|e| ServiceError::Bus(e.to_string()))?;
        info!(channel = %bus.channel(), "using redis notification bus");
        return wire(config, store, Arc::new(bus), registry);
    }
    #[cfg(not(feature = "redis"))]
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but built without the `redis` feature; using in-memory bus");
    }

    wire(
        config,
        store,
        Arc::new(InMemoryEventBus::<JobNotification>::new()),
        registry,
    )
}

fn wire<S, B>(
    config: &ServerConfig,
    store: Arc<S>,
    bus: B,
    registry: DispatcherRegistry,
) -> Result<AppServices, ServiceError>
where
    S: JobDataStore + 'static,
    B: EventBus<JobNotification> + 'static,
{
    let manager = JobManager::new(config.job.clone(), store, bus, registry);
    let report = manager.start()?;
    if !report.failed_jobs.is_empty() {
        warn!(
            failed = report.failed_jobs.len(),
            "failed jobs left over by this node's previous run"
        );
    }
    let scheduler = JobScheduler::spawn(manager.clone())?;
    Ok(AppServices {
        jobs: Arc::new(manager),
        scheduler: Mutex::new(Some(scheduler)),
    })
}
