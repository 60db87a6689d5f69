//! Infrastructure layer: job manager, job stores, notification transports.

pub mod event_bus;
pub mod job_store;
pub mod jobs;
