//! `asyncjob-core`: identifier, status and error building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod status;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, JoinId, NodeId, QueueId, QueueItemId};
pub use status::JobStatus;
