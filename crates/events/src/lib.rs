//! Job-state notifications and cluster membership events.
//!
//! Pure mechanics: no storage, no async runtime. The job store remains the
//! single source of truth; everything here is advisory.

pub mod bus;
pub mod in_memory_bus;
pub mod membership;
pub mod notification;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use membership::{ClusterEvent, ClusterMembershipListener};
pub use notification::{JOB_STATE_TOPIC, JobNotification};
