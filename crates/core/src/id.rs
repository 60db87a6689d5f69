//! Strongly-typed identifiers used across the job subsystem.
//!
//! Durable rows (jobs, queues, queue items, join entries) are keyed by
//! store-assigned monotonic integers. Cluster members are identified by their
//! management-server id (`msid`).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Durable, monotonic identifier of a job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

/// Identifier of a sync queue (one per `(resource_type, resource_id)` pair).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(i64);

/// Identifier of an item inside a sync queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(i64);

/// Identifier of a join-map entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinId(i64);

/// Identifier of one cooperating manager process (cluster member).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

macro_rules! impl_row_id {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = i64::from_str(s.trim())
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                if value <= 0 {
                    return Err(CoreError::invalid_id(format!(
                        "{}: must be positive, got {value}",
                        $name
                    )));
                }
                Ok(Self(value))
            }
        }
    };
}

impl_row_id!(JobId, "JobId");
impl_row_id!(QueueId, "QueueId");
impl_row_id!(QueueItemId, "QueueItemId");
impl_row_id!(JoinId, "JoinId");

impl NodeId {
    pub const fn new(msid: u64) -> Self {
        Self(msid)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Postgres has no unsigned integers; msids are stored bit-for-bit in a `BIGINT`.
    pub const fn as_db(&self) -> i64 {
        self.0 as i64
    }

    pub const fn from_db(value: i64) -> Self {
        Self(value as u64)
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for NodeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str(s.trim())
            .map(Self)
            .map_err(|e| CoreError::invalid_id(format!("NodeId: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_ids_parse_and_display() {
        let id: JobId = "42".parse().unwrap();
        assert_eq!(id, JobId::new(42));
        assert_eq!(id.to_string(), "42");
        assert_eq!(i64::from(id), 42);
    }

    #[test]
    fn row_ids_reject_non_positive_and_garbage() {
        assert!(matches!("0".parse::<JobId>(), Err(CoreError::InvalidId(_))));
        assert!(matches!("-3".parse::<QueueId>(), Err(CoreError::InvalidId(_))));
        assert!(matches!("abc".parse::<JoinId>(), Err(CoreError::InvalidId(_))));
    }

    #[test]
    fn node_id_survives_db_round_trip_above_i64_max() {
        let node = NodeId::new(u64::MAX - 7);
        assert_eq!(NodeId::from_db(node.as_db()), node);
        assert_eq!(" 5 ".parse::<NodeId>().unwrap(), NodeId::new(5));
    }
}
