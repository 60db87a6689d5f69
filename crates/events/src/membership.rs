//! Cluster membership events delivered by whatever tracks node liveness.

use serde::{Deserialize, Serialize};

use asyncjob_core::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// Peers joined the cluster.
    NodeJoined { node_ids: Vec<NodeId> },
    /// Peers left the cluster (crashed or shut down).
    NodeLeft { node_ids: Vec<NodeId> },
    /// This node lost contact with the rest of the cluster.
    NodeIsolated,
}

/// Receives cluster membership events.
pub trait ClusterMembershipListener: Send + Sync {
    fn on_cluster_event(&self, event: &ClusterEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_tagged() {
        let ev: ClusterEvent =
            serde_json::from_str(r#"{"event":"node_left","node_ids":[5,6]}"#).unwrap();
        assert_eq!(
            ev,
            ClusterEvent::NodeLeft {
                node_ids: vec![NodeId::new(5), NodeId::new(6)]
            }
        );

        let isolated: ClusterEvent = serde_json::from_str(r#"{"event":"node_isolated"}"#).unwrap();
        assert_eq!(isolated, ClusterEvent::NodeIsolated);
    }
}
