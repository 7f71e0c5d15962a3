//! Cluster partitioning for federated metrics
//!
//! Every node accepts uploads for any partition key. The consistent hash ring
//! names the node owning each key; the coordinator forwards batches to that
//! node over the gossip transport and keeps them locally whenever the owner is
//! itself, unknown, or recently unreachable.

pub mod coordinator;
pub mod gossip;
pub mod health;
pub mod membership;
pub mod protocol;
pub mod ring;
pub mod telemetry;

pub use coordinator::{ClusterCoordinator, DebugInfo, MemberInfo, UnhealthyNode};
pub use gossip::{Gossip, GossipConfig};
pub use health::{HealthState, HealthTracker};
pub use membership::{ClusterDelegate, Membership, Node};
pub use protocol::{ClusterMessage, MessageType, PROTOCOL_VERSION};
pub use ring::HashRing;
pub use telemetry::{ForwardMetrics, ForwardOutcome};

use std::time::Duration;

/// Capacity of the inbound message queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Period of the ring rebuild independent of membership events
pub const DEFAULT_RING_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's name, as known to the membership transport
    pub node_name: String,
    /// How long a failing node is kept out of forwarding
    pub health_expiration: Duration,
    /// Inbound messages buffered before new ones are dropped
    pub queue_capacity: usize,
    pub ring_refresh_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_name: "telefed".to_string(),
            health_expiration: health::DEFAULT_EXPIRATION,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ring_refresh_interval: DEFAULT_RING_REFRESH_INTERVAL,
        }
    }
}
