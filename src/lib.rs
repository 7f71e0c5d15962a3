//! # telefed
//!
//! A federation endpoint for time-series metrics uploaded by remote agents.
//!
//! Agents upload batches of metric families tagged with a partition key. Every
//! server in a cluster accepts any upload; a consistent hash ring over the
//! gossip membership decides which node owns each partition, and batches are
//! forwarded to their owner so each partition lives on exactly one node while
//! membership is stable.
//!
//! ## Architecture
//!
//! - **Store**: in-memory partition store with TTL eviction and optional
//!   per-partition write rate limiting
//! - **Cluster**: hash ring, gossip transport, forwarding coordinator and a
//!   circuit breaker for unreachable owners
//! - **API**: HTTP upload, federation and cluster debug endpoints

pub mod api;
pub mod cluster;
pub mod config;
pub mod schema;
pub mod store;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{ClusterConfig, ClusterCoordinator, Gossip, GossipConfig, Membership};
    pub use crate::config::{ComponentFactory, ServerConfig};
    pub use crate::schema::{Metric, MetricFamily, MetricType};
    pub use crate::store::{MemoryStore, PartitionedMetrics, RateLimitedStore, Store};
    pub use crate::{Error, Result};
}
