//! Partitioned metric stores
//!
//! The [`Store`] trait is the seam between the HTTP layer, the cluster
//! coordinator and the local storage backend. Stores compose: the
//! coordinator wraps a local stack such as a [`RateLimitedStore`] over a
//! [`MemoryStore`].

mod memory;
mod rate_limited;

pub use memory::MemoryStore;
pub use rate_limited::RateLimitedStore;

use crate::schema::MetricFamily;
use crate::Result;
use async_trait::async_trait;

/// A batch of metric families owned by a single partition
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionedMetrics {
    /// Logical owner of the batch (cluster or tenant identifier)
    pub partition_key: String,
    /// Metric families uploaded for the partition
    pub families: Vec<MetricFamily>,
}

impl PartitionedMetrics {
    pub fn new(partition_key: impl Into<String>, families: Vec<MetricFamily>) -> Self {
        Self {
            partition_key: partition_key.into(),
            families,
        }
    }
}

/// Store interface
///
/// Reads return every partition whose newest sample is at or after
/// `min_timestamp_ms`. Writes replace the partition's families.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read partitions with samples at or after `min_timestamp_ms`
    async fn read_metrics(&self, min_timestamp_ms: i64) -> Result<Vec<PartitionedMetrics>>;

    /// Write a partition batch
    async fn write_metrics(&self, metrics: PartitionedMetrics) -> Result<()>;
}
