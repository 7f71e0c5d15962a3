//! In-memory partition store with TTL eviction

use super::{PartitionedMetrics, Store};
use crate::schema::{metrics_count, newest_timestamp_ms, MetricFamily};
use crate::Result;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct PartitionSlice {
    /// Newest sample timestamp in milliseconds, `i64::MIN` when untimed
    newest: i64,
    families: Vec<MetricFamily>,
}

struct StoreInstruments {
    partitions: UpDownCounter<i64>,
    samples: Counter<u64>,
    cleanups: Counter<u64>,
}

impl StoreInstruments {
    fn new(meter: &Meter) -> Self {
        Self {
            partitions: meter
                .i64_up_down_counter("telefed.store.partitions")
                .with_description("Partitions currently held by the memory store")
                .init(),
            samples: meter
                .u64_counter("telefed.store.samples")
                .with_description("Samples written to the memory store")
                .init(),
            cleanups: meter
                .u64_counter("telefed.store.cleanups")
                .with_description("TTL cleanup passes run by the memory store")
                .init(),
        }
    }
}

/// Keeps the latest upload of every partition in memory
///
/// Each write replaces the partition's families. Partitions whose newest
/// sample falls behind the TTL are evicted by [`MemoryStore::run_cleaner`].
pub struct MemoryStore {
    ttl: Duration,
    partitions: RwLock<HashMap<String, PartitionSlice>>,
    instruments: StoreInstruments,
}

impl MemoryStore {
    pub fn new(ttl: Duration, meter: &Meter) -> Self {
        Self {
            ttl,
            partitions: RwLock::new(HashMap::new()),
            instruments: StoreInstruments::new(meter),
        }
    }

    /// Number of partitions currently stored
    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    /// Evict every partition whose newest sample is older than `now_ms - ttl`
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(self.ttl.as_millis() as i64);
        let mut partitions = self.partitions.write();
        let before = partitions.len();
        partitions.retain(|_, slice| slice.newest >= cutoff);
        let evicted = before - partitions.len();
        drop(partitions);

        self.instruments.cleanups.add(1, &[]);
        if evicted > 0 {
            self.instruments.partitions.add(-(evicted as i64), &[]);
            debug!(evicted, "Evicted expired partitions");
        }
        evicted
    }

    /// Run TTL cleanup every `interval` until `shutdown` is cancelled
    pub async fn run_cleaner(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        info!(ttl_secs = self.ttl.as_secs(), "Memory store cleaner started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Memory store cleaner stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.cleanup(Utc::now().timestamp_millis());
                }
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_metrics(&self, min_timestamp_ms: i64) -> Result<Vec<PartitionedMetrics>> {
        let partitions = self.partitions.read();
        Ok(partitions
            .iter()
            .filter(|(_, slice)| slice.newest >= min_timestamp_ms)
            .map(|(key, slice)| PartitionedMetrics::new(key.clone(), slice.families.clone()))
            .collect())
    }

    async fn write_metrics(&self, metrics: PartitionedMetrics) -> Result<()> {
        if metrics.families.is_empty() {
            return Ok(());
        }

        let newest = newest_timestamp_ms(&metrics.families).unwrap_or(i64::MIN);
        let samples = metrics_count(&metrics.families) as u64;

        let inserted = self
            .partitions
            .write()
            .insert(
                metrics.partition_key,
                PartitionSlice {
                    newest,
                    families: metrics.families,
                },
            )
            .is_none();

        if inserted {
            self.instruments.partitions.add(1, &[]);
        }
        self.instruments.samples.add(samples, &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Gauge, Metric};

    fn batch(key: &str, ts: i64) -> PartitionedMetrics {
        PartitionedMetrics::new(
            key,
            vec![MetricFamily {
                name: Some("up".to_string()),
                metric: vec![Metric {
                    gauge: Some(Gauge { value: Some(1.0) }),
                    timestamp_ms: Some(ts),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        )
    }

    fn store(ttl: Duration) -> MemoryStore {
        MemoryStore::new(ttl, &opentelemetry::global::meter("test"))
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = store(Duration::from_secs(600));
        store.write_metrics(batch("cluster-a", 1_000)).await.unwrap();
        store.write_metrics(batch("cluster-b", 5_000)).await.unwrap();

        let all = store.read_metrics(0).await.unwrap();
        assert_eq!(all.len(), 2);

        let recent = store.read_metrics(2_000).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].partition_key, "cluster-b");
    }

    #[tokio::test]
    async fn test_write_replaces_partition() {
        let store = store(Duration::from_secs(600));
        store.write_metrics(batch("cluster-a", 1_000)).await.unwrap();
        store.write_metrics(batch("cluster-a", 2_000)).await.unwrap();

        let all = store.read_metrics(0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(newest_timestamp_ms(&all[0].families), Some(2_000));
    }

    #[tokio::test]
    async fn test_empty_write_is_ignored() {
        let store = store(Duration::from_secs(600));
        store
            .write_metrics(PartitionedMetrics::new("cluster-a", Vec::new()))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_evicts_expired() {
        let store = store(Duration::from_millis(1_000));
        store.write_metrics(batch("old", 1_000)).await.unwrap();
        store.write_metrics(batch("fresh", 9_500)).await.unwrap();

        let evicted = store.cleanup(10_000);
        assert_eq!(evicted, 1);
        assert_eq!(store.len(), 1);

        let remaining = store.read_metrics(0).await.unwrap();
        assert_eq!(remaining[0].partition_key, "fresh");
    }
}
