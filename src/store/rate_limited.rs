//! Per-partition write rate limiting
//!
//! Each partition key gets a token bucket holding a single token that refills
//! once per configured interval, so an agent can upload at most once per
//! interval. Reads are never limited.

use super::{PartitionedMetrics, Store};
use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token bucket for rate limiting
#[derive(Debug)]
struct TokenBucket {
    /// Maximum tokens (bucket capacity)
    capacity: f64,
    /// Current tokens available
    tokens: f64,
    /// Time to refill one token
    refill_interval: Duration,
    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_interval: Duration, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_interval,
            last_refill: now,
        }
    }

    /// Try to take one token, returns true if successful
    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill);
        let interval = self.refill_interval.as_secs_f64();
        let new_tokens = if interval > 0.0 {
            elapsed.as_secs_f64() / interval
        } else {
            self.capacity
        };
        self.tokens = (self.tokens + new_tokens).min(self.capacity);
        self.last_refill = now;
    }
}

/// Store wrapper rejecting writes that exceed one per `limit` per partition
pub struct RateLimitedStore {
    limit: Duration,
    next: Arc<dyn Store>,
    limiters: DashMap<String, Mutex<TokenBucket>>,
}

impl RateLimitedStore {
    pub fn new(limit: Duration, next: Arc<dyn Store>) -> Self {
        Self {
            limit,
            next,
            limiters: DashMap::new(),
        }
    }

    /// Write with an explicit clock reading
    pub async fn write_metrics_at(&self, metrics: PartitionedMetrics, now: Instant) -> Result<()> {
        if !self.allow(&metrics.partition_key, now) {
            return Err(Error::WriteLimitReached {
                partition_key: metrics.partition_key,
            });
        }
        self.next.write_metrics(metrics).await
    }

    fn allow(&self, partition_key: &str, now: Instant) -> bool {
        let limiter = self
            .limiters
            .entry(partition_key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(1, self.limit, now)));
        let allowed = limiter.lock().try_acquire(now);
        allowed
    }
}

#[async_trait]
impl Store for RateLimitedStore {
    async fn read_metrics(&self, min_timestamp_ms: i64) -> Result<Vec<PartitionedMetrics>> {
        self.next.read_metrics(min_timestamp_ms).await
    }

    async fn write_metrics(&self, metrics: PartitionedMetrics) -> Result<()> {
        self.write_metrics_at(metrics, Instant::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_token_bucket() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, Duration::from_secs(1), start);

        // Should have full capacity
        assert!(bucket.try_acquire(start));

        // Should be empty
        assert!(!bucket.try_acquire(start + Duration::from_millis(500)));

        // Refilled after the interval
        assert!(bucket.try_acquire(start + Duration::from_millis(1_500)));
    }

    #[tokio::test]
    async fn test_write_limit_per_partition() {
        let inner = Arc::new(MemoryStore::new(
            Duration::from_secs(600),
            &opentelemetry::global::meter("test"),
        ));
        let store = RateLimitedStore::new(Duration::from_secs(60), inner);
        let now = Instant::now();

        store
            .write_metrics_at(PartitionedMetrics::new("a", Vec::new()), now)
            .await
            .unwrap();

        let err = store
            .write_metrics_at(PartitionedMetrics::new("a", Vec::new()), now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WriteLimitReached { .. }));

        // Other partitions have their own budget
        store
            .write_metrics_at(PartitionedMetrics::new("b", Vec::new()), now)
            .await
            .unwrap();

        store
            .write_metrics_at(
                PartitionedMetrics::new("a", Vec::new()),
                now + Duration::from_secs(61),
            )
            .await
            .unwrap();
    }
}
