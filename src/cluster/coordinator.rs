//! Cluster coordinator
//!
//! Routes each partition batch to the node owning its partition key. Batches
//! owned by a peer are forwarded over the membership transport; everything
//! else, including every batch whose forward fails, is written to the local
//! store. Messages forwarded by peers are queued by the transport callback and
//! applied to the local store by a single consumer task.

use super::health::{HealthState, HealthTracker};
use super::membership::{ClusterDelegate, Membership, Node};
use super::protocol::{decode_message, encode_metric_message, ClusterMessage, PROTOCOL_VERSION};
use super::ring::HashRing;
use super::telemetry::{ForwardMetrics, ForwardOutcome};
use super::ClusterConfig;
use crate::schema::metrics_count;
use crate::store::{PartitionedMetrics, Store};
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Member entry of the debug snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub name: String,
    pub address: String,
}

/// Node with a live health record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnhealthyNode {
    pub name: String,
    pub state: HealthState,
    pub failures: u32,
}

/// Read-only snapshot for operational inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugInfo {
    pub local_name: String,
    pub protocol_version: u8,
    pub members: Vec<MemberInfo>,
    pub unhealthy: Vec<UnhealthyNode>,
}

/// Partitioned store spanning the cluster
pub struct ClusterCoordinator {
    name: String,
    store: Arc<dyn Store>,
    membership: OnceLock<Arc<dyn Membership>>,
    /// Current ring, replaced wholesale on refresh
    ring: RwLock<Arc<HashRing>>,
    health: HealthTracker,
    queue_tx: mpsc::Sender<Vec<u8>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    queue_capacity: usize,
    ring_changed: Notify,
    refresh_interval: Duration,
    metrics: ForwardMetrics,
}

impl ClusterCoordinator {
    /// Create a coordinator writing locally through `store`
    pub fn new(config: ClusterConfig, store: Arc<dyn Store>, metrics: ForwardMetrics) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        Self {
            name: config.node_name,
            store,
            membership: OnceLock::new(),
            ring: RwLock::new(Arc::new(HashRing::default())),
            health: HealthTracker::new(config.health_expiration),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            queue_capacity: config.queue_capacity,
            ring_changed: Notify::new(),
            refresh_interval: config.ring_refresh_interval,
            metrics,
        }
    }

    /// Local node name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn metrics(&self) -> &ForwardMetrics {
        &self.metrics
    }

    /// Current ring snapshot
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    /// Inbound messages waiting for the consumer
    pub fn inbound_pending(&self) -> usize {
        self.queue_capacity - self.queue_tx.capacity()
    }

    /// Attach the membership transport and spawn the ring refresh and
    /// inbound consumer loops. Both stop when `shutdown` is cancelled.
    pub fn start(
        self: &Arc<Self>,
        membership: Arc<dyn Membership>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>> {
        if self.membership.set(membership).is_err() {
            return Err(Error::Cluster("coordinator already started".to_string()));
        }
        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("inbound queue already consumed".to_string()))?;

        self.refresh_ring();
        info!(node = %self.name, "Cluster coordinator started");

        let refresher = self.clone();
        let refresh_shutdown = shutdown.clone();
        let refresh = tokio::spawn(async move {
            refresher.run_ring_refresh(refresh_shutdown).await;
        });

        let consumer = self.clone();
        let inbound = tokio::spawn(async move {
            consumer.run_inbound(queue_rx, shutdown).await;
        });

        Ok(vec![refresh, inbound])
    }

    /// Join the cluster through `seeds`
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let membership = self
            .membership
            .get()
            .ok_or_else(|| Error::Cluster("coordinator not started".to_string()))?;
        let joined = membership.join(seeds).await?;
        self.ring_changed.notify_one();
        Ok(joined)
    }

    /// Rebuild the ring from the current member list
    pub fn refresh_ring(&self) {
        let Some(membership) = self.membership.get() else {
            return;
        };
        let names: Vec<String> = membership.members().into_iter().map(|n| n.name).collect();
        let ring = Arc::new(self.ring().rebuild(&names));
        *self.ring.write() = ring;
        debug!(node = %self.name, members = names.len(), "Rebuilt hash ring");
    }

    async fn run_ring_refresh(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Ring refresh loop stopped");
                    return;
                }
                _ = self.ring_changed.notified() => self.refresh_ring(),
                _ = ticker.tick() => self.refresh_ring(),
            }
        }
    }

    async fn run_inbound(&self, mut queue: mpsc::Receiver<Vec<u8>>, shutdown: CancellationToken) {
        loop {
            let data = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Inbound consumer stopped");
                    return;
                }
                data = queue.recv() => match data {
                    Some(data) => data,
                    None => return,
                },
            };

            if let Err(e) = self.handle_message(&data).await {
                warn!(error = %e, len = data.len(), "Unable to handle incoming message");
            }
        }
    }

    /// Decode a forwarded message and write it to the local store
    ///
    /// Forwarded batches were routed here by their sender, so no ownership
    /// check is made.
    pub async fn handle_message(&self, data: &[u8]) -> Result<()> {
        let message = decode_message(data).inspect_err(|_| {
            self.metrics.record_inbound_error("decode");
        })?;

        match message {
            ClusterMessage::MetricWrite(metrics) => {
                if metrics.families.is_empty() {
                    return Ok(());
                }
                debug!(
                    partition_key = %metrics.partition_key,
                    families = metrics.families.len(),
                    "Storing forwarded metrics"
                );
                self.store.write_metrics(metrics).await.inspect_err(|_| {
                    self.metrics.record_inbound_error("store");
                })
            }
        }
    }

    /// Resolve the peer owning `partition_key`, or why the write stays local
    fn find_remote(
        &self,
        partition_key: &str,
        now: Instant,
    ) -> std::result::Result<(Arc<dyn Membership>, Node), ForwardOutcome> {
        let Some(membership) = self.membership.get() else {
            return Err(ForwardOutcome::Singleton);
        };
        if membership.member_count() < 2 {
            debug!("Only a single node, storing locally");
            return Err(ForwardOutcome::Singleton);
        }

        let ring = self.ring();
        let Some(owner) = ring.lookup(partition_key) else {
            warn!(partition_key, "No node found in ring");
            return Err(ForwardOutcome::NoKey);
        };

        if !self.health.is_usable(owner, now) {
            info!(node = owner, "Node has failed recently, using local storage");
            return Err(ForwardOutcome::RecentlyFailed);
        }

        let Some(node) = membership.members().into_iter().find(|n| n.name == owner) else {
            warn!(node = owner, "No member found with ring owner name");
            return Err(ForwardOutcome::NoMember);
        };

        if node.name == self.name {
            return Err(ForwardOutcome::SelfOwned);
        }
        Ok((membership.clone(), node))
    }

    async fn forward(&self, metrics: &PartitionedMetrics) -> ForwardOutcome {
        // Runtime clock, so paused test time drives the breaker window
        let clock = tokio::time::Instant::now();
        let started = clock.into_std();
        let (membership, node) = match self.find_remote(&metrics.partition_key, started) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };

        let message = match encode_metric_message(metrics) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, partition_key = %metrics.partition_key, "Unable to encode metrics for forwarding");
                return ForwardOutcome::EncodeError;
            }
        };
        self.metrics
            .record_samples(metrics_count(&metrics.families) as u64);

        let outcome = match membership.send_reliable(&node, message).await {
            Ok(()) => {
                debug!(node = %node, partition_key = %metrics.partition_key, "Forwarded metrics");
                ForwardOutcome::Success
            }
            Err(e) => {
                warn!(error = %e, node = %node, "Failed to forward metrics");
                let state = self.health.record_failure(&node.name, started);
                debug!(node = %node.name, ?state, "Recorded forwarding failure");
                ForwardOutcome::SendError
            }
        };
        self.metrics
            .record_latency(outcome, clock.elapsed().as_secs_f64());
        outcome
    }

    /// Route a batch and report what happened to it
    pub async fn write_metrics_with_outcome(
        &self,
        metrics: PartitionedMetrics,
    ) -> Result<ForwardOutcome> {
        let outcome = self.forward(&metrics).await;
        self.metrics.record_outcome(outcome);

        if outcome.is_local() {
            if matches!(outcome, ForwardOutcome::EncodeError | ForwardOutcome::SendError) {
                warn!(
                    partition_key = %metrics.partition_key,
                    result = outcome.as_str(),
                    "Unable to write to remote metrics, falling back to local"
                );
            }
            self.store.write_metrics(metrics).await?;
        }
        Ok(outcome)
    }

    /// Snapshot of the local view of the cluster
    pub fn debug_info(&self) -> DebugInfo {
        let members = self
            .membership
            .get()
            .map(|m| {
                m.members()
                    .into_iter()
                    .map(|n| MemberInfo {
                        name: n.name,
                        address: n.addr.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let unhealthy = self
            .health
            .snapshot()
            .into_iter()
            .map(|(name, state, failures)| UnhealthyNode {
                name,
                state,
                failures,
            })
            .collect();

        DebugInfo {
            local_name: self.name.clone(),
            protocol_version: PROTOCOL_VERSION,
            members,
            unhealthy,
        }
    }
}

#[async_trait]
impl Store for ClusterCoordinator {
    async fn read_metrics(&self, min_timestamp_ms: i64) -> Result<Vec<PartitionedMetrics>> {
        self.store.read_metrics(min_timestamp_ms).await
    }

    async fn write_metrics(&self, metrics: PartitionedMetrics) -> Result<()> {
        self.write_metrics_with_outcome(metrics).await.map(|_| ())
    }
}

impl ClusterDelegate for ClusterCoordinator {
    fn notify_join(&self, node: &Node) {
        info!(node = %self.name, joined = %node, "Node joined");
        self.ring_changed.notify_one();
    }

    fn notify_leave(&self, node: &Node) {
        info!(node = %self.name, left = %node, "Node left");
        self.ring_changed.notify_one();
    }

    fn notify_update(&self, node: &Node) {
        info!(node = %self.name, updated = %node, "Node updated");
        self.ring_changed.notify_one();
    }

    fn notify_msg(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        match self.queue_tx.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.metrics.record_inbound_drop();
                warn!(
                    len = dropped.len(),
                    capacity = self.queue_capacity,
                    "Too many incoming messages queued, dropped data"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_inbound_drop();
                debug!("Inbound consumer stopped, dropped data");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Gauge, Metric, MetricFamily};
    use crate::store::MemoryStore;

    fn batch(key: &str) -> PartitionedMetrics {
        PartitionedMetrics::new(
            key,
            vec![MetricFamily {
                name: Some("up".to_string()),
                metric: vec![Metric {
                    gauge: Some(Gauge { value: Some(1.0) }),
                    timestamp_ms: Some(1_000),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        )
    }

    fn coordinator(name: &str) -> (Arc<ClusterCoordinator>, Arc<MemoryStore>) {
        let meter = opentelemetry::global::meter("test");
        let store = Arc::new(MemoryStore::new(Duration::from_secs(600), &meter));
        let config = ClusterConfig {
            node_name: name.to_string(),
            ..Default::default()
        };
        let coordinator = Arc::new(ClusterCoordinator::new(
            config,
            store.clone(),
            ForwardMetrics::new(&meter),
        ));
        (coordinator, store)
    }

    #[tokio::test]
    async fn test_write_before_start_is_local() {
        let (coordinator, store) = coordinator("node-a");
        let outcome = coordinator
            .write_metrics_with_outcome(batch("cluster-1"))
            .await
            .unwrap();
        assert_eq!(outcome, ForwardOutcome::Singleton);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_message_writes_locally() {
        let (coordinator, store) = coordinator("node-a");
        let message = encode_metric_message(&batch("cluster-9")).unwrap();

        coordinator.handle_message(&message).await.unwrap();

        let stored = store.read_metrics(0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].partition_key, "cluster-9");
    }

    #[tokio::test]
    async fn test_handle_message_skips_empty_batches() {
        let (coordinator, store) = coordinator("node-a");
        let message =
            encode_metric_message(&PartitionedMetrics::new("cluster-9", Vec::new())).unwrap();

        coordinator.handle_message(&message).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_handle_message_rejects_unknown_tag() {
        let (coordinator, store) = coordinator("node-a");
        let err = coordinator.handle_message(&[9, 1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_queue_overflow_drops_newest() {
        let (coordinator, _store) = coordinator("node-a");

        for i in 0..150u8 {
            coordinator.notify_msg(&[1, i]);
        }

        assert_eq!(coordinator.inbound_pending(), crate::cluster::DEFAULT_QUEUE_CAPACITY);
        assert_eq!(coordinator.metrics().inbound_dropped(), 50);
    }

    #[test]
    fn test_empty_notification_is_ignored() {
        let (coordinator, _store) = coordinator("node-a");
        coordinator.notify_msg(&[]);
        assert_eq!(coordinator.inbound_pending(), 0);
        assert_eq!(coordinator.metrics().inbound_dropped(), 0);
    }

    #[test]
    fn test_debug_info_lists_unhealthy_nodes() {
        let (coordinator, _store) = coordinator("node-a");
        let now = Instant::now();
        coordinator.health().record_failure("node-c", now);
        for _ in 0..4 {
            coordinator.health().record_failure("node-b", now);
        }

        let info = coordinator.debug_info();
        assert_eq!(
            info.unhealthy,
            vec![
                UnhealthyNode {
                    name: "node-b".to_string(),
                    state: HealthState::Excluded,
                    failures: 4,
                },
                UnhealthyNode {
                    name: "node-c".to_string(),
                    state: HealthState::Suspect,
                    failures: 1,
                },
            ]
        );
    }

    #[test]
    fn test_debug_info_before_start() {
        let (coordinator, _store) = coordinator("node-a");
        let info = coordinator.debug_info();
        assert_eq!(info.local_name, "node-a");
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert!(info.members.is_empty());
    }
}
