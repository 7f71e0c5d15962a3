//! Cluster forwarding instruments

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of a forwarding decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardOutcome {
    /// Delivered to the owning node
    Success,
    /// The local node owns the partition
    SelfOwned,
    /// Fewer than two live members
    Singleton,
    /// The ring has no owner for the key
    NoKey,
    /// The owner failed recently
    RecentlyFailed,
    /// The owner is not a live member
    NoMember,
    /// Encoding the message failed
    EncodeError,
    /// Sending to the owner failed
    SendError,
}

impl ForwardOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardOutcome::Success => "success",
            ForwardOutcome::SelfOwned => "self",
            ForwardOutcome::Singleton => "singleton",
            ForwardOutcome::NoKey => "no_key",
            ForwardOutcome::RecentlyFailed => "recently_failed",
            ForwardOutcome::NoMember => "no_member",
            ForwardOutcome::EncodeError => "encode_error",
            ForwardOutcome::SendError => "send_error",
        }
    }

    /// Whether the write stays on the local node
    pub fn is_local(&self) -> bool {
        !matches!(self, ForwardOutcome::Success)
    }
}

/// Instruments recording forwarding behavior
///
/// Built from an injected meter. Inbound drops are also kept in a plain
/// counter so callers can observe them without an exporter.
pub struct ForwardMetrics {
    outcomes: Counter<u64>,
    samples: Counter<u64>,
    latency_seconds: Histogram<f64>,
    inbound_dropped: Counter<u64>,
    inbound_errors: Counter<u64>,
    dropped_total: AtomicU64,
}

impl ForwardMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            outcomes: meter
                .u64_counter("telefed.cluster.forward")
                .with_description("Outcome of forwarding decisions inside the cluster")
                .init(),
            samples: meter
                .u64_counter("telefed.cluster.forward.samples")
                .with_description("Samples forwarded by this node")
                .init(),
            latency_seconds: meter
                .f64_histogram("telefed.cluster.forward.latency")
                .with_description("Latency of forwarding to the owning node")
                .with_unit("s")
                .init(),
            inbound_dropped: meter
                .u64_counter("telefed.cluster.inbound.dropped")
                .with_description("Inbound cluster messages dropped because the queue was full")
                .init(),
            inbound_errors: meter
                .u64_counter("telefed.cluster.inbound.errors")
                .with_description("Inbound cluster messages that failed to decode or store")
                .init(),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn record_outcome(&self, outcome: ForwardOutcome) {
        self.outcomes
            .add(1, &[KeyValue::new("result", outcome.as_str())]);
    }

    pub fn record_samples(&self, samples: u64) {
        self.samples.add(samples, &[]);
    }

    pub fn record_latency(&self, outcome: ForwardOutcome, seconds: f64) {
        self.latency_seconds
            .record(seconds, &[KeyValue::new("result", outcome.as_str())]);
    }

    pub fn record_inbound_drop(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
        self.inbound_dropped.add(1, &[]);
    }

    pub fn record_inbound_error(&self, stage: &'static str) {
        self.inbound_errors.add(1, &[KeyValue::new("stage", stage)]);
    }

    /// Inbound messages dropped since startup
    pub fn inbound_dropped(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}
