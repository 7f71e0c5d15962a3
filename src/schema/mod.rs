//! Metric model exchanged between agents, stores and cluster peers
//!
//! Agents upload Prometheus client-model metric families. This module holds
//! the protobuf message definitions and the payload codec shared by the HTTP
//! upload path and cluster forwarding.

mod codec;
mod metrics;

pub use codec::{decode_families, encode_families};
pub use metrics::{
    drop_empty_families, metrics_count, newest_timestamp_ms, Bucket, Counter, Gauge, Histogram,
    LabelPair, Metric, MetricFamily, MetricType, Quantile, Summary, Untyped,
};
