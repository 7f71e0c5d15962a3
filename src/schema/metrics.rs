//! Prometheus client-model messages
//!
//! Field tags match `io.prometheus.client` `metrics.proto` so payloads are
//! interchangeable with any Prometheus client producing the delimited
//! protobuf exposition format.

/// Metric types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    Counter = 0,
    Gauge = 1,
    Summary = 2,
    Untyped = 3,
    Histogram = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LabelPair {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Gauge {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Counter {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Quantile {
    #[prost(double, optional, tag = "1")]
    pub quantile: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Summary {
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub sample_sum: Option<f64>,
    #[prost(message, repeated, tag = "3")]
    pub quantile: Vec<Quantile>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Untyped {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Bucket {
    #[prost(uint64, optional, tag = "1")]
    pub cumulative_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub upper_bound: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Histogram {
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub sample_sum: Option<f64>,
    #[prost(message, repeated, tag = "3")]
    pub bucket: Vec<Bucket>,
}

/// A single sample: labels plus exactly one of the typed values
#[derive(Clone, PartialEq, prost::Message)]
pub struct Metric {
    #[prost(message, repeated, tag = "1")]
    pub label: Vec<LabelPair>,
    #[prost(message, optional, tag = "2")]
    pub gauge: Option<Gauge>,
    #[prost(message, optional, tag = "3")]
    pub counter: Option<Counter>,
    #[prost(message, optional, tag = "4")]
    pub summary: Option<Summary>,
    #[prost(message, optional, tag = "5")]
    pub untyped: Option<Untyped>,
    #[prost(int64, optional, tag = "6")]
    pub timestamp_ms: Option<i64>,
    #[prost(message, optional, tag = "7")]
    pub histogram: Option<Histogram>,
}

/// All samples sharing a metric name
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricFamily {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub help: Option<String>,
    #[prost(enumeration = "MetricType", optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(message, repeated, tag = "4")]
    pub metric: Vec<Metric>,
}

/// Total number of samples across all families
pub fn metrics_count(families: &[MetricFamily]) -> usize {
    families.iter().map(|family| family.metric.len()).sum()
}

/// Remove families without samples, keeping the order of the rest.
/// Returns how many were removed.
pub fn drop_empty_families(families: &mut Vec<MetricFamily>) -> usize {
    let before = families.len();
    families.retain(|family| !family.metric.is_empty());
    before - families.len()
}

/// Newest sample timestamp across all families, if any sample carries one
pub fn newest_timestamp_ms(families: &[MetricFamily]) -> Option<i64> {
    families
        .iter()
        .flat_map(|family| family.metric.iter())
        .filter_map(|metric| metric.timestamp_ms)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(name: &str, timestamps: &[i64]) -> MetricFamily {
        MetricFamily {
            name: Some(name.to_string()),
            help: None,
            r#type: Some(MetricType::Gauge as i32),
            metric: timestamps
                .iter()
                .map(|ts| Metric {
                    gauge: Some(Gauge { value: Some(1.0) }),
                    timestamp_ms: Some(*ts),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn test_metrics_count() {
        let families = vec![family("up", &[1, 2]), family("cpu", &[3])];
        assert_eq!(metrics_count(&families), 3);
        assert_eq!(metrics_count(&[]), 0);
    }

    #[test]
    fn test_drop_empty_families() {
        let mut families = vec![
            family("empty", &[]),
            family("up", &[1]),
            family("also_empty", &[]),
            family("cpu", &[2, 3]),
        ];
        assert_eq!(drop_empty_families(&mut families), 2);
        let names: Vec<_> = families.iter().filter_map(|f| f.name.as_deref()).collect();
        assert_eq!(names, vec!["up", "cpu"]);
        assert_eq!(drop_empty_families(&mut families), 0);
    }

    #[test]
    fn test_newest_timestamp() {
        let families = vec![family("up", &[10, 40]), family("cpu", &[25])];
        assert_eq!(newest_timestamp_ms(&families), Some(40));

        let untimed = MetricFamily {
            name: Some("up".to_string()),
            metric: vec![Metric::default()],
            ..Default::default()
        };
        assert_eq!(newest_timestamp_ms(&[untimed]), None);
    }
}
