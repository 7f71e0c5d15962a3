//! Hash ring and forwarding codec benchmarks

use telefed::cluster::protocol::{decode_message, encode_metric_message};
use telefed::cluster::HashRing;
use telefed::schema::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use telefed::store::PartitionedMetrics;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn node_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("telefed-{}", i)).collect()
}

fn create_test_batch(families: usize, series: usize) -> PartitionedMetrics {
    let now = chrono::Utc::now().timestamp_millis();
    let families = (0..families)
        .map(|f| MetricFamily {
            name: Some(format!("metric_{}", f)),
            r#type: Some(MetricType::Gauge as i32),
            metric: (0..series)
                .map(|s| Metric {
                    label: vec![LabelPair {
                        name: Some("instance".to_string()),
                        value: Some(format!("server-{:02}", s % 10)),
                    }],
                    gauge: Some(Gauge {
                        value: Some((s as f64 % 100.0) / 100.0),
                    }),
                    timestamp_ms: Some(now),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();
    PartitionedMetrics::new("cluster-bench", families)
}

fn benchmark_ring_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_lookup");
    let keys: Vec<String> = (0..1_000).map(|i| format!("cluster-{}", i)).collect();

    for nodes in [3, 10, 50] {
        let ring = HashRing::new(node_names(nodes));
        group.throughput(Throughput::Elements(keys.len() as u64));

        group.bench_function(format!("{}_nodes", nodes), |b| {
            b.iter(|| {
                for key in &keys {
                    black_box(ring.lookup(key));
                }
            });
        });
    }

    group.finish();
}

fn benchmark_ring_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_build");

    for nodes in [3, 10, 50] {
        let names = node_names(nodes);
        group.bench_function(format!("{}_nodes", nodes), |b| {
            b.iter(|| black_box(HashRing::new(&names)));
        });
    }

    group.finish();
}

fn benchmark_message_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("metric_message");

    for series in [10, 100] {
        let batch = create_test_batch(20, series);
        let encoded = encode_metric_message(&batch).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_function(format!("encode_{}_series", series), |b| {
            b.iter(|| black_box(encode_metric_message(&batch).unwrap()));
        });
        group.bench_function(format!("decode_{}_series", series), |b| {
            b.iter(|| black_box(decode_message(&encoded).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_ring_lookup,
    benchmark_ring_build,
    benchmark_message_codec,
);

criterion_main!(benches);
