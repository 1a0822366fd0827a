//! Benchmarks for the geo-cluster index
//!
//! Measures performance of:
//! - Bulk insertion
//! - Member drift inside a cluster box
//! - Root moves (reparenting)
//! - Nearby queries

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hailmesh_geo::{GeoIndex, TaxiId};

/// Deterministic scatter over a square of the given side.
fn scatter(n: usize, side: f64) -> Vec<(TaxiId, f64, f64)> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..n)
        .map(|i| (TaxiId::from(format!("taxi-{i}")), next() * side, next() * side))
        .collect()
}

fn populated(taxis: &[(TaxiId, f64, f64)]) -> GeoIndex {
    let mut index = GeoIndex::new();
    for (id, lat, lon) in taxis {
        let _ = index.upsert(id, *lat, *lon);
    }
    index
}

/// Benchmark building an index from scratch
fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for &n in &[100usize, 1_000, 10_000] {
        let taxis = scatter(n, 50.0);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &taxis, |b, taxis| {
            b.iter(|| black_box(populated(taxis)))
        });
    }
    group.finish();
}

/// Benchmark small moves that stay inside the cluster box
fn bench_member_drift(c: &mut Criterion) {
    let mut group = c.benchmark_group("member_drift");

    for &n in &[1_000usize, 10_000] {
        let taxis = scatter(n, 50.0);
        let mut index = populated(&taxis);
        let mut flip = false;
        group.bench_function(BenchmarkId::from_parameter(n), |b| {
            b.iter(|| {
                flip = !flip;
                let delta = if flip { 1e-6 } else { -1e-6 };
                for (id, lat, lon) in taxis.iter().step_by(10) {
                    let _ = index.upsert(id, lat + delta, *lon);
                }
            })
        });
    }
    group.finish();
}

/// Benchmark dense clusters where every root move reparents
fn bench_dense_reparent(c: &mut Criterion) {
    let taxis = scatter(2_000, 2.0);
    let mut index = populated(&taxis);
    let mut step = 0usize;

    c.bench_function("dense_reparent", |b| {
        b.iter(|| {
            step = (step + 1) % taxis.len();
            let (id, lat, lon) = &taxis[step];
            let _ = index.upsert(id, lat + 0.01, *lon);
            let _ = index.upsert(id, *lat, *lon);
        })
    });
}

/// Benchmark nearby queries at several population sizes
fn bench_query_near(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_near");

    for &n in &[100usize, 1_000, 10_000, 100_000] {
        let taxis = scatter(n, 100.0);
        let index = populated(&taxis);
        let queries = scatter(64, 100.0);
        group.throughput(Throughput::Elements(queries.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &queries, |b, queries| {
            b.iter(|| {
                for (_, lat, lon) in queries {
                    black_box(index.query_near(*lat, *lon));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_insert,
    bench_member_drift,
    bench_dense_reparent,
    bench_query_near,
);
criterion_main!(benches);
