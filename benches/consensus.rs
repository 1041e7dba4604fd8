//! Benchmark correspondence candidate generation and consensus
//! filtering on synthetic feature sets.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use sandhi_align::matching::{filter_ransac, match_candidates, ConsensusParams};
use sandhi_align::{Feature, Model, ModelKind, Point, Point2D, PointMatch};

const DESCRIPTOR_LEN: usize = 128;

/// Features at random positions with random descriptors.
fn synthetic_features(n: usize, rng: &mut StdRng) -> Vec<Feature> {
    (0..n)
        .map(|_| Feature {
            location: Point2D::new(
                rng.random_range(0.0..512.0),
                rng.random_range(0.0..512.0),
            ),
            scale: 1.6,
            orientation: 0.0,
            descriptor: (0..DESCRIPTOR_LEN)
                .map(|_| rng.random_range(0.0..1.0))
                .collect(),
        })
        .collect()
}

/// Candidate pool with the given share of uniformly wrong pairs; the
/// rest agree on one translation up to Gaussian localization noise.
fn candidate_pool(n: usize, outlier_share: f32, rng: &mut StdRng) -> Vec<PointMatch> {
    let outliers = (n as f32 * outlier_share) as usize;
    let noise = Normal::new(0.0f32, 0.3).unwrap();
    let mut pool = Vec::with_capacity(n);
    for i in 0..n {
        let p = Point2D::new(
            rng.random_range(0.0..512.0),
            rng.random_range(0.0..512.0),
        );
        let q = if i < outliers {
            Point2D::new(
                rng.random_range(0.0..512.0),
                rng.random_range(0.0..512.0),
            )
        } else {
            p + Point2D::new(17.0 + noise.sample(rng), -6.0 + noise.sample(rng))
        };
        pool.push(PointMatch::new(Point::new(p), Point::new(q)));
    }
    pool
}

fn bench_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_candidates");
    for &n in &[100usize, 300, 600] {
        let mut rng = StdRng::seed_from_u64(7);
        let a = synthetic_features(n, &mut rng);
        let b: Vec<Feature> = a
            .iter()
            .map(|f| {
                let mut g = f.clone();
                g.location = g.location + Point2D::new(9.0, 5.0);
                g
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| black_box(match_candidates(black_box(&a), black_box(&b), 0.92)))
        });
    }
    group.finish();
}

fn bench_consensus(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_ransac");
    let template = Model::identity(ModelKind::Rigid);
    let params = ConsensusParams {
        max_epsilon: 2.0,
        ..ConsensusParams::default()
    };
    for &share in &[0.0f32, 0.3, 0.6] {
        let mut rng = StdRng::seed_from_u64(11);
        let pool = candidate_pool(500, share, &mut rng);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("outliers_{:.0}%", share * 100.0)),
            &share,
            |bench, _| {
                let mut rng = StdRng::seed_from_u64(13);
                bench.iter(|| {
                    black_box(filter_ransac(
                        &mut rng,
                        black_box(&pool),
                        &template,
                        &params,
                    ))
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_candidates, bench_consensus);
criterion_main!(benches);
