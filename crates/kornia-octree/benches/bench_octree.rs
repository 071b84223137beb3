use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::DVec3;
use kornia_octree::{Octree, OctreeParams, QueryStack, Ray3};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn generate_points(count: usize) -> Vec<DVec3> {
    let mut rng = StdRng::seed_from_u64(0);
    (0..count)
        .map(|_| {
            DVec3::new(
                rng.random_range(-10.0..10.0),
                rng.random_range(-10.0..10.0),
                rng.random_range(-10.0..10.0),
            )
        })
        .collect()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("octree_build");

    for count in [1_000, 10_000, 100_000] {
        let points = generate_points(count);

        for tight_bounding_boxes in [true, false] {
            let params = OctreeParams {
                tight_bounding_boxes,
                ..Default::default()
            };
            let mode = if tight_bounding_boxes { "tight" } else { "bisected" };
            let id = format!("{count}_{mode}");

            group.bench_with_input(BenchmarkId::new("new", id), &points, |b, points| {
                b.iter(|| Octree::new(black_box(points), &params))
            });
        }
    }

    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let points = generate_points(100_000);
    let octree = Octree::new(&points, &OctreeParams::default()).unwrap();
    let mut stack = QueryStack::new();

    c.bench_function("closest_points", |b| {
        let mut indices = Vec::new();
        b.iter(|| {
            indices.clear();
            octree.closest_points(
                &points,
                black_box(DVec3::new(1.0, 2.0, 3.0)),
                0.5,
                &mut indices,
                None,
                &mut stack,
            );
        })
    });

    let ray = Ray3::through(DVec3::new(0.0, 0.0, -30.0), DVec3::new(1.0, 2.0, 3.0)).unwrap();

    c.bench_function("intersecting_leaves_in_cone", |b| {
        let mut leaves = Vec::new();
        b.iter(|| {
            leaves.clear();
            octree.intersecting_leaves_in_cone(black_box(&ray), 0.01, &mut leaves, &mut stack);
        })
    });
}

criterion_group!(benches, bench_build, bench_queries);
criterion_main!(benches);
