use criterion::{Criterion, black_box, criterion_group, criterion_main};
use maskfeat::dataset::Sample;
use maskfeat::kmeans::kmeans;
use maskfeat::reconcile::{LocalResult, reconcile};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const DIM: usize = 512;

// 模拟 world 个 worker 按步长划分后的结果，id 在各 worker 内乱序
fn generate_parts(n: usize, world: usize) -> Vec<LocalResult> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..world)
        .map(|rank| {
            let mut ids = (rank..n).step_by(world).map(|i| i as u64).collect::<Vec<_>>();
            ids.shuffle(&mut rng);
            LocalResult {
                rank,
                dim: DIM,
                features: (0..ids.len() * DIM).map(|_| rng.random::<f32>()).collect(),
                samples: ids
                    .into_iter()
                    .map(|id| Sample {
                        id,
                        object_name: format!("obj_{id}"),
                        data_dir: "data".into(),
                        image_path: format!("data/{id}.png"),
                        mask_path: format!("data/{id}_mask.png"),
                        dataset_type: "default".into(),
                    })
                    .collect(),
            }
        })
        .collect()
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    for (n, world) in [(10_000, 2), (10_000, 8), (50_000, 8)] {
        let parts = generate_parts(n, world);
        group.bench_function(format!("reconcile_{n}_{world}"), |b| {
            b.iter(|| reconcile(black_box(parts.clone()), n).unwrap())
        });
    }

    group.finish();
}

fn bench_kmeans(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let data = Array2::from_shape_simple_fn((10_000, 64), || rng.random::<f32>());

    c.bench_function("kmeans_10000_64_100", |b| b.iter(|| kmeans(black_box(data.view()), 100, 10, 0)));
}

criterion_group!(benches, bench_reconcile, bench_kmeans);
criterion_main!(benches);
