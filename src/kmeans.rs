use kmeans::{EuclideanDistance, KMeans, KMeansConfig, KMeansState};
use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::prelude::*;
use rayon::prelude::*;

/// 聚类结果
#[derive(Debug, Clone)]
pub struct Clusters {
    /// 所有向量到其聚类中心的距离之和
    pub distsum: f32,
    /// 聚类中心，大小为 (k, d)
    pub centroids: Array2<f32>,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
}

fn l2_sqr(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// 使用 kmeans 聚类
///
/// 初始中心由固定种子的 k-means++ 选出，再交给 Lloyd 迭代，相同输入与种子得到相同结果。
/// k 大于向量数量时会被截断。
///
/// 参数：
/// - data: 输入向量，大小为 (n, d)
/// - k: 聚类中心数量
/// - max_iter: 最大迭代次数
/// - seed: 随机种子
pub fn kmeans(data: ArrayView2<f32>, k: usize, max_iter: usize, seed: u64) -> Clusters {
    let (n, d) = data.dim();
    let k = k.min(n);
    if k == 0 || d == 0 {
        return Clusters { distsum: 0.0, centroids: Array2::zeros((k, d)), centroid_frequency: vec![0; k] };
    }

    let x = data.iter().copied().collect::<Vec<f32>>();
    let init = init_centroids(data, k, &mut StdRng::seed_from_u64(seed))
        .into_iter()
        .flat_map(|i| data.row(i).to_vec())
        .collect::<Vec<_>>();

    let km: KMeans<_, 16, _> = KMeans::new(&x, n, d, EuclideanDistance);
    let conf = KMeansConfig::build()
        .iteration_done(&|s: &KMeansState<f32>, nr: usize, new_distsum: f32| {
            debug!("k-means 第 {nr} 轮，总距离 {new_distsum:.4}，不平衡度 {:.2}", imbalance_factor(&s.centroid_frequency));
        })
        .build();
    let state = km.kmeans_lloyd(k, max_iter, KMeans::init_precomputed(init), &conf);

    // 中心可能按 SIMD 宽度补齐，只取前 d 维
    let raw = state.centroids.to_vec();
    let stride = raw.len() / k;
    let centroids = Array2::from_shape_fn((k, d), |(i, j)| raw[i * stride + j]);

    Clusters { distsum: state.distsum, centroids, centroid_frequency: state.centroid_frequency.clone() }
}

/// k-means++：按到已选中心距离的平方加权选择下一个中心，返回所选行号
fn init_centroids(data: ArrayView2<f32>, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let n = data.nrows();
    let mut chosen = vec![rng.random_range(0..n)];
    let mut dist = (0..n).into_par_iter().map(|i| l2_sqr(data.row(i), data.row(chosen[0]))).collect::<Vec<_>>();

    while chosen.len() < k {
        let total = dist.iter().sum::<f32>();
        let next = if total > 0.0 {
            let mut target = rng.random_range(0.0..total);
            let mut pick = n - 1;
            for (i, &d) in dist.iter().enumerate() {
                if target < d {
                    pick = i;
                    break;
                }
                target -= d;
            }
            pick
        } else {
            // 剩余的点都与已选中心重合
            rng.random_range(0..n)
        };
        chosen.push(next);
        let center = data.row(next);
        dist.par_iter_mut().enumerate().for_each(|(i, d)| *d = (*d).min(l2_sqr(data.row(i), center)));
    }
    chosen
}

/// 计算不平衡因子，1 表示完全平衡
pub fn imbalance_factor(hist: &[usize]) -> f32 {
    let (mut tot, mut uf) = (0.0, 0.0);
    for h in hist {
        let h = *h as f32;
        tot += h;
        uf += h.powf(2.0);
    }
    if tot == 0.0 {
        return 1.0;
    }
    uf * hist.len() as f32 / tot.powf(2.0)
}
