use anyhow::{Result, ensure};
use ndarray::{Array1, Array2, ArrayView3, ArrayView4, Axis, s};
use rand::prelude::*;
use rayon::prelude::*;

use super::FeatureExtractor;

/// 内置的确定性编码器
///
/// 将每个通道平均池化到 GRID x GRID 的网格上，再乘以一个由种子生成的随机投影矩阵，最后做 L2 归一化。
/// 相同的种子和输入总是得到相同的输出，不依赖任何外部模型文件。
pub struct ProjectionEncoder {
    channels: usize,
    /// 投影矩阵，大小为 (channels * GRID * GRID, dimension)
    weights: Array2<f32>,
}

impl ProjectionEncoder {
    pub const GRID: usize = 8;

    pub fn new(channels: usize, dimension: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let fan_in = channels * Self::GRID * Self::GRID;
        let bound = (3.0 / fan_in.max(1) as f32).sqrt();
        let weights = Array2::from_shape_simple_fn((fan_in, dimension), || rng.random_range(-bound..bound));
        Self { channels, weights }
    }

    /// 平均池化，返回长度为 channels * GRID * GRID 的向量
    fn pool(&self, image: ArrayView3<f32>, out: &mut [f32]) {
        let (channels, height, width) = image.dim();
        let g = Self::GRID;
        for c in 0..channels {
            for gy in 0..g {
                let (y0, y1) = (gy * height / g, ((gy + 1) * height / g).max(gy * height / g + 1).min(height));
                for gx in 0..g {
                    let (x0, x1) = (gx * width / g, ((gx + 1) * width / g).max(gx * width / g + 1).min(width));
                    let cell = image.slice(s![c, y0..y1, x0..x1]);
                    out[(c * g + gy) * g + gx] = cell.mean().unwrap_or(0.0);
                }
            }
        }
    }
}

impl FeatureExtractor for ProjectionEncoder {
    fn dimension(&self) -> usize {
        self.weights.ncols()
    }

    fn extract(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (batch, channels, _, _) = images.dim();
        ensure!(channels == self.channels, "编码器需要 {} 个通道，输入为 {channels}", self.channels);

        let (fan_in, dimension) = self.weights.dim();
        let this = &*self;
        // 逐个样本计算，结果与批次的组成无关
        let features = (0..batch)
            .into_par_iter()
            .flat_map_iter(|i| {
                let mut pooled = Array1::zeros(fan_in);
                if let Some(out) = pooled.as_slice_mut() {
                    this.pool(images.index_axis(Axis(0), i), out);
                }
                let mut feature = pooled.dot(&this.weights);
                let norm = feature.dot(&feature).sqrt();
                if norm > 0.0 {
                    feature /= norm;
                }
                feature.to_vec()
            })
            .collect::<Vec<f32>>();
        let features = Array2::from_shape_vec((batch, dimension), features)?;
        Ok(features)
    }
}
