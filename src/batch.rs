use std::path::{Path, PathBuf};

use ndarray::{Array2, Array4, s};
use rayon::prelude::*;

use crate::dataset::{Batch, Sample};
use crate::encoder::{Encoder, FeatureExtractor};
use crate::error::ExtractError;
use crate::mask::{MaskCompositor, SampleDumper};
use crate::utils::{TimeMeasure, imread_gray};

/// 读取一批样本的掩码，返回大小为 (B, 1, H, W) 的张量
///
/// 任何一个掩码读取失败都会使整批失败，错误中包含批次内第一个失败的路径
pub fn load_masks(samples: &[Sample], (height, width): (usize, usize)) -> Result<Array4<f32>, ExtractError> {
    let decoded = samples
        .par_iter()
        .map(|sample| {
            imread_gray(Path::new(&sample.mask_path), (height, width))
                .map_err(|source| ExtractError::MaskLoad { path: PathBuf::from(&sample.mask_path), source })
        })
        .collect::<Vec<_>>();

    let mut masks = Array4::zeros((samples.len(), 1, height, width));
    for (i, mask) in decoded.into_iter().enumerate() {
        masks.slice_mut(s![i, 0, .., ..]).assign(&mask?);
    }
    Ok(masks)
}

/// 处理单个批次：读取掩码、应用掩码、编码
pub struct BatchProcessor {
    encoder: Encoder,
    compositor: MaskCompositor,
    dumper: SampleDumper,
    target_size: (usize, usize),
    timings: TimeMeasure,
}

impl BatchProcessor {
    pub fn new(encoder: Encoder, compositor: MaskCompositor, dumper: SampleDumper, target_size: (usize, usize)) -> Self {
        Self { encoder, compositor, dumper, target_size, timings: TimeMeasure::new() }
    }

    pub fn dimension(&self) -> usize {
        self.encoder.dimension()
    }

    /// 返回大小为 (B, D) 的特征和原样的样本列表，两者按行对齐
    pub fn process(&mut self, batch: Batch) -> anyhow::Result<(Array2<f32>, Vec<Sample>)> {
        let (images, samples) = batch.into_parts();
        let target_size = self.target_size;

        let masks = self.timings.measure("mask", || load_masks(&samples, target_size))?;
        let masked = self.timings.measure("compose", || self.compositor.compose(images.view(), masks.view().into_dyn()))?;
        self.dumper.offer(images.view(), masked.view());
        let features = self.timings.measure("encode", || self.encoder.extract(masked.view()))?;

        let expected = (samples.len(), self.encoder.dimension());
        if features.dim() != expected {
            return Err(ExtractError::ShapeMismatch(format!(
                "编码器输出形状为 {:?}，应为 {expected:?}",
                features.dim()
            ))
            .into());
        }
        Ok((features, samples))
    }

    /// 等待后台任务结束，返回累计的计时
    pub fn finish(self) -> TimeMeasure {
        self.dumper.finish();
        self.timings
    }
}
