use std::path::Path;

use anyhow::{Result, ensure};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::clip;
use log::info;
use ndarray::{Array2, ArrayView4};

use super::FeatureExtractor;

const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// CLIP ViT-B/32 图像编码器
pub struct ClipEncoder {
    vision_model: clip::vision_model::ClipVisionTransformer,
    visual_projection: Linear,
    device: Device,
    image_size: usize,
    dimension: usize,
}

impl ClipEncoder {
    /// 从 safetensors 权重文件加载模型，有 CUDA 时使用第 `device` 号显卡
    pub fn open(weights: &Path, device: usize) -> Result<Self> {
        let device = Device::cuda_if_available(device)?;
        info!("CLIP 使用设备: {device:?}");
        let config = clip::ClipConfig::vit_base_patch32();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };

        let vision_model =
            clip::vision_model::ClipVisionTransformer::new(vb.pp("vision_model"), &config.vision_config)?;
        let dimension = config.text_config.projection_dim;
        let visual_projection =
            candle_nn::linear_no_bias(config.vision_config.embed_dim, dimension, vb.pp("visual_projection"))?;

        Ok(Self { vision_model, visual_projection, device, image_size: config.vision_config.image_size, dimension })
    }
}

impl FeatureExtractor for ClipEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (batch, channels, height, width) = images.dim();
        ensure!(
            channels == 3 && height == self.image_size && width == self.image_size,
            "CLIP 需要 3x{0}x{0} 的输入，实际为 {channels}x{height}x{width}",
            self.image_size
        );

        let data = images.iter().copied().collect::<Vec<_>>();
        let pixels = Tensor::from_vec(data, (batch, channels, height, width), &self.device)?;
        let mean = Tensor::new(&CLIP_MEAN, &self.device)?.reshape((1, 3, 1, 1))?;
        let std = Tensor::new(&CLIP_STD, &self.device)?.reshape((1, 3, 1, 1))?;
        let pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;

        let features = self.visual_projection.forward(&self.vision_model.forward(&pixels)?)?;
        let norm = features.sqr()?.sum_keepdim(1)?.sqrt()?;
        let features = features.broadcast_div(&norm)?;

        let rows = features.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(Array2::from_shape_vec((batch, self.dimension), rows.into_iter().flatten().collect())?)
    }
}
