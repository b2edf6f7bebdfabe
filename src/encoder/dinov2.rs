use std::path::Path;

use anyhow::{Result, ensure};
use candle_core::{D, DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};
use log::info;
use ndarray::{Array2, ArrayView4};

use super::FeatureExtractor;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const LAYER_NORM_EPS: f64 = 1e-6;

/// DINOv2 ViT 结构参数
#[derive(Debug, Clone, Copy)]
pub struct DinoConfig {
    pub depth: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub patch_size: usize,
    /// 预训练位置编码的网格边长
    pub grid: usize,
}

impl DinoConfig {
    /// facebook/dinov2-large
    pub fn vit_large() -> Self {
        Self { depth: 24, embed_dim: 1024, num_heads: 16, patch_size: 14, grid: 37 }
    }
}

struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
}

impl Attention {
    fn new(vb: VarBuilder, dim: usize, num_heads: usize) -> Result<Self> {
        let inner = vb.pp("attention");
        Ok(Self {
            query: candle_nn::linear(dim, dim, inner.pp("query"))?,
            key: candle_nn::linear(dim, dim, inner.pp("key"))?,
            value: candle_nn::linear(dim, dim, inner.pp("value"))?,
            output: candle_nn::linear(dim, dim, vb.pp("output").pp("dense"))?,
            num_heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let head_dim = c / self.num_heads;
        let heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, n, self.num_heads, head_dim))?.transpose(1, 2)?.contiguous()?)
        };
        let q = heads(self.query.forward(xs)?)?;
        let k = heads(self.key.forward(xs)?)?;
        let v = heads(self.value.forward(xs)?)?;

        let attn = q.matmul(&k.t()?)?.affine(1.0 / (head_dim as f64).sqrt(), 0.0)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        Ok(self.output.forward(&out)?)
    }
}

struct Block {
    norm1: LayerNorm,
    attention: Attention,
    scale1: Tensor,
    norm2: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    scale2: Tensor,
}

impl Block {
    fn new(vb: VarBuilder, dim: usize, num_heads: usize) -> Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm1"))?,
            attention: Attention::new(vb.pp("attention"), dim, num_heads)?,
            scale1: vb.pp("layer_scale1").get(dim, "lambda1")?,
            norm2: candle_nn::layer_norm(dim, LAYER_NORM_EPS, vb.pp("norm2"))?,
            fc1: candle_nn::linear(dim, dim * 4, vb.pp("mlp").pp("fc1"))?,
            fc2: candle_nn::linear(dim * 4, dim, vb.pp("mlp").pp("fc2"))?,
            scale2: vb.pp("layer_scale2").get(dim, "lambda1")?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attn = self.attention.forward(&self.norm1.forward(xs)?)?;
        let xs = (xs + attn.broadcast_mul(&self.scale1)?)?;
        let mlp = self.fc2.forward(&self.fc1.forward(&self.norm2.forward(&xs)?)?.gelu_erf()?)?;
        Ok((&xs + mlp.broadcast_mul(&self.scale2)?)?)
    }
}

/// DINOv2 图像编码器，输出最后一层 CLS token
pub struct DinoV2Encoder {
    patch_embed: Conv2d,
    cls_token: Tensor,
    position_embeddings: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    config: DinoConfig,
    device: Device,
}

impl DinoV2Encoder {
    /// 从 safetensors 权重文件加载 ViT-L/14，有 CUDA 时使用第 `device` 号显卡
    pub fn open(weights: &Path, device: usize) -> Result<Self> {
        let device = Device::cuda_if_available(device)?;
        info!("DINOv2 使用设备: {device:?}");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        Self::new(vb, DinoConfig::vit_large(), device)
    }

    pub fn new(vb: VarBuilder, config: DinoConfig, device: Device) -> Result<Self> {
        let DinoConfig { depth, embed_dim, num_heads, patch_size, grid } = config;
        let embeddings = vb.pp("embeddings");
        let conv = Conv2dConfig { stride: patch_size, ..Default::default() };
        let patch_embed =
            candle_nn::conv2d(3, embed_dim, patch_size, conv, embeddings.pp("patch_embeddings").pp("projection"))?;
        let cls_token = embeddings.get((1, 1, embed_dim), "cls_token")?;
        let position_embeddings = embeddings.get((1, grid * grid + 1, embed_dim), "position_embeddings")?;

        let layers = vb.pp("encoder").pp("layer");
        let blocks = (0..depth).map(|i| Block::new(layers.pp(i), embed_dim, num_heads)).collect::<Result<Vec<_>>>()?;
        let norm = candle_nn::layer_norm(embed_dim, LAYER_NORM_EPS, vb.pp("layernorm"))?;

        Ok(Self { patch_embed, cls_token, position_embeddings, blocks, norm, config, device })
    }

    /// 输入网格与预训练网格不同时对位置编码重采样
    fn position_embeddings(&self, h: usize, w: usize) -> Result<Tensor> {
        let DinoConfig { embed_dim, grid, .. } = self.config;
        if h == grid && w == grid {
            return Ok(self.position_embeddings.clone());
        }
        let cls = self.position_embeddings.narrow(1, 0, 1)?;
        let patches = self
            .position_embeddings
            .narrow(1, 1, grid * grid)?
            .reshape((1, grid, grid, embed_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .upsample_nearest2d(h, w)?
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .reshape((1, h * w, embed_dim))?;
        Ok(Tensor::cat(&[&cls, &patches], 1)?)
    }
}

impl FeatureExtractor for DinoV2Encoder {
    fn dimension(&self) -> usize {
        self.config.embed_dim
    }

    fn extract(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        let (batch, channels, height, width) = images.dim();
        let patch = self.config.patch_size;
        ensure!(
            channels == 3 && height % patch == 0 && width % patch == 0,
            "DINOv2 需要 3 通道且边长为 {patch} 的倍数的输入，实际为 {channels}x{height}x{width}"
        );

        let data = images.iter().copied().collect::<Vec<_>>();
        let pixels = Tensor::from_vec(data, (batch, channels, height, width), &self.device)?;
        let mean = Tensor::new(&IMAGENET_MEAN, &self.device)?.reshape((1, 3, 1, 1))?;
        let std = Tensor::new(&IMAGENET_STD, &self.device)?.reshape((1, 3, 1, 1))?;
        let pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;

        // (B, E, h, w) -> (B, h*w, E)
        let patches = self.patch_embed.forward(&pixels)?.flatten_from(2)?.transpose(1, 2)?;
        let cls = self.cls_token.broadcast_as((batch, 1, self.config.embed_dim))?;
        let mut xs = Tensor::cat(&[&cls, &patches], 1)?
            .broadcast_add(&self.position_embeddings(height / patch, width / patch)?)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }

        let features = self.norm.forward(&xs)?.i((.., 0))?.contiguous()?;
        let norm = features.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
        let features = features.broadcast_div(&norm)?;

        let rows = features.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(Array2::from_shape_vec((batch, self.config.embed_dim), rows.into_iter().flatten().collect())?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;

    #[test]
    fn test_dinov2_output_shape() {
        let config = DinoConfig { depth: 2, embed_dim: 32, num_heads: 4, patch_size: 14, grid: 2 };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut encoder = DinoV2Encoder::new(vb, config, Device::Cpu).unwrap();
        assert_eq!(encoder.dimension(), 32);

        // 网格 3x2 与预训练网格不同，会重采样位置编码
        let images = Array4::from_elem((2, 3, 42, 28), 0.5);
        let features = encoder.extract(images.view()).unwrap();
        assert_eq!(features.dim(), (2, 32));
        assert!(features.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_dinov2_rejects_bad_size() {
        let config = DinoConfig { depth: 1, embed_dim: 8, num_heads: 2, patch_size: 14, grid: 1 };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut encoder = DinoV2Encoder::new(vb, config, Device::Cpu).unwrap();
        assert!(encoder.extract(Array4::zeros((1, 3, 15, 14)).view()).is_err());
    }
}
