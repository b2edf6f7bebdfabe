#[cfg(feature = "candle")]
mod clip;
#[cfg(feature = "candle")]
mod dinov2;
mod projection;

use anyhow::Result;
#[cfg(feature = "candle")]
pub use clip::*;
#[cfg(feature = "candle")]
pub use dinov2::*;
use log::info;
use ndarray::{Array2, ArrayView4};
pub use projection::*;
use serde::{Deserialize, Serialize};

use crate::config::{IndexConfig, SelectedModel};
use crate::error::ExtractError;

/// 配置文件中 `type_model` 的取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "CLIP", alias = "clip")]
    Clip,
    #[serde(rename = "DINOV2", alias = "dinov2")]
    DinoV2,
    #[serde(rename = "PROJECTION", alias = "projection")]
    Projection,
}

/// 将一批图片编码为特征向量
pub trait FeatureExtractor {
    /// 输出特征维度
    fn dimension(&self) -> usize;

    /// 编码一批图片
    ///
    /// # Arguments
    ///
    /// * `images` - 图片，大小为 (B, C, H, W)
    ///
    /// 返回大小为 (B, D) 的特征矩阵
    fn extract(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>>;
}

pub enum Encoder {
    Projection(ProjectionEncoder),
    #[cfg(feature = "candle")]
    Clip(ClipEncoder),
    #[cfg(feature = "candle")]
    DinoV2(DinoV2Encoder),
}

impl Encoder {
    /// 根据选中的模型创建编码器
    ///
    /// # Arguments
    ///
    /// * `model` - 选中的模型
    /// * `index` - 索引配置，提供默认的特征维度
    /// * `channels` - 输入图片通道数
    /// * `device` - 设备编号，通常等于 rank
    /// * `seed` - 随机种子
    pub fn create(
        model: &SelectedModel,
        index: &IndexConfig,
        channels: usize,
        device: usize,
        seed: u64,
    ) -> Result<Self> {
        let encoder = match model.config.type_model {
            ModelKind::Projection => {
                Self::Projection(ProjectionEncoder::new(channels, model.dimension(index), seed))
            }
            #[cfg(feature = "candle")]
            ModelKind::Clip => {
                let path = model.config.pretrained_path.as_ref().ok_or_else(|| {
                    ExtractError::Config(format!("模型 {} 缺少 pretrained_path", model.key))
                })?;
                Self::Clip(ClipEncoder::open(path, device)?)
            }
            #[cfg(feature = "candle")]
            ModelKind::DinoV2 => {
                let path = model.config.pretrained_path.as_ref().ok_or_else(|| {
                    ExtractError::Config(format!("模型 {} 缺少 pretrained_path", model.key))
                })?;
                Self::DinoV2(DinoV2Encoder::open(path, device)?)
            }
            #[cfg(not(feature = "candle"))]
            ModelKind::Clip | ModelKind::DinoV2 => {
                let _ = device;
                return Err(ExtractError::Config(format!(
                    "{:?} 模型需要启用 candle 特性编译",
                    model.config.type_model
                ))
                .into());
            }
        };
        info!("已加载模型 {}，特征维度 = {}", model.key, encoder.dimension());
        Ok(encoder)
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Projection(_) => ModelKind::Projection,
            #[cfg(feature = "candle")]
            Self::Clip(_) => ModelKind::Clip,
            #[cfg(feature = "candle")]
            Self::DinoV2(_) => ModelKind::DinoV2,
        }
    }
}

impl FeatureExtractor for Encoder {
    fn dimension(&self) -> usize {
        match self {
            Self::Projection(e) => e.dimension(),
            #[cfg(feature = "candle")]
            Self::Clip(e) => e.dimension(),
            #[cfg(feature = "candle")]
            Self::DinoV2(e) => e.dimension(),
        }
    }

    fn extract(&mut self, images: ArrayView4<f32>) -> Result<Array2<f32>> {
        match self {
            Self::Projection(e) => e.extract(images),
            #[cfg(feature = "candle")]
            Self::Clip(e) => e.extract(images),
            #[cfg(feature = "candle")]
            Self::DinoV2(e) => e.extract(images),
        }
    }
}
