use std::path::PathBuf;

use thiserror::Error;

/// 提取流程中可以被调用方区分处理的错误
#[derive(Error, Debug)]
pub enum ExtractError {
    /// 掩码与图片批次大小不一致，或无法广播，或编码器输出形状错误
    #[error("形状不匹配: {0}")]
    ShapeMismatch(String),

    #[error("无法加载掩码 {path}: {source}")]
    MaskLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("无法加载图片 {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// 进程组建立失败或超时
    #[error("进程组初始化失败: {0}")]
    ProcessGroupInit(String),

    /// barrier / all-gather 失败：对端中止、断开或超时
    #[error("集合通信失败: {0}")]
    Collective(String),

    /// 合并结果时发现重复或缺失的 id
    #[error("结果合并校验失败: {0}")]
    ReconciliationIntegrity(String),

    #[error("特征维度不匹配: 索引维度为 {expected}，实际为 {actual}")]
    IndexDimensionMismatch { expected: usize, actual: usize },

    #[error("配置无效: {0}")]
    Config(String),
}
