use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cli::*;
use crate::encoder::ModelKind;
use crate::error::ExtractError;
use crate::index::{IndexKind, Metric};

#[derive(Parser, Debug, Clone)]
#[command(name = "maskfeat", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 提取掩码区域的特征并构建向量索引
    Extract(ExtractCommand),
    /// 分布式提取中的单个 worker，由 extract 自动启动
    #[command(hide = true)]
    Worker(WorkerCommand),
    /// 在已保存的索引中搜索最相似的样本
    Search(SearchCommand),
}

/// 单个模型的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 模型名称，为 "None" 时表示禁用
    #[serde(default)]
    pub name: Option<String>,
    pub type_model: ModelKind,
    #[serde(default)]
    pub pretrained_path: Option<PathBuf>,
    #[serde(default)]
    pub model_config_path: Option<PathBuf>,
    /// 输出特征维度，未指定时使用索引维度
    #[serde(default)]
    pub dimension: Option<usize>,
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self.name.as_deref(), Some("None") | None)
    }
}

/// 向量索引配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub index_type: IndexKind,
    /// 向量维数
    pub dimension: usize,
    #[serde(default)]
    pub use_gpu: bool,
    #[serde(default)]
    pub device: usize,
    #[serde(default)]
    pub metric: Metric,
    /// 倒排列表数量
    #[serde(default)]
    pub nlist: Option<usize>,
    /// PQ 子空间数量，或 HNSW 每个节点的连接数
    #[serde(default, rename = "M")]
    pub m: Option<usize>,
    /// PQ 每个子空间的编码位数
    #[serde(default)]
    pub nbits: Option<u32>,
    /// 搜索时访问的倒排列表数量
    #[serde(default)]
    pub nprobe: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub data_dir: PathBuf,
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// 图片缩放尺寸，[高, 宽]
    #[serde(default)]
    pub target_size: Option<(usize, usize)>,
    #[serde(default = "default_manifest")]
    pub manifest: String,
}

impl DataConfig {
    pub const DEFAULT_TARGET_SIZE: (usize, usize) = (224, 224);

    /// 返回 (高, 宽)
    pub fn target_size(&self) -> (usize, usize) {
        self.target_size.unwrap_or(Self::DEFAULT_TARGET_SIZE)
    }
}

/// 一次提取任务的完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(alias = "faiss")]
    pub index: IndexConfig,
    pub data: DataConfig,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub distributed: bool,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_group_timeout_secs")]
    pub group_timeout_secs: u64,
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f32,
    /// 保存的示例图片数量，0 表示不保存
    #[serde(default = "default_sample_images")]
    pub sample_images: usize,
    /// 是否额外导出 features.npy
    #[serde(default)]
    pub export_features: bool,
}

/// 选中的模型
#[derive(Debug, Clone)]
pub struct SelectedModel {
    pub key: String,
    pub config: ModelConfig,
}

impl SelectedModel {
    /// 模型输出的特征维度
    pub fn dimension(&self, index: &IndexConfig) -> usize {
        match self.config.type_model {
            ModelKind::Clip => 512,
            ModelKind::DinoV2 => 1024,
            _ => self.config.dimension.unwrap_or(index.dimension),
        }
    }
}

impl RunConfig {
    /// 从 JSON 文件加载配置并校验
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&text).with_context(|| format!("无法解析配置文件 {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.data.batch_size == 0 {
            return Err(ExtractError::Config("batch_size 必须大于 0".into()));
        }
        if self.world_size == 0 {
            return Err(ExtractError::Config("world_size 必须大于 0".into()));
        }
        if self.index.dimension == 0 {
            return Err(ExtractError::Config("索引维度必须大于 0".into()));
        }
        let (h, w) = self.data.target_size();
        if h == 0 || w == 0 {
            return Err(ExtractError::Config(format!("无效的图片尺寸: {h}x{w}")));
        }
        if self.index.index_type == IndexKind::IvfPq {
            let m = self.index.m.unwrap_or(crate::index::DEFAULT_PQ_M);
            let nbits = self.index.nbits.unwrap_or(crate::index::DEFAULT_PQ_NBITS);
            if m == 0 || self.index.dimension % m != 0 {
                return Err(ExtractError::Config(format!(
                    "PQ 子空间数量 M = {m} 必须整除维度 {}",
                    self.index.dimension
                )));
            }
            if !(1..=8).contains(&nbits) {
                return Err(ExtractError::Config(format!("nbits = {nbits} 必须在 1 到 8 之间")));
            }
        }
        Ok(())
    }

    /// 选择模型：指定 key 时使用该模型，否则使用第一个名称不为 "None" 的模型
    pub fn select_model(&self, key: Option<&str>) -> Result<SelectedModel, ExtractError> {
        let (key, config) = match key {
            Some(key) => self
                .models
                .get_key_value(key)
                .ok_or_else(|| ExtractError::Config(format!("未找到模型 {key}")))?,
            None => self
                .models
                .iter()
                .find(|(_, m)| m.is_enabled())
                .ok_or_else(|| ExtractError::Config("没有可用的模型".into()))?,
        };
        let selected = SelectedModel { key: key.clone(), config: config.clone() };
        let actual = selected.dimension(&self.index);
        if actual != self.index.dimension {
            return Err(ExtractError::IndexDimensionMismatch { expected: self.index.dimension, actual });
        }
        Ok(selected)
    }

    /// 实际参与计算的进程数
    pub fn effective_world_size(&self) -> usize {
        if self.distributed { self.world_size } else { 1 }
    }

    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }

    pub fn output(&self) -> OutputDir {
        OutputDir::new(&self.output_dir)
    }
}

/// 输出目录，负责计算各产物的路径
#[derive(Debug, Clone)]
pub struct OutputDir {
    path: PathBuf,
}

impl OutputDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回索引文件的路径
    pub fn index(&self, model: &str) -> PathBuf {
        self.path.join(format!("feature_index_{}.index", model.to_lowercase()))
    }

    /// 返回元数据文件的路径
    pub fn metadata(&self) -> PathBuf {
        self.path.join("metadata.json")
    }

    pub fn summary(&self) -> PathBuf {
        self.path.join("processing_summary.txt")
    }

    pub fn features(&self) -> PathBuf {
        self.path.join("features.npy")
    }

    pub fn logs(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn sample_images(&self) -> PathBuf {
        self.path.join("sample_images")
    }
}

fn default_num_workers() -> usize {
    num_cpus::get().min(4)
}

fn default_manifest() -> String {
    "manifest.json".to_string()
}

fn default_world_size() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_master_addr() -> String {
    "127.0.0.1:12355".to_string()
}

fn default_group_timeout_secs() -> u64 {
    3600
}

fn default_mask_threshold() -> f32 {
    crate::mask::DEFAULT_THRESHOLD
}

fn default_sample_images() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> serde_json::Value {
        json!({
            "models": {
                "CLIP": { "name": "None", "type_model": "CLIP" },
                "PROJ": { "name": "proj", "type_model": "PROJECTION" }
            },
            "faiss": { "index_type": "Flat", "dimension": 16 },
            "data": { "data_dir": "data", "batch_size": 4 },
            "output_dir": "out"
        })
    }

    #[test]
    fn test_defaults_and_alias() {
        let config: RunConfig = serde_json::from_value(sample_config()).unwrap();
        assert_eq!(config.index.dimension, 16);
        assert_eq!(config.index.metric, Metric::L2);
        assert_eq!(config.seed, 42);
        assert_eq!(config.world_size, 1);
        assert_eq!(config.master_addr, "127.0.0.1:12355");
        assert_eq!(config.group_timeout_secs, 3600);
        assert_eq!(config.sample_images, 5);
        assert_eq!(config.data.manifest, "manifest.json");
        assert_eq!(config.data.target_size(), (224, 224));
        assert!(!config.export_features);
        assert_eq!(config.effective_world_size(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_select_first_enabled_model() {
        let config: RunConfig = serde_json::from_value(sample_config()).unwrap();
        let model = config.select_model(None).unwrap();
        assert_eq!(model.key, "PROJ");
        assert_eq!(model.config.type_model, ModelKind::Projection);
    }

    #[test]
    fn test_select_model_dimension_mismatch() {
        let config: RunConfig = serde_json::from_value(sample_config()).unwrap();
        let err = config.select_model(Some("CLIP")).unwrap_err();
        assert!(matches!(err, ExtractError::IndexDimensionMismatch { expected: 16, actual: 512 }));
    }

    #[test]
    fn test_select_unknown_model() {
        let config: RunConfig = serde_json::from_value(sample_config()).unwrap();
        assert!(matches!(config.select_model(Some("DINO")), Err(ExtractError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_pq() {
        let mut value = sample_config();
        value["faiss"] = json!({ "index_type": "IVFPQ", "dimension": 16, "M": 5, "nbits": 8 });
        let config: RunConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(config.validate(), Err(ExtractError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut value = sample_config();
        value["data"]["batch_size"] = json!(0);
        let config: RunConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(config.validate(), Err(ExtractError::Config(_))));
    }

    #[test]
    fn test_output_paths() {
        let output = OutputDir::new("out");
        assert_eq!(output.index("CLIP"), PathBuf::from("out/feature_index_clip.index"));
        assert_eq!(output.metadata(), PathBuf::from("out/metadata.json"));
        assert_eq!(output.summary(), PathBuf::from("out/processing_summary.txt"));
    }
}
