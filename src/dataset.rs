use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::utils::imread_rgb;

/// 一个样本，同时也是元数据文件中的一条记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// 全局唯一的样本 id
    pub id: u64,
    pub object_name: String,
    pub data_dir: String,
    pub image_path: String,
    pub mask_path: String,
    pub dataset_type: String,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(default)]
    id: Option<u64>,
    object_name: String,
    #[serde(default)]
    data_dir: Option<String>,
    image_path: String,
    mask_path: String,
    #[serde(default)]
    dataset_type: Option<String>,
}

/// 由清单文件描述的数据集
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    /// 读取 `<root>/<manifest>`，相对路径以 root 为基准
    pub fn open(root: impl AsRef<Path>, manifest: &str) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let path = root.join(manifest);
        let reader = BufReader::new(
            File::open(&path).with_context(|| format!("无法打开数据集清单 {}", path.display()))?,
        );
        let entries: Vec<ManifestEntry> = serde_json::from_reader(reader)
            .with_context(|| format!("无法解析数据集清单 {}", path.display()))?;

        let resolve = |p: &str| -> String {
            let p = Path::new(p);
            let resolved = if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
            resolved.to_string_lossy().into_owned()
        };

        let samples = entries
            .into_iter()
            .enumerate()
            .map(|(pos, entry)| Sample {
                id: entry.id.unwrap_or(pos as u64),
                object_name: entry.object_name,
                data_dir: entry
                    .data_dir
                    .as_deref()
                    .map(resolve)
                    .unwrap_or_else(|| root.to_string_lossy().into_owned()),
                image_path: resolve(&entry.image_path),
                mask_path: resolve(&entry.mask_path),
                dataset_type: entry.dataset_type.unwrap_or_else(|| "default".to_string()),
            })
            .collect();

        Ok(Self { samples })
    }

    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&Sample> {
        self.samples.get(pos)
    }
}

/// 分配给某个 worker 的数据集位置
///
/// 按步长划分：rank, rank + world, rank + 2 * world, ...
/// 所有 rank 的分片互不相交，并恰好覆盖整个数据集
#[derive(Debug, Clone)]
pub struct Shard {
    rank: usize,
    world_size: usize,
    indices: Vec<usize>,
}

impl Shard {
    pub fn new(len: usize, world_size: usize, rank: usize) -> Result<Self, ExtractError> {
        if world_size == 0 || rank >= world_size {
            return Err(ExtractError::Config(format!("无效的分片参数: rank = {rank}, world_size = {world_size}")));
        }
        let indices = (rank..len).step_by(world_size).collect();
        Ok(Self { rank, world_size, indices })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// 按 batch_size 切分，最后一批可能不满
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = &[usize]> {
        self.indices.chunks(batch_size.max(1))
    }
}

/// 一批图片及其对应的样本
#[derive(Debug, Clone)]
pub struct Batch {
    images: Array4<f32>,
    samples: Vec<Sample>,
}

impl Batch {
    pub fn new(images: Array4<f32>, samples: Vec<Sample>) -> Result<Self, ExtractError> {
        if images.dim().0 != samples.len() {
            return Err(ExtractError::ShapeMismatch(format!(
                "图片批次大小为 {}，样本数量为 {}",
                images.dim().0,
                samples.len()
            )));
        }
        Ok(Self { images, samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn images(&self) -> &Array4<f32> {
        &self.images
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_parts(self) -> (Array4<f32>, Vec<Sample>) {
        (self.images, self.samples)
    }
}

/// 使用固定大小的线程池并行解码图片
pub struct ImageLoader {
    pool: rayon::ThreadPool,
    target_size: (usize, usize),
}

impl ImageLoader {
    pub fn new(num_workers: usize, target_size: (usize, usize)) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("image-loader-{i}"))
            .build()?;
        Ok(Self { pool, target_size })
    }

    pub fn load_batch(&self, dataset: &Dataset, indices: &[usize]) -> Result<Batch, ExtractError> {
        let samples = indices
            .iter()
            .map(|&pos| {
                dataset.get(pos).cloned().ok_or_else(|| {
                    ExtractError::Config(format!("样本位置 {pos} 超出数据集大小 {}", dataset.len()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let target_size = self.target_size;
        let images = self.pool.install(|| {
            samples
                .par_iter()
                .map(|sample| {
                    imread_rgb(Path::new(&sample.image_path), target_size)
                        .map_err(|source| ExtractError::ImageLoad { path: PathBuf::from(&sample.image_path), source })
                })
                .collect::<Vec<_>>()
        });
        let images = images.into_iter().collect::<Result<Vec<Array3<f32>>, _>>()?;

        let (h, w) = target_size;
        let images = if images.is_empty() {
            Array4::zeros((0, 3, h, w))
        } else {
            let views = images.iter().map(|im| im.view()).collect::<Vec<_>>();
            ndarray::stack(Axis(0), &views).map_err(|e| ExtractError::ShapeMismatch(e.to_string()))?
        };
        Batch::new(images, samples)
    }
}
