mod flat;
mod hnsw;
mod ivf;
mod pq;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
pub use flat::FlatIndex;
pub use hnsw::HnswIndex;
pub use ivf::{FlatCodec, IvfCodec, IvfIndex};
use log::{info, warn};
use ndarray::ArrayView2;
pub use pq::ProductQuantizer;
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::error::ExtractError;

pub const DEFAULT_NLIST: usize = 100;
pub const DEFAULT_NPROBE: usize = 1;
pub const DEFAULT_PQ_M: usize = 8;
pub const DEFAULT_PQ_NBITS: u32 = 8;
pub const DEFAULT_HNSW_M: usize = 32;

const MAGIC: &[u8; 4] = b"MFIX";
const VERSION: u32 = 1;

/// 索引类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    #[serde(rename = "Flat", alias = "FLAT", alias = "flat")]
    Flat,
    #[serde(rename = "IVFFlat", alias = "IVF_FLAT", alias = "ivfflat")]
    IvfFlat,
    #[serde(rename = "IVFPQ", alias = "IVF_PQ", alias = "ivfpq")]
    IvfPq,
    #[serde(rename = "HNSW", alias = "hnsw")]
    Hnsw,
}

impl IndexKind {
    fn tag(self) -> u8 {
        match self {
            Self::Flat => 0,
            Self::IvfFlat => 1,
            Self::IvfPq => 2,
            Self::Hnsw => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Flat,
            1 => Self::IvfFlat,
            2 => Self::IvfPq,
            3 => Self::Hnsw,
            _ => bail!("未知的索引类型: {tag}"),
        })
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flat => "Flat",
            Self::IvfFlat => "IVFFlat",
            Self::IvfPq => "IVFPQ",
            Self::Hnsw => "HNSW",
        };
        f.write_str(name)
    }
}

/// 距离度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Metric {
    /// 平方欧氏距离，越小越相似
    #[default]
    #[serde(rename = "L2", alias = "l2")]
    L2,
    /// 内积，越大越相似
    #[serde(rename = "IP", alias = "ip", alias = "INNER_PRODUCT")]
    InnerProduct,
}

impl Metric {
    /// 排序用的键，越小越相似
    pub fn key(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }

    /// 将排序键转换为对外报告的距离
    pub fn to_distance(self, key: f32) -> f32 {
        match self {
            Self::L2 => key,
            Self::InnerProduct => -key,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::L2 => 0,
            Self::InnerProduct => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::L2,
            1 => Self::InnerProduct,
            _ => bail!("未知的距离度量: {tag}"),
        })
    }
}

/// 搜索结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    /// 向量在索引中的行号
    pub label: i64,
    /// L2 为平方距离，IP 为内积
    pub distance: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: f32,
    label: i64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.total_cmp(&other.key).then(self.label.cmp(&other.label))
    }
}

/// 保留键最小的 k 个候选
pub(crate) struct TopK {
    heap: BinaryHeap<Candidate>,
    k: usize,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self { heap: BinaryHeap::with_capacity(k + 1), k }
    }

    pub fn push(&mut self, key: f32, label: i64) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate { key, label };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|top| candidate < *top) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    pub fn into_neighbors(self, metric: Metric) -> Vec<Neighbor> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor { label: c.label, distance: metric.to_distance(c.key) })
            .collect()
    }

    /// 按键升序返回 (键, 标签)
    pub fn into_sorted(self) -> Vec<(f32, i64)> {
        self.heap.into_sorted_vec().into_iter().map(|c| (c.key, c.label)).collect()
    }
}

/// 检查输入矩阵的维度，返回行优先的数据
pub(crate) fn check_rows(x: ArrayView2<f32>, dim: usize) -> Result<Vec<f32>, ExtractError> {
    if x.ncols() != dim {
        return Err(ExtractError::IndexDimensionMismatch { expected: dim, actual: x.ncols() });
    }
    Ok(x.iter().copied().collect())
}

pub(crate) fn write_f32s(w: &mut impl Write, data: &[f32]) -> std::io::Result<()> {
    w.write_u64::<LittleEndian>(data.len() as u64)?;
    if cfg!(target_endian = "little") {
        w.write_all(bytemuck::cast_slice(data))
    } else {
        data.iter().try_for_each(|v| w.write_f32::<LittleEndian>(*v))
    }
}

pub(crate) fn read_f32s(r: &mut impl Read) -> std::io::Result<Vec<f32>> {
    let n = r.read_u64::<LittleEndian>()? as usize;
    let mut data = vec![0f32; n];
    r.read_f32_into::<LittleEndian>(&mut data)?;
    Ok(data)
}

pub(crate) fn write_i64s(w: &mut impl Write, data: &[i64]) -> std::io::Result<()> {
    w.write_u64::<LittleEndian>(data.len() as u64)?;
    data.iter().try_for_each(|v| w.write_i64::<LittleEndian>(*v))
}

pub(crate) fn read_i64s(r: &mut impl Read) -> std::io::Result<Vec<i64>> {
    let n = r.read_u64::<LittleEndian>()? as usize;
    let mut data = vec![0i64; n];
    r.read_i64_into::<LittleEndian>(&mut data)?;
    Ok(data)
}

pub(crate) fn write_bytes(w: &mut impl Write, data: &[u8]) -> std::io::Result<()> {
    w.write_u64::<LittleEndian>(data.len() as u64)?;
    w.write_all(data)
}

pub(crate) fn read_bytes(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let n = r.read_u64::<LittleEndian>()? as usize;
    let mut data = vec![0u8; n];
    r.read_exact(&mut data)?;
    Ok(data)
}

/// 向量索引
pub enum Index {
    Flat(FlatIndex),
    IvfFlat(IvfIndex<FlatCodec>),
    IvfPq(IvfIndex<ProductQuantizer>),
    Hnsw(HnswIndex),
}

macro_rules! dispatch {
    ($self:expr, $index:ident => $body:expr) => {
        match $self {
            Index::Flat($index) => $body,
            Index::IvfFlat($index) => $body,
            Index::IvfPq($index) => $body,
            Index::Hnsw($index) => $body,
        }
    };
}

impl Index {
    /// 根据配置创建一个空索引
    pub fn new(config: &IndexConfig, seed: u64) -> Result<Self> {
        if config.use_gpu {
            warn!("GPU 索引不可用，使用 CPU 构建索引 (device = {})", config.device);
        }
        let dim = config.dimension;
        let nlist = config.nlist.unwrap_or(DEFAULT_NLIST);
        let nprobe = config.nprobe.unwrap_or(DEFAULT_NPROBE);
        let index = match config.index_type {
            IndexKind::Flat => Self::Flat(FlatIndex::new(dim, config.metric)),
            IndexKind::IvfFlat => {
                Self::IvfFlat(IvfIndex::new(dim, config.metric, nlist, nprobe, seed, FlatCodec::new(dim)))
            }
            IndexKind::IvfPq => {
                let m = config.m.unwrap_or(DEFAULT_PQ_M);
                let nbits = config.nbits.unwrap_or(DEFAULT_PQ_NBITS);
                let pq = ProductQuantizer::new(dim, m, nbits)?;
                Self::IvfPq(IvfIndex::new(dim, config.metric, nlist, nprobe, seed, pq))
            }
            IndexKind::Hnsw => {
                Self::Hnsw(HnswIndex::new(dim, config.metric, config.m.unwrap_or(DEFAULT_HNSW_M))?)
            }
        };
        info!("创建 {} 索引，维度 = {dim}，度量 = {:?}", index.kind(), config.metric);
        Ok(index)
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Flat(_) => IndexKind::Flat,
            Self::IvfFlat(_) => IndexKind::IvfFlat,
            Self::IvfPq(_) => IndexKind::IvfPq,
            Self::Hnsw(_) => IndexKind::Hnsw,
        }
    }

    pub fn metric(&self) -> Metric {
        dispatch!(self, index => index.metric())
    }

    /// 向量维数
    pub fn dimension(&self) -> usize {
        dispatch!(self, index => index.dimension())
    }

    /// 该索引中的向量数量
    pub fn ntotal(&self) -> usize {
        dispatch!(self, index => index.ntotal())
    }

    /// 该索引是否已经训练
    pub fn is_trained(&self) -> bool {
        dispatch!(self, index => index.is_trained())
    }

    /// 训练索引，不需要训练的索引直接返回
    pub fn train(&mut self, x: ArrayView2<f32>) -> Result<()> {
        match self {
            Self::IvfFlat(index) => index.train(x),
            Self::IvfPq(index) => index.train(x),
            Self::Flat(_) | Self::Hnsw(_) => Ok(()),
        }
    }

    /// 添加若干条向量到索引中，行号从当前的 ntotal 开始编号
    ///
    /// # Arguments
    ///
    /// * `x` - 向量，大小为 (n, d)
    pub fn add(&mut self, x: ArrayView2<f32>) -> Result<()> {
        dispatch!(self, index => index.add(x))
    }

    /// 批量搜索，对每个查询向量返回至多 k 个最近邻，按相似度从高到低排列
    pub fn search(&self, queries: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        dispatch!(self, index => index.search(queries, k))
    }

    /// 设置 IVF 索引搜索时访问的倒排列表数量
    pub fn set_nprobe(&mut self, nprobe: usize) {
        match self {
            Self::IvfFlat(index) => index.set_nprobe(nprobe),
            Self::IvfPq(index) => index.set_nprobe(nprobe),
            Self::Flat(_) | Self::Hnsw(_) => {}
        }
    }

    /// 写入文件头与索引数据
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        w.write_u8(self.kind().tag())?;
        w.write_u8(self.metric().tag())?;
        w.write_u64::<LittleEndian>(self.dimension() as u64)?;
        dispatch!(self, index => index.write_payload(w))?;
        Ok(())
    }

    /// 将索引写入到文件，考虑到中途打断的情况，使用临时文件写入再重命名
    pub fn write_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let written = File::create(&tmp_path)
            .with_context(|| format!("无法创建 {}", tmp_path.display()))
            .and_then(|f| {
                let mut w = BufWriter::new(f);
                self.write_to(&mut w)?;
                w.flush()?;
                Ok(())
            })
            .and_then(|_| Ok(std::fs::rename(&tmp_path, path)?));
        if written.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        written
    }

    /// 从文件加载索引
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut r = BufReader::new(File::open(path).with_context(|| format!("无法打开索引 {}", path.display()))?);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            bail!("{} 不是索引文件", path.display());
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != VERSION {
            bail!("不支持的索引版本: {version}");
        }
        let kind = IndexKind::from_tag(r.read_u8()?)?;
        let metric = Metric::from_tag(r.read_u8()?)?;
        let dim = r.read_u64::<LittleEndian>()? as usize;

        let index = match kind {
            IndexKind::Flat => Self::Flat(FlatIndex::read_payload(&mut r, dim, metric)?),
            IndexKind::IvfFlat => Self::IvfFlat(IvfIndex::read_payload(&mut r, dim, metric)?),
            IndexKind::IvfPq => Self::IvfPq(IvfIndex::read_payload(&mut r, dim, metric)?),
            IndexKind::Hnsw => Self::Hnsw(HnswIndex::read_payload(&mut r, dim, metric)?),
        };
        Ok(index)
    }
}
