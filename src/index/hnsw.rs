use std::io::{Read, Write};

use anyhow::{Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::ArrayView2;
use rayon::prelude::*;
use usearch::{IndexOptions, MetricKind, ScalarKind};

use super::{Metric, Neighbor, TopK, check_rows, read_bytes, write_bytes};

/// 基于 usearch 的 HNSW 图索引
pub struct HnswIndex {
    dim: usize,
    metric: Metric,
    connectivity: usize,
    index: usearch::Index,
}

impl HnswIndex {
    pub fn new(dim: usize, metric: Metric, connectivity: usize) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dim,
            metric: match metric {
                Metric::L2 => MetricKind::L2sq,
                // usearch 的内积距离为 1 - ip
                Metric::InnerProduct => MetricKind::IP,
            },
            quantization: ScalarKind::F32,
            connectivity,
            // 此处为 usearch 默认参数
            expansion_add: 128,
            expansion_search: 64,
            ..Default::default()
        };
        let index = usearch::Index::new(&options)?;
        Ok(Self { dim, metric, connectivity, index })
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn ntotal(&self) -> usize {
        self.index.size()
    }

    pub fn is_trained(&self) -> bool {
        true
    }

    pub fn add(&mut self, x: ArrayView2<f32>) -> Result<()> {
        let rows = check_rows(x, self.dim)?;
        if rows.is_empty() {
            return Ok(());
        }
        let start = self.ntotal();
        self.index.reserve(start + x.nrows())?;
        rows.par_chunks(self.dim).enumerate().try_for_each(|(i, v)| {
            self.index.add((start + i) as u64, v).map_err(|e| anyhow!("添加向量 {} 失败: {e}", start + i))
        })
    }

    pub fn search(&self, queries: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        let queries = check_rows(queries, self.dim)?;
        if self.dim == 0 {
            return Ok(vec![]);
        }
        queries
            .par_chunks(self.dim)
            .map(|q| {
                let mut topk = TopK::new(k);
                if k > 0 && self.ntotal() > 0 {
                    let matches = self.index.search(q, k)?;
                    for (key, distance) in matches.keys.into_iter().zip(matches.distances) {
                        let key_distance = match self.metric {
                            Metric::L2 => distance,
                            Metric::InnerProduct => distance - 1.0,
                        };
                        topk.push(key_distance, key as i64);
                    }
                }
                Ok(topk.into_neighbors(self.metric))
            })
            .collect()
    }

    pub(super) fn write_payload(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<LittleEndian>(self.connectivity as u64)?;
        let mut buf = vec![];
        if self.ntotal() > 0 {
            buf = vec![0u8; self.index.serialized_length()];
            self.index.save_to_buffer(&mut buf)?;
        }
        write_bytes(w, &buf)?;
        Ok(())
    }

    pub(super) fn read_payload(r: &mut impl Read, dim: usize, metric: Metric) -> Result<Self> {
        let connectivity = r.read_u64::<LittleEndian>()? as usize;
        let buf = read_bytes(r)?;
        let index = Self::new(dim, metric, connectivity)?;
        if !buf.is_empty() {
            index.index.load_from_buffer(&buf)?;
        }
        Ok(index)
    }
}
