use std::io::{Read, Write};

use anyhow::Result;
use ndarray::ArrayView2;
use rayon::prelude::*;

use super::{Metric, Neighbor, TopK, check_rows, read_f32s, write_f32s};

/// 暴力搜索索引，结果精确
pub struct FlatIndex {
    dim: usize,
    metric: Metric,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self { dim, metric, data: vec![] }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn ntotal(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    pub fn is_trained(&self) -> bool {
        true
    }

    pub fn add(&mut self, x: ArrayView2<f32>) -> Result<()> {
        let rows = check_rows(x, self.dim)?;
        self.data.extend(rows);
        Ok(())
    }

    /// 获取第 i 个向量
    pub fn vector(&self, i: usize) -> Option<&[f32]> {
        self.data.get(i * self.dim..(i + 1) * self.dim)
    }

    pub fn search(&self, queries: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        let queries = check_rows(queries, self.dim)?;
        if self.dim == 0 {
            return Ok(vec![]);
        }
        let result = queries
            .par_chunks(self.dim)
            .map(|q| {
                let mut topk = TopK::new(k);
                for (label, v) in self.data.chunks(self.dim).enumerate() {
                    topk.push(self.metric.key(q, v), label as i64);
                }
                topk.into_neighbors(self.metric)
            })
            .collect();
        Ok(result)
    }

    pub(super) fn write_payload(&self, w: &mut impl Write) -> Result<()> {
        write_f32s(w, &self.data)?;
        Ok(())
    }

    pub(super) fn read_payload(r: &mut impl Read, dim: usize, metric: Metric) -> Result<Self> {
        let data = read_f32s(r)?;
        anyhow::ensure!(dim == 0 || data.len() % dim == 0, "索引数据长度 {} 不是维度 {dim} 的整数倍", data.len());
        Ok(Self { dim, metric, data })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_flat_exact_search() {
        let mut index = FlatIndex::new(2, Metric::L2);
        index.add(array![[0.0, 0.0], [1.0, 0.0], [5.0, 5.0]].view()).unwrap();
        assert_eq!(index.ntotal(), 3);
        assert_eq!(index.vector(1), Some(&[1.0f32, 0.0][..]));

        let result = index.search(array![[0.9, 0.1]].view(), 2).unwrap();
        assert_eq!(result[0].iter().map(|n| n.label).collect::<Vec<_>>(), vec![1, 0]);
        assert!((result[0][0].distance - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_flat_inner_product() {
        let mut index = FlatIndex::new(2, Metric::InnerProduct);
        index.add(array![[1.0, 0.0], [0.0, 1.0], [2.0, 2.0]].view()).unwrap();
        let result = index.search(array![[1.0, 0.0]].view(), 3).unwrap();
        assert_eq!(result[0][0], Neighbor { label: 2, distance: 2.0 });
        assert_eq!(result[0].len(), 3);
    }

    #[test]
    fn test_flat_dimension_mismatch() {
        let mut index = FlatIndex::new(3, Metric::L2);
        let err = index.add(array![[1.0, 2.0]].view()).unwrap_err();
        assert!(err.downcast_ref::<crate::error::ExtractError>().is_some());
    }
}
