use std::io::{Read, Write};

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use ndarray::{Array2, ArrayView2, s};
use rayon::prelude::*;

use super::ivf::IvfCodec;
use super::{Metric, read_bytes, read_f32s, write_bytes, write_f32s};
use crate::error::ExtractError;
use crate::kmeans::kmeans;

/// 乘积量化器，对 IVF 残差编码
///
/// 向量被切分为 m 个长度为 dsub 的子向量，每个子向量用 nbits 位的码本序号表示
pub struct ProductQuantizer {
    dim: usize,
    /// 子空间数量
    m: usize,
    /// 每个子空间的编码位数
    nbits: u32,
    dsub: usize,
    /// 实际训练得到的码本大小，不超过 2^nbits
    ksub: usize,
    /// 码本，按 (m, ksub, dsub) 排列
    centroids: Vec<f32>,
}

/// 一个查询向量在某个倒排列表上的距离表
pub struct PqTable {
    values: Vec<f32>,
    base: f32,
    metric: Metric,
}

impl ProductQuantizer {
    pub fn new(dim: usize, m: usize, nbits: u32) -> Result<Self, ExtractError> {
        if m == 0 || dim % m != 0 {
            return Err(ExtractError::Config(format!("PQ 子空间数量 M = {m} 必须整除维度 {dim}")));
        }
        if !(1..=8).contains(&nbits) {
            return Err(ExtractError::Config(format!("nbits = {nbits} 必须在 1 到 8 之间")));
        }
        Ok(Self { dim, m, nbits, dsub: dim / m, ksub: 0, centroids: vec![] })
    }

    pub fn ksub(&self) -> usize {
        self.ksub
    }

    /// 在残差上训练码本
    pub fn train_residuals(&mut self, residuals: ArrayView2<f32>, seed: u64) {
        let n = residuals.nrows();
        let ksub = (1usize << self.nbits).min(n);
        let dsub = self.dsub;
        let books = (0..self.m)
            .into_par_iter()
            .map(|j| {
                let sub = residuals.slice(s![.., j * dsub..(j + 1) * dsub]);
                kmeans(sub, ksub, 25, seed.wrapping_add(j as u64)).centroids
            })
            .collect::<Vec<Array2<f32>>>();

        self.ksub = ksub;
        self.centroids = books.iter().flat_map(|b| b.iter().copied()).collect();
        debug!("PQ 训练完成，M = {}，ksub = {ksub}", self.m);
    }

    fn centroid(&self, j: usize, k: usize) -> &[f32] {
        let start = (j * self.ksub + k) * self.dsub;
        &self.centroids[start..start + self.dsub]
    }

    /// 编码单个向量，out 长度为 m
    pub fn encode_vector(&self, x: &[f32], out: &mut [u8]) {
        for (j, code) in out.iter_mut().enumerate().take(self.m) {
            let sub = &x[j * self.dsub..(j + 1) * self.dsub];
            let mut best = (0, f32::INFINITY);
            for k in 0..self.ksub {
                let d = Metric::L2.key(sub, self.centroid(j, k));
                if d < best.1 {
                    best = (k, d);
                }
            }
            *code = best.0 as u8;
        }
    }

    /// 解码为近似向量
    pub fn decode_vector(&self, code: &[u8]) -> Vec<f32> {
        code.iter().enumerate().flat_map(|(j, &k)| self.centroid(j, k as usize).iter().copied()).collect()
    }
}

impl IvfCodec for ProductQuantizer {
    type Code = u8;
    type Table = PqTable;

    fn code_size(&self) -> usize {
        self.m
    }

    fn is_trained(&self) -> bool {
        self.ksub > 0
    }

    fn train(&mut self, x: ArrayView2<f32>, centroids: ArrayView2<f32>, assignments: &[usize], seed: u64) -> Result<()> {
        let mut residuals = x.to_owned();
        for (mut row, &list) in residuals.rows_mut().into_iter().zip(assignments) {
            row -= &centroids.row(list);
        }
        self.train_residuals(residuals.view(), seed);
        Ok(())
    }

    fn encode(&self, x: &[f32], centroid: &[f32], out: &mut [u8]) {
        let residual = x.iter().zip(centroid).map(|(a, b)| a - b).collect::<Vec<_>>();
        self.encode_vector(&residual, out);
    }

    fn table(&self, query: &[f32], centroid: &[f32], metric: Metric) -> PqTable {
        let mut values = vec![0.0; self.m * self.ksub];
        let base = match metric {
            Metric::L2 => {
                let residual = query.iter().zip(centroid).map(|(a, b)| a - b).collect::<Vec<_>>();
                for j in 0..self.m {
                    let sub = &residual[j * self.dsub..(j + 1) * self.dsub];
                    for k in 0..self.ksub {
                        values[j * self.ksub + k] = Metric::L2.key(sub, self.centroid(j, k));
                    }
                }
                0.0
            }
            Metric::InnerProduct => {
                for j in 0..self.m {
                    let sub = &query[j * self.dsub..(j + 1) * self.dsub];
                    for k in 0..self.ksub {
                        values[j * self.ksub + k] = -Metric::InnerProduct.key(sub, self.centroid(j, k));
                    }
                }
                -Metric::InnerProduct.key(query, centroid)
            }
        };
        PqTable { values, base, metric }
    }

    fn distance(&self, table: &PqTable, code: &[u8]) -> f32 {
        let sum = code.iter().enumerate().map(|(j, &k)| table.values[j * self.ksub + k as usize]).sum::<f32>();
        match table.metric {
            Metric::L2 => sum,
            Metric::InnerProduct => -(table.base + sum),
        }
    }

    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<LittleEndian>(self.m as u64)?;
        w.write_u32::<LittleEndian>(self.nbits)?;
        w.write_u64::<LittleEndian>(self.ksub as u64)?;
        write_f32s(w, &self.centroids)?;
        Ok(())
    }

    fn read(r: &mut impl Read, dim: usize) -> Result<Self> {
        let m = r.read_u64::<LittleEndian>()? as usize;
        let nbits = r.read_u32::<LittleEndian>()?;
        let ksub = r.read_u64::<LittleEndian>()? as usize;
        let centroids = read_f32s(r)?;
        let mut pq = Self::new(dim, m, nbits)?;
        anyhow::ensure!(centroids.len() == m * ksub * pq.dsub, "PQ 码本大小不正确");
        pq.ksub = ksub;
        pq.centroids = centroids;
        Ok(pq)
    }

    fn write_codes(w: &mut impl Write, codes: &[u8]) -> std::io::Result<()> {
        write_bytes(w, codes)
    }

    fn read_codes(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
        read_bytes(r)
    }
}
