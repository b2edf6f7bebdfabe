use std::io::{Read, Write};

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use ndarray::ArrayView2;
use rayon::prelude::*;

use super::{Metric, Neighbor, TopK, check_rows, read_f32s, read_i64s, write_f32s, write_i64s};
use crate::kmeans::{imbalance_factor, kmeans};

const KMEANS_MAX_ITER: usize = 20;

/// 倒排列表中向量的编码方式
pub trait IvfCodec: Send + Sync + Sized {
    type Code: Copy + Default + Send + Sync;
    /// 查询向量针对某个倒排列表预先计算的数据
    type Table;

    /// 单个向量编码后的长度
    fn code_size(&self) -> usize;

    fn is_trained(&self) -> bool;

    /// 训练编码器
    ///
    /// # Arguments
    ///
    /// * `x` - 训练向量
    /// * `centroids` - 粗聚类中心
    /// * `assignments` - 每个训练向量所属的倒排列表
    fn train(&mut self, x: ArrayView2<f32>, centroids: ArrayView2<f32>, assignments: &[usize], seed: u64) -> Result<()>;

    fn encode(&self, x: &[f32], centroid: &[f32], out: &mut [Self::Code]);

    fn table(&self, query: &[f32], centroid: &[f32], metric: Metric) -> Self::Table;

    /// 排序键，越小越相似
    fn distance(&self, table: &Self::Table, code: &[Self::Code]) -> f32;

    fn write(&self, w: &mut impl Write) -> Result<()>;

    fn read(r: &mut impl Read, dim: usize) -> Result<Self>;

    fn write_codes(w: &mut impl Write, codes: &[Self::Code]) -> std::io::Result<()>;

    fn read_codes(r: &mut impl Read) -> std::io::Result<Vec<Self::Code>>;
}

/// 直接保存原始向量
pub struct FlatCodec {
    dim: usize,
}

impl FlatCodec {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl IvfCodec for FlatCodec {
    type Code = f32;
    type Table = (Vec<f32>, Metric);

    fn code_size(&self) -> usize {
        self.dim
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn train(&mut self, _: ArrayView2<f32>, _: ArrayView2<f32>, _: &[usize], _: u64) -> Result<()> {
        Ok(())
    }

    fn encode(&self, x: &[f32], _centroid: &[f32], out: &mut [f32]) {
        out.copy_from_slice(x);
    }

    fn table(&self, query: &[f32], _centroid: &[f32], metric: Metric) -> Self::Table {
        (query.to_vec(), metric)
    }

    fn distance(&self, (query, metric): &Self::Table, code: &[f32]) -> f32 {
        metric.key(query, code)
    }

    fn write(&self, _: &mut impl Write) -> Result<()> {
        Ok(())
    }

    fn read(_: &mut impl Read, dim: usize) -> Result<Self> {
        Ok(Self::new(dim))
    }

    fn write_codes(w: &mut impl Write, codes: &[f32]) -> std::io::Result<()> {
        write_f32s(w, codes)
    }

    fn read_codes(r: &mut impl Read) -> std::io::Result<Vec<f32>> {
        read_f32s(r)
    }
}

/// 倒排列表，第 i 个列表保存分配到第 i 个聚类中心的向量
struct InvertedLists<T> {
    ids: Vec<Vec<i64>>,
    codes: Vec<Vec<T>>,
}

impl<T> InvertedLists<T> {
    fn new(nlist: usize) -> Self {
        Self { ids: (0..nlist).map(|_| vec![]).collect(), codes: (0..nlist).map(|_| vec![]).collect() }
    }

    fn len(&self) -> usize {
        self.ids.iter().map(Vec::len).sum()
    }
}

/// 倒排索引
pub struct IvfIndex<C: IvfCodec> {
    dim: usize,
    metric: Metric,
    /// 配置的倒排列表数量，训练数据不足时实际数量会更少
    nlist: usize,
    nprobe: usize,
    seed: u64,
    /// 粗聚类中心，行优先
    centroids: Option<Vec<f32>>,
    codec: C,
    lists: InvertedLists<C::Code>,
}

impl<C: IvfCodec> IvfIndex<C> {
    pub fn new(dim: usize, metric: Metric, nlist: usize, nprobe: usize, seed: u64, codec: C) -> Self {
        Self {
            dim,
            metric,
            nlist: nlist.max(1),
            nprobe: nprobe.max(1),
            seed,
            centroids: None,
            codec,
            lists: InvertedLists::new(0),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn ntotal(&self) -> usize {
        self.lists.len()
    }

    pub fn is_trained(&self) -> bool {
        self.centroids.is_some() && self.codec.is_trained()
    }

    /// 实际的倒排列表数量
    pub fn nlist(&self) -> usize {
        self.centroids.as_ref().map_or(0, |c| c.len() / self.dim.max(1))
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.nprobe = nprobe.max(1);
    }

    pub fn train(&mut self, x: ArrayView2<f32>) -> Result<()> {
        let rows = check_rows(x, self.dim)?;
        let n = x.nrows();
        if n == 0 {
            warn!("没有训练数据，跳过训练");
            return Ok(());
        }
        let nlist = if n < self.nlist {
            warn!("训练向量数量 {n} 少于 nlist = {}，nlist 调整为 {n}", self.nlist);
            n
        } else {
            self.nlist
        };

        let x = ArrayView2::from_shape((n, self.dim), &rows)?;
        let ks = kmeans(x, nlist, KMEANS_MAX_ITER, self.seed);
        info!("粗聚类完成，nlist = {nlist}，不平衡度 = {}", imbalance_factor(&ks.centroid_frequency));

        let centroids = ks.centroids.iter().copied().collect::<Vec<_>>();
        let assignments = rows.par_chunks(self.dim).map(|v| self.nearest(v, &centroids, 1)[0]).collect::<Vec<_>>();
        self.codec.train(x, ks.centroids.view(), &assignments, self.seed)?;

        self.lists = InvertedLists::new(ks.centroids.nrows());
        self.centroids = Some(centroids);
        Ok(())
    }

    /// 最相似的 n 个倒排列表，与搜索时的粗排使用相同的度量
    fn nearest(&self, v: &[f32], centroids: &[f32], n: usize) -> Vec<usize> {
        let mut topk = TopK::new(n);
        for (i, c) in centroids.chunks(self.dim).enumerate() {
            topk.push(self.metric.key(v, c), i as i64);
        }
        topk.into_sorted().into_iter().map(|(_, i)| i as usize).collect()
    }

    fn centroid<'a>(&self, centroids: &'a [f32], list: usize) -> &'a [f32] {
        &centroids[list * self.dim..(list + 1) * self.dim]
    }

    pub fn add(&mut self, x: ArrayView2<f32>) -> Result<()> {
        let rows = check_rows(x, self.dim)?;
        if rows.is_empty() {
            return Ok(());
        }
        let Some(centroids) = self.centroids.as_ref().filter(|_| self.codec.is_trained()) else {
            anyhow::bail!("索引尚未训练");
        };

        let code_size = self.codec.code_size();
        let encoded = rows
            .par_chunks(self.dim)
            .map(|v| {
                let list = self.nearest(v, centroids, 1)[0];
                let mut code = vec![C::Code::default(); code_size];
                self.codec.encode(v, self.centroid(centroids, list), &mut code);
                (list, code)
            })
            .collect::<Vec<_>>();

        let mut next = self.ntotal() as i64;
        for (list, code) in encoded {
            self.lists.ids[list].push(next);
            self.lists.codes[list].extend(code);
            next += 1;
        }
        Ok(())
    }

    pub fn search(&self, queries: ArrayView2<f32>, k: usize) -> Result<Vec<Vec<Neighbor>>> {
        let queries = check_rows(queries, self.dim)?;
        if self.dim == 0 {
            return Ok(vec![]);
        }
        let Some(centroids) = self.centroids.as_ref() else {
            return Ok(queries.chunks(self.dim).map(|_| vec![]).collect());
        };
        let nprobe = self.nprobe.min(self.nlist());
        let code_size = self.codec.code_size();

        let result = queries
            .par_chunks(self.dim)
            .map(|q| {
                let mut topk = TopK::new(k);
                for list in self.nearest(q, centroids, nprobe) {
                    let table = self.codec.table(q, self.centroid(centroids, list), self.metric);
                    let codes = self.lists.codes[list].chunks(code_size.max(1));
                    for (&id, code) in self.lists.ids[list].iter().zip(codes) {
                        topk.push(self.codec.distance(&table, code), id);
                    }
                }
                topk.into_neighbors(self.metric)
            })
            .collect();
        Ok(result)
    }

    pub(super) fn write_payload(&self, w: &mut impl Write) -> Result<()> {
        w.write_u64::<LittleEndian>(self.nlist as u64)?;
        w.write_u64::<LittleEndian>(self.nprobe as u64)?;
        w.write_u64::<LittleEndian>(self.seed)?;
        match &self.centroids {
            Some(centroids) => {
                w.write_u8(1)?;
                write_f32s(w, centroids)?;
            }
            None => w.write_u8(0)?,
        }
        self.codec.write(w)?;
        w.write_u64::<LittleEndian>(self.lists.ids.len() as u64)?;
        for (ids, codes) in self.lists.ids.iter().zip(&self.lists.codes) {
            write_i64s(w, ids)?;
            C::write_codes(w, codes)?;
        }
        Ok(())
    }

    pub(super) fn read_payload(r: &mut impl Read, dim: usize, metric: Metric) -> Result<Self> {
        let nlist = r.read_u64::<LittleEndian>()? as usize;
        let nprobe = r.read_u64::<LittleEndian>()? as usize;
        let seed = r.read_u64::<LittleEndian>()?;
        let centroids = match r.read_u8()? {
            0 => None,
            _ => {
                let data = read_f32s(r)?;
                anyhow::ensure!(dim > 0 && data.len() % dim == 0, "聚类中心数据长度不正确");
                Some(data)
            }
        };
        let codec = C::read(r, dim)?;

        let count = r.read_u64::<LittleEndian>()? as usize;
        let mut lists = InvertedLists::new(0);
        for _ in 0..count {
            let ids = read_i64s(r)?;
            let codes = C::read_codes(r)?;
            anyhow::ensure!(codes.len() == ids.len() * codec.code_size(), "倒排列表数据长度不正确");
            lists.ids.push(ids);
            lists.codes.push(codes);
        }

        let mut index = Self::new(dim, metric, nlist, nprobe, seed, codec);
        index.centroids = centroids;
        index.lists = lists;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rand::prelude::*;

    use super::*;
    use crate::index::ProductQuantizer;

    fn random_data(n: usize, d: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_simple_fn((n, d), || rng.random_range(-1.0f32..1.0))
    }

    #[test]
    fn test_ivf_flat_exact_match() {
        let data = random_data(200, 8, 1);
        let mut index = IvfIndex::new(8, Metric::L2, 10, 1, 42, FlatCodec::new(8));
        assert!(!index.is_trained());
        index.train(data.view()).unwrap();
        index.add(data.view()).unwrap();
        assert_eq!(index.ntotal(), 200);
        assert_eq!(index.nlist(), 10);

        let result = index.search(data.view(), 1).unwrap();
        for (i, neighbors) in result.iter().enumerate() {
            assert_eq!(neighbors[0].label, i as i64);
            assert!(neighbors[0].distance < 1e-6);
        }
    }

    #[test]
    fn test_ivf_nlist_clamped() {
        let data = random_data(5, 4, 2);
        let mut index = IvfIndex::new(4, Metric::L2, 100, 1, 0, FlatCodec::new(4));
        index.train(data.view()).unwrap();
        assert_eq!(index.nlist(), 5);
    }

    #[test]
    fn test_ivf_add_untrained_fails() {
        let data = random_data(3, 4, 3);
        let mut index = IvfIndex::new(4, Metric::L2, 2, 1, 0, FlatCodec::new(4));
        assert!(index.add(data.view()).is_err());
        index.add(Array2::zeros((0, 4)).view()).unwrap();
        assert!(index.search(data.view(), 3).unwrap().iter().all(Vec::is_empty));
    }

    #[test]
    fn test_ivf_full_probe_matches_flat() {
        let data = random_data(100, 4, 4);
        let mut index = IvfIndex::new(4, Metric::InnerProduct, 8, 8, 0, FlatCodec::new(4));
        index.train(data.view()).unwrap();
        index.add(data.view()).unwrap();

        let query = random_data(1, 4, 5);
        let result = index.search(query.view(), 3).unwrap();

        let mut ips = data.outer_iter().enumerate().map(|(i, v)| (v.dot(&query.row(0)), i as i64)).collect::<Vec<_>>();
        ips.sort_by(|a, b| b.0.total_cmp(&a.0));
        let expected = ips.iter().take(3).map(|&(_, i)| i).collect::<Vec<_>>();
        assert_eq!(result[0].iter().map(|n| n.label).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_ivf_pq_exact_match_small() {
        // 向量数量不超过码本大小时 PQ 编码无损
        let data = random_data(50, 8, 6);
        let pq = ProductQuantizer::new(8, 2, 8).unwrap();
        let mut index = IvfIndex::new(8, Metric::L2, 4, 1, 0, pq);
        index.train(data.view()).unwrap();
        index.add(data.view()).unwrap();

        let result = index.search(data.view(), 1).unwrap();
        for (i, neighbors) in result.iter().enumerate() {
            assert_eq!(neighbors[0].label, i as i64);
        }
    }

    #[test]
    fn test_ivf_payload_roundtrip() {
        let data = random_data(40, 4, 7);
        let pq = ProductQuantizer::new(4, 2, 4).unwrap();
        let mut index = IvfIndex::new(4, Metric::L2, 4, 2, 0, pq);
        index.train(data.view()).unwrap();
        index.add(data.view()).unwrap();

        let mut buf = vec![];
        index.write_payload(&mut buf).unwrap();
        let loaded = IvfIndex::<ProductQuantizer>::read_payload(&mut buf.as_slice(), 4, Metric::L2).unwrap();

        assert_eq!(loaded.ntotal(), 40);
        assert_eq!(loaded.nprobe(), 2);
        assert_eq!(loaded.search(data.view(), 3).unwrap(), index.search(data.view(), 3).unwrap());
    }
}
