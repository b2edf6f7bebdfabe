use indicatif::ProgressBar;
use log::{error, info};
use ndarray::Array2;

use crate::batch::BatchProcessor;
use crate::dataset::{Dataset, ImageLoader, Sample, Shard};
use crate::error::ExtractError;
use crate::reconcile::LocalResult;
use crate::utils::{TimeMeasure, pb_style};

/// 一个批次的处理结果
#[derive(Debug, Clone)]
struct LogEntry {
    /// 大小为 (B, D)
    features: Array2<f32>,
    samples: Vec<Sample>,
}

/// worker 本地按处理顺序追加的结果
#[derive(Debug, Clone)]
pub struct WorkerLog {
    rank: usize,
    dim: usize,
    entries: Vec<LogEntry>,
}

impl WorkerLog {
    pub fn new(rank: usize, dim: usize) -> Self {
        Self { rank, dim, entries: vec![] }
    }

    pub fn push(&mut self, features: Array2<f32>, samples: Vec<Sample>) -> Result<(), ExtractError> {
        if features.nrows() != samples.len() || features.ncols() != self.dim {
            return Err(ExtractError::ShapeMismatch(format!(
                "批次特征形状为 {:?}，样本数量为 {}，特征维度应为 {}",
                features.dim(),
                samples.len(),
                self.dim
            )));
        }
        self.entries.push(LogEntry { features, samples });
        Ok(())
    }

    pub fn num_batches(&self) -> usize {
        self.entries.len()
    }

    /// 样本总数
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按批次顺序拼接为一段连续的特征和样本列表
    pub fn flatten(self) -> LocalResult {
        let total = self.len();
        let mut features = Vec::with_capacity(total * self.dim);
        let mut samples = Vec::with_capacity(total);
        for entry in self.entries {
            features.extend(entry.features.iter().copied());
            samples.extend(entry.samples);
        }
        LocalResult { rank: self.rank, dim: self.dim, features, samples }
    }
}

/// 负责一个 worker 对其分片的完整处理
pub struct ShardRunner<'a> {
    dataset: &'a Dataset,
    shard: Shard,
    batch_size: usize,
    loader: ImageLoader,
    processor: BatchProcessor,
    timings: TimeMeasure,
}

impl<'a> ShardRunner<'a> {
    pub fn new(
        dataset: &'a Dataset,
        shard: Shard,
        batch_size: usize,
        loader: ImageLoader,
        processor: BatchProcessor,
    ) -> Self {
        Self { dataset, shard, batch_size, loader, processor, timings: TimeMeasure::new() }
    }

    /// 依次处理分片中的所有批次，任何一个批次失败都会终止
    pub fn run(&mut self) -> anyhow::Result<WorkerLog> {
        let rank = self.shard.rank();
        let mut log = WorkerLog::new(rank, self.processor.dimension());
        let nbatches = self.shard.len().div_ceil(self.batch_size.max(1));
        info!("rank {rank}/{}: 分配到 {} 个样本，共 {nbatches} 个批次", self.shard.world_size(), self.shard.len());

        let pb = ProgressBar::new(nbatches as u64).with_style(pb_style());
        pb.set_prefix(format!("rank{rank}"));

        for (batch_idx, indices) in self.shard.batches(self.batch_size).enumerate() {
            let (loader, dataset) = (&self.loader, self.dataset);
            let result = self
                .timings
                .measure("load", || loader.load_batch(dataset, indices))
                .map_err(anyhow::Error::from)
                .and_then(|batch| self.processor.process(batch));

            match result {
                Ok((features, samples)) => log.push(features, samples)?,
                Err(e) => {
                    error!("rank {rank}: 处理第 {batch_idx} 个批次失败: {e:#}");
                    pb.abandon();
                    return Err(e.context(format!("rank {rank} 处理第 {batch_idx} 个批次失败")));
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!("rank {rank}: 完成 {} 个批次，共 {} 个样本", log.num_batches(), log.len());
        Ok(log)
    }

    /// 结束处理，返回加载与批处理的计时信息
    pub fn finish(self) -> TimeMeasure {
        let mut timings = self.timings;
        timings.merge(&self.processor.finish());
        timings
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn sample(id: u64) -> Sample {
        Sample {
            id,
            object_name: String::new(),
            data_dir: String::new(),
            image_path: String::new(),
            mask_path: String::new(),
            dataset_type: "default".into(),
        }
    }

    #[test]
    fn test_flatten_preserves_batch_order() {
        let mut log = WorkerLog::new(1, 2);
        log.push(array![[1.0, 2.0], [3.0, 4.0]], vec![sample(7), sample(3)]).unwrap();
        log.push(array![[5.0, 6.0]], vec![sample(1)]).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.num_batches(), 2);

        let local = log.flatten();
        assert_eq!(local.rank, 1);
        assert_eq!(local.features, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(local.samples.iter().map(|s| s.id).collect::<Vec<_>>(), vec![7, 3, 1]);
    }

    #[test]
    fn test_runner_processes_shard_in_order() {
        use image::{GrayImage, Luma, Rgb, RgbImage};

        use crate::encoder::{Encoder, ProjectionEncoder};
        use crate::mask::{MaskCompositor, SampleDumper};

        let dir = tempfile::tempdir().unwrap();
        let samples = (0..5u64)
            .map(|id| {
                let image = dir.path().join(format!("{id}.png"));
                let mask = dir.path().join(format!("{id}_mask.png"));
                RgbImage::from_pixel(4, 4, Rgb([id as u8 * 40, 10, 200])).save(&image).unwrap();
                GrayImage::from_pixel(4, 4, Luma([255])).save(&mask).unwrap();
                Sample {
                    image_path: image.to_string_lossy().into_owned(),
                    mask_path: mask.to_string_lossy().into_owned(),
                    ..sample(id)
                }
            })
            .collect::<Vec<_>>();
        let dataset = Dataset::from_samples(samples);

        let encoder = Encoder::Projection(ProjectionEncoder::new(3, 8, 1));
        let processor = BatchProcessor::new(encoder, MaskCompositor::default(), SampleDumper::disabled(), (4, 4));
        let loader = ImageLoader::new(2, (4, 4)).unwrap();
        let mut runner = ShardRunner::new(&dataset, Shard::new(5, 2, 0).unwrap(), 2, loader, processor);

        let local = runner.run().unwrap().flatten();
        assert_eq!(local.samples.iter().map(|s| s.id).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(local.features.len(), 3 * 8);

        // 加载耗时与批处理耗时合并在一起
        let timings = runner.finish();
        assert!(timings.get("load").is_some());
        assert!(timings.get("encode").is_some());
    }

    #[test]
    fn test_push_rejects_misaligned_batch() {
        let mut log = WorkerLog::new(0, 2);
        assert!(log.push(array![[1.0, 2.0]], vec![sample(0), sample(1)]).is_err());
        assert!(log.push(array![[1.0, 2.0, 3.0]], vec![sample(0)]).is_err());
        assert!(log.is_empty());
    }
}
