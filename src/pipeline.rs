use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use log::{error, info};
use tokio::task::block_in_place;

use crate::batch::BatchProcessor;
use crate::builder::{Artifacts, IndexBuilder, SummaryContext};
use crate::config::{RunConfig, SelectedModel};
use crate::dataset::{Dataset, ImageLoader, Shard};
use crate::dist::ProcessGroup;
use crate::encoder::{Encoder, FeatureExtractor};
use crate::error::ExtractError;
use crate::mask::{MaskCompositor, SampleDumper};
use crate::reconcile::{GlobalResultSet, exchange, reconcile};
use crate::shard::ShardRunner;

/// 输入图片的通道数
const CHANNELS: usize = 3;

/// 一个 worker 的运行结果
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub rank: usize,
    /// 每个 worker 得到的全局结果都相同
    pub result: GlobalResultSet,
    /// 只有 rank 0 会写入产物
    pub artifacts: Option<Artifacts>,
}

/// 运行一个 worker 的完整流程
///
/// 失败时通知其他 worker 中止，无论成功与否都会销毁进程组
pub async fn run_extraction(config: &RunConfig, model: &SelectedModel, mut group: ProcessGroup) -> Result<ExtractionOutcome> {
    let result = extract(config, model, &mut group).await;
    if let Err(e) = &result {
        error!("rank {}: 提取失败: {e:#}", group.rank());
        group.abort(&format!("{e:#}")).await;
    }
    group.destroy().await;
    result
}

async fn extract(config: &RunConfig, model: &SelectedModel, group: &mut ProcessGroup) -> Result<ExtractionOutcome> {
    let started = Local::now();
    let (rank, world_size) = (group.rank(), group.world_size());
    let output = config.output();
    let target_size = config.data.target_size();

    let dataset = Dataset::open(&config.data.data_dir, &config.data.manifest)?;
    let shard = Shard::new(dataset.len(), world_size, rank)?;
    info!("rank {rank}/{world_size}: 数据集共 {} 个样本，模型 {}", dataset.len(), model.key);

    let encoder = Encoder::create(model, &config.index, CHANNELS, rank, config.seed)?;
    if encoder.dimension() != config.index.dimension {
        return Err(ExtractError::IndexDimensionMismatch {
            expected: config.index.dimension,
            actual: encoder.dimension(),
        }
        .into());
    }
    let dumper = match config.sample_images {
        0 => SampleDumper::disabled(),
        n => SampleDumper::spawn(output.sample_images(), rank, n),
    };
    let processor = BatchProcessor::new(encoder, MaskCompositor::new(config.mask_threshold), dumper, target_size);
    let loader = ImageLoader::new(config.data.num_workers, target_size)?;

    let mut runner = ShardRunner::new(&dataset, shard, config.data.batch_size, loader, processor);
    let log = block_in_place(|| runner.run());
    let mut timings = block_in_place(|| runner.finish());
    let log = log?;

    group.barrier().await.context("等待其他 worker 完成失败")?;

    let start = Instant::now();
    let parts = exchange(group, &log.flatten()).await?;
    timings.add("exchange", start.elapsed());
    let rank_counts = parts.iter().map(|p| p.len()).collect::<Vec<_>>();

    let start = Instant::now();
    let result = reconcile(parts, dataset.len())?;
    timings.add("reconcile", start.elapsed());

    let artifacts = if group.is_coordinator() {
        let ctx = SummaryContext { config, model_key: &model.key, started, rank_counts, timings };
        let builder = IndexBuilder::new(&config.index, output, config.seed);
        Some(block_in_place(|| builder.build_and_persist(&result, &ctx))?)
    } else {
        None
    };

    Ok(ExtractionOutcome { rank, result, artifacts })
}
