use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{info, warn};
use ndarray::ArrayView2;

use crate::config::{IndexConfig, OutputDir, RunConfig};
use crate::error::ExtractError;
use crate::index::Index;
use crate::reconcile::GlobalResultSet;
use crate::utils::TimeMeasure;

/// 写入摘要所需的运行信息
pub struct SummaryContext<'a> {
    pub config: &'a RunConfig,
    pub model_key: &'a str,
    pub started: DateTime<Local>,
    /// 每个 rank 处理的样本数量
    pub rank_counts: Vec<usize>,
    pub timings: TimeMeasure,
}

/// 一次运行产生的文件
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub index: PathBuf,
    pub metadata: PathBuf,
    pub summary: PathBuf,
    pub features: Option<PathBuf>,
}

/// 在 rank 0 上构建并保存索引
pub struct IndexBuilder<'a> {
    config: &'a IndexConfig,
    output: OutputDir,
    seed: u64,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(config: &'a IndexConfig, output: OutputDir, seed: u64) -> Self {
        Self { config, output, seed }
    }

    /// 构建索引，需要训练的索引使用全部特征训练
    ///
    /// 没有任何特征时返回未训练的空索引
    pub fn build(&self, features: ArrayView2<f32>) -> Result<Index> {
        if features.nrows() > 0 && features.ncols() != self.config.dimension {
            return Err(ExtractError::IndexDimensionMismatch {
                expected: self.config.dimension,
                actual: features.ncols(),
            }
            .into());
        }

        let mut index = Index::new(self.config, self.seed)?;
        if features.nrows() == 0 {
            warn!("没有任何特征，保存空索引");
            return Ok(index);
        }
        if !index.is_trained() {
            info!("使用 {} 条向量训练索引", features.nrows());
            index.train(features)?;
        }
        index.add(features)?;
        info!("索引构建完成，共 {} 条向量", index.ntotal());
        Ok(index)
    }

    /// 构建索引并写入所有产物
    ///
    /// 所有文件先写入临时文件，全部成功后再重命名，失败时不会留下任何产物
    pub fn build_and_persist(&self, result: &GlobalResultSet, ctx: &SummaryContext) -> Result<Artifacts> {
        let index = self.build(result.features.view())?;

        fs::create_dir_all(self.output.path())
            .with_context(|| format!("无法创建输出目录 {}", self.output.path().display()))?;

        let artifacts = Artifacts {
            index: self.output.index(ctx.model_key),
            metadata: self.output.metadata(),
            summary: self.output.summary(),
            features: ctx.config.export_features.then(|| self.output.features()),
        };

        let mut staged = vec![];
        let written = self.stage(&index, result, ctx, &artifacts, &mut staged);
        if let Err(e) = written {
            for (tmp, _) in &staged {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }
        commit(&staged)?;

        info!("索引已保存到 {}", artifacts.index.display());
        info!("元数据已保存到 {}", artifacts.metadata.display());
        Ok(artifacts)
    }

    fn stage(
        &self,
        index: &Index,
        result: &GlobalResultSet,
        ctx: &SummaryContext,
        artifacts: &Artifacts,
        staged: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<()> {
        let tmp = staging_path(&artifacts.metadata);
        staged.push((tmp.clone(), artifacts.metadata.clone()));
        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut w, &result.metadata)?;
        w.flush()?;

        if let Some(path) = &artifacts.features {
            let tmp = staging_path(path);
            staged.push((tmp.clone(), path.clone()));
            ndarray_npy::write_npy(&tmp, &result.features).context("无法保存特征矩阵")?;
        }

        let tmp = staging_path(&artifacts.summary);
        staged.push((tmp.clone(), artifacts.summary.clone()));
        fs::write(&tmp, render_summary(ctx, result, index, Local::now()))?;

        let tmp = staging_path(&artifacts.index);
        staged.push((tmp.clone(), artifacts.index.clone()));
        let mut w = BufWriter::new(File::create(&tmp)?);
        index.write_to(&mut w).context("无法保存索引")?;
        w.flush()?;
        Ok(())
    }
}

/// 将临时文件重命名为最终产物，任一失败时删除已完成的产物和剩余的临时文件
fn commit(staged: &[(PathBuf, PathBuf)]) -> Result<()> {
    for (i, (tmp, path)) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(tmp, path) {
            for (_, done) in &staged[..i] {
                let _ = fs::remove_file(done);
            }
            for (pending, _) in &staged[i..] {
                let _ = fs::remove_file(pending);
            }
            return Err(e).with_context(|| format!("无法写入 {}", path.display()));
        }
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// 生成 processing_summary.txt 的内容
pub fn render_summary(ctx: &SummaryContext, result: &GlobalResultSet, index: &Index, finished: DateTime<Local>) -> String {
    let config = ctx.config;
    let elapsed = (finished - ctx.started).num_milliseconds() as f64 / 1000.0;
    let mut s = String::new();

    let _ = writeln!(s, "特征提取摘要");
    let _ = writeln!(s, "============");
    let _ = writeln!(s, "开始时间: {}", ctx.started.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(s, "结束时间: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(s, "总耗时: {elapsed:.2} 秒");
    let _ = writeln!(s, "样本总数: {}", result.len());
    let _ = writeln!(s, "特征维度: {}", config.index.dimension);
    let _ = writeln!(s, "模型: {}", ctx.model_key);
    let _ = writeln!(s, "索引类型: {} ({:?})", index.kind(), index.metric());
    let _ = writeln!(s, "索引向量数: {}", index.ntotal());
    let _ = writeln!(s, "批大小: {}", config.data.batch_size);
    let _ = writeln!(s, "加载线程数: {}", config.data.num_workers);
    let _ = writeln!(s, "分布式: {}", config.distributed);
    let _ = writeln!(s, "world_size: {}", ctx.rank_counts.len());
    let _ = writeln!(s);
    let _ = writeln!(s, "各 rank 样本数:");
    for (rank, count) in ctx.rank_counts.iter().enumerate() {
        let _ = writeln!(s, "  rank {rank}: {count}");
    }
    let _ = writeln!(s);
    let _ = writeln!(s, "各阶段耗时 (rank 0):");
    let _ = write!(s, "{}", ctx.timings);
    let _ = writeln!(s);
    let _ = writeln!(s, "配置:");
    let _ = writeln!(s, "{}", serde_json::to_string_pretty(config).unwrap_or_default());
    s
}
