use log::{debug, info};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::dataset::Sample;
use crate::dist::ProcessGroup;
use crate::error::ExtractError;

/// 单个 worker 拼接后的结果，是 all-gather 交换的单位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalResult {
    pub rank: usize,
    pub dim: usize,
    /// 行优先的特征，大小为 samples.len() * dim
    pub features: Vec<f32>,
    pub samples: Vec<Sample>,
}

impl LocalResult {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 按 id 升序排列的全局结果，features 与 metadata 逐行对应
#[derive(Debug, Clone)]
pub struct GlobalResultSet {
    pub features: Array2<f32>,
    pub metadata: Vec<Sample>,
}

impl GlobalResultSet {
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.metadata.iter().map(|s| s.id)
    }
}

/// 与所有 worker 交换本地结果，返回按 rank 排列的全部结果
pub async fn exchange(group: &mut ProcessGroup, local: &LocalResult) -> anyhow::Result<Vec<LocalResult>> {
    let payload = bincode::serialize(local)?;
    debug!("rank {}: 本地结果 {} 条，编码后 {} 字节", group.rank(), local.len(), payload.len());
    let gathered = group.all_gather(payload).await?;

    gathered
        .iter()
        .enumerate()
        .map(|(slot, bytes)| -> anyhow::Result<LocalResult> {
            let part: LocalResult = bincode::deserialize(bytes)?;
            if part.rank != slot {
                return Err(ExtractError::ReconciliationIntegrity(format!(
                    "第 {slot} 个位置收到了 rank {} 的结果",
                    part.rank
                ))
                .into());
            }
            Ok(part)
        })
        .collect()
}

/// 按 rank 顺序拼接所有结果
pub fn concat_parts(parts: Vec<LocalResult>) -> Result<(Array2<f32>, Vec<Sample>), ExtractError> {
    let dim = parts.first().map(|p| p.dim).unwrap_or(0);
    let total = parts.iter().map(|p| p.len()).sum::<usize>();
    let mut features = Vec::with_capacity(total * dim);
    let mut samples = Vec::with_capacity(total);

    for part in parts {
        if part.dim != dim {
            return Err(ExtractError::ReconciliationIntegrity(format!(
                "rank {} 的特征维度为 {}，应为 {dim}",
                part.rank, part.dim
            )));
        }
        if part.features.len() != part.samples.len() * dim {
            return Err(ExtractError::ReconciliationIntegrity(format!(
                "rank {} 的特征数量 {} 与样本数量 {} 不一致",
                part.rank,
                part.features.len(),
                part.samples.len()
            )));
        }
        features.extend(part.features);
        samples.extend(part.samples);
    }

    let features = Array2::from_shape_vec((total, dim), features)
        .map_err(|e| ExtractError::ReconciliationIntegrity(e.to_string()))?;
    Ok((features, samples))
}

/// 计算按 id 升序排列的置换，并检查 id 唯一且数量等于数据集大小
pub fn canonical_order(samples: &[Sample], expected: usize) -> Result<Vec<usize>, ExtractError> {
    let mut order = (0..samples.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| samples[i].id);

    if let Some(w) = order.windows(2).find(|w| samples[w[0]].id == samples[w[1]].id) {
        return Err(ExtractError::ReconciliationIntegrity(format!("重复的样本 id: {}", samples[w[0]].id)));
    }
    if samples.len() != expected {
        return Err(ExtractError::ReconciliationIntegrity(format!(
            "收集到 {} 个样本，数据集共有 {expected} 个",
            samples.len()
        )));
    }
    Ok(order)
}

/// 合并所有 worker 的结果并按 id 排序
///
/// # Arguments
///
/// * `parts` - 按 rank 排列的各 worker 结果
/// * `expected` - 数据集样本总数
pub fn reconcile(parts: Vec<LocalResult>, expected: usize) -> Result<GlobalResultSet, ExtractError> {
    let (features, samples) = concat_parts(parts)?;
    let order = canonical_order(&samples, expected)?;

    let features = features.select(Axis(0), &order);
    let metadata = order.iter().map(|&i| samples[i].clone()).collect::<Vec<_>>();
    info!("合并完成，共 {} 个样本，特征维度 {}", metadata.len(), features.ncols());

    Ok(GlobalResultSet { features, metadata })
}
