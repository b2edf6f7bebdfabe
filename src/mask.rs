use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError, bounded};
use log::{debug, info, warn};
use ndarray::{Array, Array3, Array4, ArrayBase, ArrayView4, ArrayViewD, Axis, Data, Dimension, Ix4};

use crate::error::ExtractError;
use crate::utils::imwrite_chw;

pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// 二值化：大于阈值为 1，否则为 0
pub fn binarize<S, D>(mask: &ArrayBase<S, D>, threshold: f32) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    mask.mapv(|v| if v > threshold { 1.0 } else { 0.0 })
}

/// 将二值化后的掩码应用到图片上
#[derive(Debug, Clone, Copy)]
pub struct MaskCompositor {
    threshold: f32,
}

impl Default for MaskCompositor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl MaskCompositor {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// 对图片批次应用掩码
    ///
    /// # Arguments
    ///
    /// * `images` - 图片，大小为 (B, C, H, W)
    /// * `masks` - 掩码，大小为 (B, H, W) 或 (B, 1, H, W) 或 (B, C, H, W)
    pub fn compose(&self, images: ArrayView4<f32>, masks: ArrayViewD<f32>) -> Result<Array4<f32>, ExtractError> {
        let binary = binarize(&masks, self.threshold);
        let binary = match binary.ndim() {
            3 => binary.insert_axis(Axis(1)),
            4 => binary,
            n => return Err(ExtractError::ShapeMismatch(format!("掩码维数应为 3 或 4，实际为 {n}"))),
        };
        let binary = binary
            .into_dimensionality::<Ix4>()
            .map_err(|e| ExtractError::ShapeMismatch(e.to_string()))?;

        if binary.dim().0 != images.dim().0 {
            return Err(ExtractError::ShapeMismatch(format!(
                "掩码批次大小为 {}，图片批次大小为 {}",
                binary.dim().0,
                images.dim().0
            )));
        }
        let broadcast = binary.broadcast(images.raw_dim()).ok_or_else(|| {
            ExtractError::ShapeMismatch(format!("掩码 {:?} 无法广播到图片 {:?}", binary.dim(), images.dim()))
        })?;

        Ok(&images * &broadcast)
    }
}

struct DumpJob {
    originals: Vec<Array3<f32>>,
    masked: Vec<Array3<f32>>,
}

/// 在后台线程中保存少量原图和掩码后的图片，用于人工检查
///
/// 只保存第一次提交的批次，任何失败都只记录警告
pub struct SampleDumper {
    tx: Option<Sender<DumpJob>>,
    handle: Option<JoinHandle<()>>,
    limit: usize,
    submitted: AtomicBool,
}

impl SampleDumper {
    pub fn disabled() -> Self {
        Self { tx: None, handle: None, limit: 0, submitted: AtomicBool::new(true) }
    }

    pub fn spawn(dir: PathBuf, rank: usize, limit: usize) -> Self {
        if limit == 0 {
            return Self::disabled();
        }
        let (tx, rx) = bounded::<DumpJob>(1);
        let handle = std::thread::Builder::new().name(format!("sample-dumper-{rank}")).spawn(move || {
            for job in rx {
                write_samples(&dir, rank, &job);
            }
        });
        match handle {
            Ok(handle) => Self { tx: Some(tx), handle: Some(handle), limit, submitted: AtomicBool::new(false) },
            Err(e) => {
                warn!("无法启动示例图片保存线程: {e}");
                Self::disabled()
            }
        }
    }

    /// 提交一批图片，不会阻塞
    pub fn offer(&self, originals: ArrayView4<f32>, masked: ArrayView4<f32>) {
        let Some(tx) = &self.tx else { return };
        if self.submitted.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.limit.min(originals.dim().0).min(masked.dim().0);
        let job = DumpJob {
            originals: (0..n).map(|i| originals.index_axis(Axis(0), i).to_owned()).collect(),
            masked: (0..n).map(|i| masked.index_axis(Axis(0), i).to_owned()).collect(),
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("示例图片队列已满，跳过"),
            Err(TrySendError::Disconnected(_)) => warn!("示例图片保存线程已退出"),
        }
    }

    /// 等待后台线程写完
    pub fn finish(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("示例图片保存线程异常退出");
            }
        }
    }
}

fn write_samples(dir: &std::path::Path, rank: usize, job: &DumpJob) {
    let original_dir = dir.join("original");
    let masked_dir = dir.join("masked");
    for d in [&original_dir, &masked_dir] {
        if let Err(e) = fs::create_dir_all(d) {
            warn!("无法创建示例图片目录 {}: {e}", d.display());
            return;
        }
    }
    for (i, (original, masked)) in job.originals.iter().zip(&job.masked).enumerate() {
        let original_path = original_dir.join(format!("original_rank{rank}_{i}.png"));
        let masked_path = masked_dir.join(format!("masked_rank{rank}_{i}.png"));
        if let Err(e) = imwrite_chw(original.view(), &original_path) {
            warn!("无法保存示例图片 {}: {e}", original_path.display());
        }
        if let Err(e) = imwrite_chw(masked.view(), &masked_path) {
            warn!("无法保存示例图片 {}: {e}", masked_path.display());
        }
    }
    info!("已保存 {} 组示例图片到 {}", job.originals.len(), dir.display());
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, array};

    use super::*;

    #[test]
    fn test_binarize_threshold_is_strict() {
        let mask: Array1<f32> = array![0.2, 0.6, 0.5, 0.9];
        assert_eq!(binarize(&mask, 0.5), array![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_compose_broadcasts_channels() {
        let images = Array4::<f32>::from_elem((2, 3, 2, 2), 2.0);
        let mask: Array2<f32> = array![[0.9, 0.1], [0.5, 0.51]];
        let masks = ndarray::stack(Axis(0), &[mask.view(), mask.view()]).unwrap();

        let masked = MaskCompositor::default().compose(images.view(), masks.view().into_dyn()).unwrap();
        assert_eq!(masked.dim(), (2, 3, 2, 2));
        for b in 0..2 {
            for c in 0..3 {
                assert_eq!(masked[[b, c, 0, 0]], 2.0);
                assert_eq!(masked[[b, c, 0, 1]], 0.0);
                assert_eq!(masked[[b, c, 1, 0]], 0.0);
                assert_eq!(masked[[b, c, 1, 1]], 2.0);
            }
        }
    }

    #[test]
    fn test_compose_accepts_channel_mask() {
        let images = Array4::<f32>::ones((1, 3, 2, 2));
        let masks = Array4::<f32>::ones((1, 1, 2, 2));
        let masked = MaskCompositor::new(0.0).compose(images.view(), masks.view().into_dyn()).unwrap();
        assert_eq!(masked, images);
    }

    #[test]
    fn test_compose_batch_mismatch() {
        let images = Array4::<f32>::ones((2, 3, 2, 2));
        let masks = Array4::<f32>::ones((3, 1, 2, 2));
        let err = MaskCompositor::default().compose(images.view(), masks.view().into_dyn());
        assert!(matches!(err, Err(ExtractError::ShapeMismatch(_))));
    }

    #[test]
    fn test_compose_not_broadcastable() {
        let images = Array4::<f32>::ones((1, 3, 4, 4));
        let masks = Array4::<f32>::ones((1, 1, 2, 2));
        let err = MaskCompositor::default().compose(images.view(), masks.view().into_dyn());
        assert!(matches!(err, Err(ExtractError::ShapeMismatch(_))));
    }

    #[test]
    fn test_compose_bad_rank() {
        let images = Array4::<f32>::ones((1, 3, 2, 2));
        let masks = Array2::<f32>::ones((2, 2));
        let err = MaskCompositor::default().compose(images.view(), masks.view().into_dyn());
        assert!(matches!(err, Err(ExtractError::ShapeMismatch(_))));
    }

    #[test]
    fn test_dumper_writes_first_batch_only() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = SampleDumper::spawn(dir.path().to_path_buf(), 1, 2);
        let images = Array4::<f32>::from_shape_fn((3, 3, 4, 4), |(b, c, h, w)| (b + c + h + w) as f32);
        dumper.offer(images.view(), images.view());
        dumper.offer(images.view(), images.view());
        dumper.finish();

        let originals = fs::read_dir(dir.path().join("original")).unwrap().count();
        let masked = fs::read_dir(dir.path().join("masked")).unwrap().count();
        assert_eq!(originals, 2);
        assert_eq!(masked, 2);
    }

    #[test]
    fn test_dumper_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = SampleDumper::spawn(dir.path().to_path_buf(), 0, 0);
        let images = Array4::<f32>::ones((1, 3, 2, 2));
        dumper.offer(images.view(), images.view());
        dumper.finish();
        assert!(!dir.path().join("original").exists());
    }
}
