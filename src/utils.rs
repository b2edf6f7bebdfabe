use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::{ImageError, ImageReader, Rgb, RgbImage};
use indicatif::ProgressStyle;
use ndarray::{Array2, Array3, ArrayView3};

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg} ({eta})",
    )
    .expect("进度条模板无效")
    .progress_chars("##-")
}

/// 按名称累计各阶段的耗时
#[derive(Debug, Clone, Default)]
pub struct TimeMeasure(pub BTreeMap<String, Duration>);

impl TimeMeasure {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn measure<F, R>(&mut self, key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let r = f();
        self.add(key, start.elapsed());
        r
    }

    pub fn add(&mut self, key: &str, elapsed: Duration) {
        *self.0.entry(key.to_owned()).or_default() += elapsed;
    }

    /// 合并另一组计时结果
    pub fn merge(&mut self, other: &TimeMeasure) {
        for (key, elapsed) in &other.0 {
            self.add(key, *elapsed);
        }
    }

    pub fn get(&self, key: &str) -> Option<Duration> {
        self.0.get(key).copied()
    }
}

impl fmt::Display for TimeMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, elapsed) in &self.0 {
            writeln!(f, "  {key}: {:.2}s", elapsed.as_secs_f64())?;
        }
        Ok(())
    }
}

/// 读取 RGB 图片，缩放到 (height, width)，返回 CHW 排列、取值 [0, 1] 的张量
pub fn imread_rgb(path: &Path, (height, width): (usize, usize)) -> Result<Array3<f32>, ImageError> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let img = img.resize_exact(width as u32, height as u32, FilterType::Triangle).to_rgb8();
    let mut output = Array3::zeros((3, height, width));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            output[[c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(output)
}

/// 读取单通道图片（掩码），缩放到 (height, width)，取值 [0, 1]
pub fn imread_gray(path: &Path, (height, width): (usize, usize)) -> Result<Array2<f32>, ImageError> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let img = img.resize_exact(width as u32, height as u32, FilterType::Triangle).to_luma8();
    let mut output = Array2::zeros((height, width));
    for (x, y, pixel) in img.enumerate_pixels() {
        output[[y as usize, x as usize]] = pixel[0] as f32 / 255.0;
    }
    Ok(output)
}

/// 将 CHW 张量按最小最大值归一化后保存为 PNG，单通道图片会被复制到三个通道
pub fn imwrite_chw(tensor: ArrayView3<f32>, path: &Path) -> Result<(), ImageError> {
    let (channels, height, width) = tensor.dim();
    let (min, max) = tensor
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let scale = if max > min { 255.0 / (max - min) } else { 0.0 };
    let img = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let value = |c: usize| {
            let v = tensor[[c.min(channels - 1), y as usize, x as usize]];
            ((v - min) * scale).round().clamp(0.0, 255.0) as u8
        };
        Rgb([value(0), value(1), value(2)])
    });
    img.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use ndarray::Array3;

    #[test]
    fn test_time_measure_accumulates() {
        let mut tm = TimeMeasure::new();
        let v = tm.measure("load", || 42);
        tm.add("load", Duration::from_millis(5));
        let mut other = TimeMeasure::new();
        other.add("load", Duration::from_millis(5));
        other.add("encode", Duration::from_millis(1));
        tm.merge(&other);

        assert_eq!(v, 42);
        assert!(tm.get("load").unwrap() >= Duration::from_millis(10));
        assert_eq!(tm.get("encode"), Some(Duration::from_millis(1)));
        assert!(tm.to_string().contains("encode"));
    }

    #[test]
    fn test_imread_resizes_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        GrayImage::from_pixel(4, 6, Luma([255])).save(&path).unwrap();

        let mask = imread_gray(&path, (3, 2)).unwrap();
        assert_eq!(mask.dim(), (3, 2));
        assert!(mask.iter().all(|&v| (v - 1.0).abs() < 1e-6));

        let rgb = imread_rgb(&path, (5, 5)).unwrap();
        assert_eq!(rgb.dim(), (3, 5, 5));
    }

    #[test]
    fn test_imwrite_constant_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let tensor = Array3::<f32>::ones((1, 4, 4));
        imwrite_chw(tensor.view(), &path).unwrap();
        assert!(path.exists());
    }
}
