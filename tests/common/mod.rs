#![allow(dead_code)]

use std::fs;
use std::path::Path;

use anyhow::Result;
use image::{GrayImage, Luma, Rgb, RgbImage};
use maskfeat::RunConfig;
use serde_json::{Value, json};

pub const DIM: usize = 16;
pub const SIZE: u32 = 16;

/// 在 root 下生成测试数据集，清单顺序与 ids 相同
///
/// `missing_masks` 中的样本不会生成掩码文件
pub fn write_dataset(root: &Path, ids: &[u64], missing_masks: &[u64]) -> Result<()> {
    fs::create_dir_all(root)?;
    let mut manifest = vec![];
    for &id in ids {
        let image = RgbImage::from_fn(SIZE, SIZE, |x, y| {
            let id = id as u32;
            Rgb([
                ((id * 37 + x * 13) % 256) as u8,
                ((id * 91 + y * 7) % 256) as u8,
                ((id * 53 + x * y) % 256) as u8,
            ])
        });
        image.save(root.join(format!("img_{id}.png")))?;

        if !missing_masks.contains(&id) {
            let mask = GrayImage::from_fn(SIZE, SIZE, |x, _| Luma([if x < SIZE / 2 + id as u32 % 4 { 255 } else { 0 }]));
            mask.save(root.join(format!("mask_{id}.png")))?;
        }

        manifest.push(json!({
            "id": id,
            "object_name": format!("obj_{id}"),
            "image_path": format!("img_{id}.png"),
            "mask_path": format!("mask_{id}.png"),
        }));
    }
    fs::write(root.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}

/// 运行配置，使用随机投影模型
pub fn config_value(data_dir: &Path, output_dir: &Path) -> Value {
    json!({
        "models": {
            "CLIP": { "name": "None", "type_model": "CLIP" },
            "PROJ": { "name": "projection", "type_model": "PROJECTION" }
        },
        "index": { "index_type": "Flat", "dimension": DIM, "metric": "L2" },
        "data": {
            "data_dir": data_dir,
            "batch_size": 2,
            "num_workers": 2,
            "target_size": [SIZE, SIZE]
        },
        "output_dir": output_dir,
        "seed": 7,
        "group_timeout_secs": 30,
        "sample_images": 0,
        "export_features": true
    })
}

pub fn run_config(data_dir: &Path, output_dir: &Path) -> RunConfig {
    serde_json::from_value(config_value(data_dir, output_dir)).unwrap()
}
