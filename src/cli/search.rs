use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use log::debug;
use ndarray::Array2;
use ndarray_npy::read_npy;
use serde::Serialize;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::Opts;
use crate::dataset::Sample;
use crate::index::{Index, Neighbor};
use crate::logging;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    /// 索引文件路径
    #[arg(long, value_name = "FILE")]
    pub index: PathBuf,
    /// 元数据文件路径，默认为索引所在目录下的 metadata.json
    #[arg(long, value_name = "FILE")]
    pub metadata: Option<PathBuf>,
    /// 查询向量，各分量用逗号分隔
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, conflicts_with = "query")]
    pub vector: Option<Vec<f32>>,
    /// 查询向量文件（npy 格式），每行一个向量
    #[arg(long, value_name = "FILE")]
    pub query: Option<PathBuf>,
    /// 每个查询返回的结果数量
    #[arg(short, default_value_t = 5)]
    pub k: usize,
    /// 搜索的倒排列表数量
    #[arg(long)]
    pub nprobe: Option<usize>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Debug, Serialize)]
struct SearchHit<'a> {
    label: i64,
    distance: f32,
    sample: Option<&'a Sample>,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        logging::init(None, None)?;
        let queries: Array2<f32> = match (&self.vector, &self.query) {
            (Some(v), _) => Array2::from_shape_vec((1, v.len()), v.clone())?,
            (None, Some(path)) => read_npy(path).with_context(|| format!("无法读取查询文件 {}", path.display()))?,
            (None, None) => bail!("需要指定 --vector 或 --query"),
        };

        let mut index = block_in_place(|| Index::from_file(&self.index))?;
        if let Some(nprobe) = self.nprobe {
            index.set_nprobe(nprobe);
        }
        debug!("已加载 {} 索引，共 {} 条向量", index.kind(), index.ntotal());

        let metadata_path = self.metadata.clone().unwrap_or_else(|| self.index.with_file_name("metadata.json"));
        let file = File::open(&metadata_path).with_context(|| format!("无法打开元数据 {}", metadata_path.display()))?;
        let metadata: Vec<Sample> = serde_json::from_reader(BufReader::new(file))?;

        let result = block_in_place(|| index.search(queries.view(), self.k))?;
        print_result(&result, &metadata, self.output_format)
    }
}

fn print_result(result: &[Vec<Neighbor>], metadata: &[Sample], format: OutputFormat) -> Result<()> {
    let hits = result
        .iter()
        .map(|neighbors| {
            neighbors
                .iter()
                .map(|n| SearchHit {
                    label: n.label,
                    distance: n.distance,
                    sample: usize::try_from(n.label).ok().and_then(|i| metadata.get(i)),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&hits)?)
        }
        OutputFormat::Table => {
            for (i, hits) in hits.iter().enumerate() {
                if result.len() > 1 {
                    println!("# query {i}");
                }
                for hit in hits {
                    match hit.sample {
                        Some(s) => println!("{:.4}\t{}\t{}\t{}", hit.distance, s.id, s.object_name, s.image_path),
                        None => println!("{:.4}\t{}", hit.distance, hit.label),
                    }
                }
            }
        }
    }
    Ok(())
}
