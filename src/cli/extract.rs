use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, RunConfig};
use crate::dist::{ProcessGroup, launch_workers};
use crate::logging;
use crate::pipeline::run_extraction;

#[derive(Parser, Debug, Clone)]
pub struct ExtractCommand {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
    /// 使用的模型，默认为第一个启用的模型
    #[arg(short, long, value_name = "KEY")]
    pub model: Option<String>,
}

impl SubCommandExtend for ExtractCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let config = RunConfig::load(&self.config)?;
        let output = config.output();

        if config.effective_world_size() > 1 {
            logging::init(Some(&output.logs()), None)?;
            // 在启动 worker 之前检查模型配置
            let model = config.select_model(self.model.as_deref())?;
            info!("分布式提取，world_size = {}，模型 {}", config.world_size, model.key);
            launch_workers(&self.config, config.world_size, Some(&model.key), None).await?;
        } else {
            logging::init(Some(&output.logs()), Some(0))?;
            let model = config.select_model(self.model.as_deref())?;
            let outcome = run_extraction(&config, &model, ProcessGroup::solo()).await?;
            info!("共提取 {} 个样本的特征", outcome.result.len());
        }

        info!("提取完成，结果保存在 {}", output.path().display());
        Ok(())
    }
}
