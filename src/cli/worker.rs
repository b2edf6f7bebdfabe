use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::cli::SubCommandExtend;
use crate::config::{Opts, RunConfig};
use crate::dist::{GroupOptions, ProcessGroup};
use crate::logging;
use crate::pipeline::run_extraction;

#[derive(Parser, Debug, Clone)]
pub struct WorkerCommand {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
    /// 当前 worker 的编号
    #[arg(long)]
    pub rank: usize,
    /// 使用的模型
    #[arg(short, long, value_name = "KEY")]
    pub model: Option<String>,
    /// rank 0 的监听地址，默认使用配置文件中的 master_addr
    #[arg(long, value_name = "ADDR")]
    pub master_addr: Option<String>,
}

impl SubCommandExtend for WorkerCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let config = RunConfig::load(&self.config)?;
        logging::init(Some(&config.output().logs()), Some(self.rank))?;
        let model = config.select_model(self.model.as_deref())?;

        let options = GroupOptions {
            rank: self.rank,
            world_size: config.world_size,
            master_addr: self.master_addr.clone().unwrap_or_else(|| config.master_addr.clone()),
            timeout: config.group_timeout(),
        };
        let group = ProcessGroup::init(&options).await?;
        let outcome = run_extraction(&config, &model, group).await?;
        info!("rank {}: 完成", outcome.rank);
        Ok(())
    }
}
