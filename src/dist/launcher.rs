use std::path::Path;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::{error, info};
use tokio::process::Command;

/// 启动 world_size 个 worker 进程并等待全部结束
///
/// 每个 worker 都是以隐藏的 `worker` 子命令重新执行的当前程序。任何一个 worker 失败时，
/// 其余 worker 会被立即终止。
pub async fn launch_workers(
    config: &Path,
    world_size: usize,
    model: Option<&str>,
    master_addr: Option<&str>,
) -> Result<()> {
    let exe = std::env::current_exe().context("无法获取当前程序路径")?;
    info!("启动 {world_size} 个 worker");

    let mut running = FuturesUnordered::new();
    for rank in 0..world_size {
        let mut cmd = Command::new(&exe);
        cmd.arg("worker").arg("--config").arg(config).arg("--rank").arg(rank.to_string());
        if let Some(model) = model {
            cmd.arg("--model").arg(model);
        }
        if let Some(addr) = master_addr {
            cmd.arg("--master-addr").arg(addr);
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| format!("无法启动 rank {rank}"))?;
        running.push(async move { (rank, child.wait().await) });
    }

    while let Some((rank, status)) = running.next().await {
        let status = status.with_context(|| format!("等待 rank {rank} 结束失败"))?;
        if !status.success() {
            error!("rank {rank} 异常退出: {status}");
            // 丢弃 running 会终止其余 worker
            bail!("rank {rank} 异常退出: {status}");
        }
        info!("rank {rank} 已完成");
    }
    Ok(())
}
