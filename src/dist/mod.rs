mod frame;
mod launcher;

use std::time::Duration;

use anyhow::{anyhow, bail};
use futures::future::try_join_all;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

pub use frame::Frame;
use frame::{read_frame, write_frame, write_raw};
pub use launcher::*;

use crate::error::ExtractError;

/// 连接 coordinator 失败后的重试间隔
const CONNECT_RETRY: Duration = Duration::from_millis(200);
/// 发送 Abort 的最长等待时间
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// 进程组参数
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub timeout: Duration,
}

enum Role {
    /// 单进程，集合通信均为空操作
    Solo,
    /// rank 0，持有 rank 1..world_size 的连接
    Coordinator(Vec<TcpStream>),
    Member(TcpStream),
    Closed,
}

/// 显式的进程间通信上下文，星型拓扑
///
/// rank 0 监听 master_addr，其余成员连接到 rank 0。所有集合通信都经由 rank 0 转发，
/// 并受超时限制，任何成员失败都会使其他成员的集合通信失败。
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    role: Role,
}

impl ProcessGroup {
    /// 单进程运行时使用的进程组
    pub fn solo() -> Self {
        Self { rank: 0, world_size: 1, timeout: Duration::MAX, role: Role::Solo }
    }

    /// 建立进程组，rank 0 监听，其余 rank 连接
    pub async fn init(opts: &GroupOptions) -> Result<Self, ExtractError> {
        if opts.world_size == 0 || opts.rank >= opts.world_size {
            return Err(ExtractError::ProcessGroupInit(format!(
                "无效的 rank = {}, world_size = {}",
                opts.rank, opts.world_size
            )));
        }
        if opts.world_size == 1 {
            return Ok(Self::solo());
        }
        if opts.rank == 0 {
            let listener = TcpListener::bind(&opts.master_addr)
                .await
                .map_err(|e| ExtractError::ProcessGroupInit(format!("无法监听 {}: {e}", opts.master_addr)))?;
            Self::accept(listener, opts.world_size, opts.timeout).await
        } else {
            Self::connect(&opts.master_addr, opts.rank, opts.world_size, opts.timeout).await
        }
    }

    /// 作为 rank 0 等待所有成员加入
    pub async fn accept(listener: TcpListener, world_size: usize, limit: Duration) -> Result<Self, ExtractError> {
        if world_size <= 1 {
            return Ok(Self::solo());
        }
        info!("rank 0: 等待 {} 个 worker 加入", world_size - 1);

        let handshake = async {
            let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
            while slots.iter().any(Option::is_none) {
                let (mut stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                match read_frame(&mut stream).await? {
                    Frame::Hello { rank, world_size: w } => {
                        if w != world_size {
                            bail!("{peer} 的 world_size 为 {w}，应为 {world_size}");
                        }
                        if rank == 0 || rank >= world_size {
                            bail!("{peer} 的 rank {rank} 无效");
                        }
                        let slot = &mut slots[rank - 1];
                        if slot.is_some() {
                            bail!("rank {rank} 重复加入");
                        }
                        debug!("rank {rank} 已加入 ({peer})");
                        *slot = Some(stream);
                    }
                    other => bail!("{peer} 发送了意外的消息: {other:?}"),
                }
            }
            let mut peers = slots.into_iter().flatten().collect::<Vec<_>>();
            for stream in peers.iter_mut() {
                write_frame(stream, &Frame::Welcome).await?;
            }
            anyhow::Ok(peers)
        };

        let peers = timeout(limit, handshake)
            .await
            .map_err(|_| ExtractError::ProcessGroupInit(format!("等待 worker 加入超时 ({limit:?})")))?
            .map_err(|e| ExtractError::ProcessGroupInit(format!("{e:#}")))?;
        info!("rank 0: 进程组已建立，共 {world_size} 个 worker");

        Ok(Self { rank: 0, world_size, timeout: limit, role: Role::Coordinator(peers) })
    }

    /// 作为 rank > 0 的成员连接到 coordinator，连接失败时重试直到超时
    pub async fn connect(addr: &str, rank: usize, world_size: usize, limit: Duration) -> Result<Self, ExtractError> {
        if rank == 0 || rank >= world_size {
            return Err(ExtractError::ProcessGroupInit(format!("无效的 rank = {rank}, world_size = {world_size}")));
        }

        let handshake = async {
            let mut stream = loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    Err(e) => {
                        debug!("rank {rank}: 连接 {addr} 失败: {e}，稍后重试");
                        sleep(CONNECT_RETRY).await;
                    }
                }
            };
            stream.set_nodelay(true)?;
            write_frame(&mut stream, &Frame::Hello { rank, world_size }).await?;
            match read_frame(&mut stream).await? {
                Frame::Welcome => anyhow::Ok(stream),
                Frame::Abort(reason) => bail!("coordinator 已中止: {reason}"),
                other => bail!("coordinator 发送了意外的消息: {other:?}"),
            }
        };

        let stream = timeout(limit, handshake)
            .await
            .map_err(|_| ExtractError::ProcessGroupInit(format!("连接 {addr} 超时 ({limit:?})")))?
            .map_err(|e| ExtractError::ProcessGroupInit(format!("{e:#}")))?;
        info!("rank {rank}: 已加入进程组");

        Ok(Self { rank, world_size, timeout: limit, role: Role::Member(stream) })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// 是否负责写入最终产物
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// 等待所有成员到达
    pub async fn barrier(&mut self) -> Result<(), ExtractError> {
        let limit = self.timeout;
        let result = match &mut self.role {
            Role::Solo => Ok(()),
            Role::Coordinator(peers) => {
                let result = async {
                    for (i, frame) in gather_frames(peers, limit).await?.into_iter().enumerate() {
                        if frame != Frame::Arrive {
                            bail!("rank {} 发送了意外的消息: {frame:?}", i + 1);
                        }
                    }
                    broadcast(peers, &Frame::Release.encode()?).await
                }
                .await;
                if let Err(e) = &result {
                    forward_abort(peers, &format!("{e:#}")).await;
                }
                result
            }
            Role::Member(stream) => async {
                write_frame(stream, &Frame::Arrive).await?;
                match recv(stream, limit).await? {
                    Frame::Release => Ok(()),
                    other => bail!("coordinator 发送了意外的消息: {other:?}"),
                }
            }
            .await,
            Role::Closed => Err(anyhow!("进程组已关闭")),
        };
        result.map_err(|e| ExtractError::Collective(format!("barrier: {e:#}")))
    }

    /// 收集所有成员的数据，返回按 rank 排列的结果，每个成员得到相同的结果
    pub async fn all_gather(&mut self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>, ExtractError> {
        let limit = self.timeout;
        let world_size = self.world_size;
        let result = match &mut self.role {
            Role::Solo => Ok(vec![payload]),
            Role::Coordinator(peers) => {
                let result = async {
                    let mut gathered = Vec::with_capacity(world_size);
                    gathered.push(payload);
                    for (i, frame) in gather_frames(peers, limit).await?.into_iter().enumerate() {
                        match frame {
                            Frame::Contribute(data) => gathered.push(data),
                            other => bail!("rank {} 发送了意外的消息: {other:?}", i + 1),
                        }
                    }
                    let frame = Frame::Gathered(gathered);
                    broadcast(peers, &frame.encode()?).await?;
                    let Frame::Gathered(gathered) = frame else { unreachable!() };
                    Ok(gathered)
                }
                .await;
                if let Err(e) = &result {
                    forward_abort(peers, &format!("{e:#}")).await;
                }
                result
            }
            Role::Member(stream) => async {
                write_frame(stream, &Frame::Contribute(payload)).await?;
                match recv(stream, limit).await? {
                    Frame::Gathered(gathered) if gathered.len() == world_size => Ok(gathered),
                    Frame::Gathered(gathered) => bail!("收到 {} 份数据，应为 {world_size}", gathered.len()),
                    other => bail!("coordinator 发送了意外的消息: {other:?}"),
                }
            }
            .await,
            Role::Closed => Err(anyhow!("进程组已关闭")),
        };
        result.map_err(|e| ExtractError::Collective(format!("all_gather: {e:#}")))
    }

    /// 通知其他成员本进程已失败，尽力而为
    pub async fn abort(&mut self, reason: &str) {
        let frame = Frame::Abort(format!("rank {}: {reason}", self.rank));
        match &mut self.role {
            Role::Coordinator(peers) => {
                for (i, stream) in peers.iter_mut().enumerate() {
                    send_abort(stream, &frame, i + 1).await;
                }
            }
            Role::Member(stream) => send_abort(stream, &frame, 0).await,
            Role::Solo | Role::Closed => {}
        }
    }

    /// 关闭所有连接，失败只记录警告
    pub async fn destroy(mut self) {
        match std::mem::replace(&mut self.role, Role::Closed) {
            Role::Coordinator(peers) => {
                for (i, mut stream) in peers.into_iter().enumerate() {
                    if let Err(e) = stream.shutdown().await {
                        warn!("rank 0: 关闭与 rank {} 的连接失败: {e}", i + 1);
                    }
                }
            }
            Role::Member(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    warn!("rank {}: 关闭连接失败: {e}", self.rank);
                }
            }
            Role::Solo | Role::Closed => {}
        }
        debug!("rank {}: 进程组已销毁", self.rank);
    }
}

/// 从所有成员各读取一帧，任何成员中止、断开或超时都会立即失败
async fn gather_frames(peers: &mut [TcpStream], limit: Duration) -> anyhow::Result<Vec<Frame>> {
    let reads = peers.iter_mut().enumerate().map(|(i, stream)| async move {
        let frame = read_frame(stream).await.map_err(|e| anyhow!("与 rank {} 的连接中断: {e}", i + 1))?;
        if let Frame::Abort(reason) = frame {
            bail!("rank {} 已中止: {reason}", i + 1);
        }
        Ok(frame)
    });
    match timeout(limit, try_join_all(reads)).await {
        Ok(frames) => frames,
        Err(_) => bail!("等待其他 worker 超时 ({limit:?})"),
    }
}

async fn broadcast(peers: &mut [TcpStream], bytes: &[u8]) -> anyhow::Result<()> {
    for (i, stream) in peers.iter_mut().enumerate() {
        write_raw(stream, bytes).await.map_err(|e| anyhow!("向 rank {} 发送失败: {e}", i + 1))?;
    }
    Ok(())
}

async fn recv(stream: &mut TcpStream, limit: Duration) -> anyhow::Result<Frame> {
    let frame = match timeout(limit, read_frame(stream)).await {
        Ok(frame) => frame.map_err(|e| anyhow!("与 coordinator 的连接中断: {e}"))?,
        Err(_) => bail!("等待 coordinator 超时 ({limit:?})"),
    };
    if let Frame::Abort(reason) = frame {
        bail!("进程组已中止: {reason}");
    }
    Ok(frame)
}

/// coordinator 的集合通信失败时，通知所有成员
async fn forward_abort(peers: &mut [TcpStream], reason: &str) {
    let frame = Frame::Abort(format!("rank 0: {reason}"));
    for (i, stream) in peers.iter_mut().enumerate() {
        send_abort(stream, &frame, i + 1).await;
    }
}

async fn send_abort(stream: &mut TcpStream, frame: &Frame, peer: usize) {
    match timeout(ABORT_TIMEOUT, write_frame(stream, frame)).await {
        Ok(Ok(())) => debug!("已通知 rank {peer} 中止"),
        Ok(Err(e)) => debug!("通知 rank {peer} 中止失败: {e}"),
        Err(_) => debug!("通知 rank {peer} 中止超时"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(10);

    async fn spawn_group(world_size: usize) -> Vec<ProcessGroup> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut members = vec![];
        for rank in 1..world_size {
            let addr = addr.clone();
            members.push(tokio::spawn(async move { ProcessGroup::connect(&addr, rank, world_size, LIMIT).await }));
        }
        let mut groups = vec![ProcessGroup::accept(listener, world_size, LIMIT).await.unwrap()];
        for member in members {
            groups.push(member.await.unwrap().unwrap());
        }
        groups
    }

    #[tokio::test]
    async fn test_solo_collectives() {
        let mut group = ProcessGroup::solo();
        group.barrier().await.unwrap();
        assert_eq!(group.all_gather(vec![1, 2]).await.unwrap(), vec![vec![1, 2]]);
        group.destroy().await;
    }

    #[tokio::test]
    async fn test_init_rejects_bad_rank() {
        let opts = GroupOptions { rank: 3, world_size: 2, master_addr: "127.0.0.1:0".into(), timeout: LIMIT };
        assert!(matches!(ProcessGroup::init(&opts).await, Err(ExtractError::ProcessGroupInit(_))));
    }

    #[tokio::test]
    async fn test_all_gather_in_rank_order() {
        let groups = spawn_group(3).await;
        let handles = groups
            .into_iter()
            .map(|mut group| {
                tokio::spawn(async move {
                    let rank = group.rank();
                    group.barrier().await?;
                    let gathered = group.all_gather(vec![rank as u8; rank + 1]).await?;
                    group.destroy().await;
                    Ok::<_, ExtractError>(gathered)
                })
            })
            .collect::<Vec<_>>();

        let expected = vec![vec![0u8], vec![1, 1], vec![2, 2, 2]];
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_abort_propagates_to_all_members() {
        let mut groups = spawn_group(3).await;
        let failing = groups.pop().unwrap();

        let waiting = groups
            .into_iter()
            .map(|mut group| tokio::spawn(async move { group.barrier().await }))
            .collect::<Vec<_>>();

        let mut failing = failing;
        failing.abort("掩码缺失").await;
        failing.destroy().await;

        for handle in waiting {
            let result = timeout(LIMIT, handle).await.expect("barrier 不应挂起").unwrap();
            assert!(matches!(result, Err(ExtractError::Collective(_))));
        }
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = ProcessGroup::accept(listener, 2, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ExtractError::ProcessGroupInit(_))));
    }

    #[tokio::test]
    async fn test_collective_times_out() {
        let mut groups = spawn_group(2).await;
        let _member = groups.pop().unwrap();
        let mut coordinator = groups.pop().unwrap();
        coordinator.timeout = Duration::from_millis(200);
        assert!(matches!(coordinator.barrier().await, Err(ExtractError::Collective(_))));
    }
}
