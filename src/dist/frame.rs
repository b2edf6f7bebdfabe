use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// 单帧最大长度
const MAX_FRAME_LEN: u64 = 1 << 36;

/// 进程组内传输的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// member -> coordinator，加入进程组
    Hello { rank: usize, world_size: usize },
    /// coordinator -> member，所有成员均已加入
    Welcome,
    /// member -> coordinator，到达 barrier
    Arrive,
    /// coordinator -> member，所有成员均已到达 barrier
    Release,
    /// member -> coordinator，all-gather 的本地数据
    Contribute(Vec<u8>),
    /// coordinator -> member，按 rank 排列的全部数据
    Gathered(Vec<Vec<u8>>),
    /// 任意方向，发送方已失败
    Abort(String),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// 写入一帧：u64 长度 + bincode 数据
pub async fn write_raw(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    stream.write_u64(bytes.len() as u64).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    write_raw(stream, &frame.encode()?).await
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let len = stream.read_u64().await?;
    ensure!(len <= MAX_FRAME_LEN, "帧长度 {len} 超出限制");
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_frame_over_tcp() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, &Frame::Hello { rank: 2, world_size: 3 }).await?;
            write_frame(&mut stream, &Frame::Gathered(vec![vec![1, 2], vec![]])).await?;
            anyhow::Ok(())
        });

        let (mut stream, _) = listener.accept().await?;
        assert_eq!(read_frame(&mut stream).await?, Frame::Hello { rank: 2, world_size: 3 });
        assert_eq!(read_frame(&mut stream).await?, Frame::Gathered(vec![vec![1, 2], vec![]]));
        client.await??;

        // 对端关闭后读取失败
        assert!(read_frame(&mut stream).await.is_err());
        Ok(())
    }
}
