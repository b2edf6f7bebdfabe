use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use env_logger::{Env, Target};

/// 同时写入 stderr 和日志文件
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// 日志文件路径：`<dir>/process_log_<时间戳>_rank<R>.txt`，启动进程使用 `main`
pub fn log_file_path(dir: &Path, rank: Option<usize>) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let tag = match rank {
        Some(rank) => format!("rank{rank}"),
        None => "main".to_string(),
    };
    dir.join(format!("process_log_{ts}_{tag}.txt"))
}

/// 初始化日志，默认级别为 info，可通过 RUST_LOG 覆盖
///
/// 指定 `log_dir` 时会在该目录下创建日志文件，所有记录同时写入 stderr 和该文件
pub fn init(log_dir: Option<&Path>, rank: Option<usize>) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    let tag = match rank {
        Some(rank) => format!("rank{rank}"),
        None => "main".to_string(),
    };
    builder.format(move |buf, record| {
        writeln!(buf, "{} - {} - {} - {}", buf.timestamp(), record.level(), tag, record.args())
    });

    if let Some(dir) = log_dir {
        fs::create_dir_all(dir).with_context(|| format!("无法创建日志目录 {}", dir.display()))?;
        let path = log_file_path(dir, rank);
        let file = File::create(&path).with_context(|| format!("无法创建日志文件 {}", path.display()))?;
        builder.target(Target::Pipe(Box::new(TeeWriter { file })));
    }

    builder.try_init()?;
    Ok(())
}
