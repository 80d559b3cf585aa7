//! 上传暂存文件：先写入暂存目录，通过校验后再原子移动到目标位置。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 暂存目录中的临时文件，记录已写入字节数。
pub struct StagedFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
    written: u64,
}

impl StagedFile {
    /// 在 `temp_dir` 中创建临时文件，最终落地到 `target`。
    pub async fn create(temp_dir: &Path, target: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(temp_dir).await?;
        let temp_path = temp_dir.join(format!("upload-{}.part", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target,
            temp_path,
            file,
            written: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written = self.written.saturating_add(chunk.len() as u64);
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// 放弃并删除临时文件。
    pub async fn discard(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷盘后移动到目标路径，已存在的同名文件会被替换。
    pub async fn commit(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok()
                    && fs::rename(&self.temp_path, &self.target).await.is_ok()
                {
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
