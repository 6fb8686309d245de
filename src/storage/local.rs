use crate::storage::{validate_key, BlobStore, StorageError, StorageResult, TransferProgress};
use crate::uploader::{SourceContent, SourceFile};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// 每次写入的块大小
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

const PART_SUFFIX: &str = ".part";

/// 本地目录存储
///
/// 文件写入 `root_dir/{key}`，公开地址为 `{public_base_url}/{key}`
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root_dir: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    /// 创建本地存储，根目录不存在时自动创建
    pub async fn new(
        root_dir: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> StorageResult<Self> {
        let root_dir = root_dir.into();
        let public_base_url = public_base_url.into();

        if public_base_url.trim().is_empty() {
            return Err(StorageError::Config("public_base_url 不能为空".to_string()));
        }

        fs::create_dir_all(&root_dir).await.map_err(|e| {
            StorageError::Config(format!(
                "创建存储目录失败 {}: {}",
                root_dir.display(),
                e
            ))
        })?;

        info!("本地存储已就绪: {}", root_dir.display());

        Ok(Self {
            root_dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root_dir.join(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// 在目标目录创建 `.{file_name}.XXXXXX.part` 临时文件
    fn part_file(parent: &Path, path: &Path) -> StorageResult<NamedTempFile> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name))
            .suffix(PART_SUFFIX)
            .tempfile_in(parent)?;
        Ok(tmp)
    }

    async fn write_all(
        file: &mut fs::File,
        source: &SourceFile,
        progress: &TransferProgress,
    ) -> StorageResult<u64> {
        let total = source.size;
        let mut written: u64 = 0;

        match &source.content {
            SourceContent::Bytes(data) => {
                for chunk in data.chunks(WRITE_CHUNK_SIZE) {
                    file.write_all(chunk).await?;
                    written += chunk.len() as u64;
                    progress.report_bytes(written, total.max(written));
                }
            }
            SourceContent::File(path) => {
                let mut input = fs::File::open(path).await?;
                let mut buf = vec![0u8; WRITE_CHUNK_SIZE];
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buf[..n]).await?;
                    written += n as u64;
                    progress.report_bytes(written, total.max(written));
                }
            }
        }

        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn transfer(
        &self,
        source: &SourceFile,
        destination_key: &str,
        progress: &TransferProgress,
    ) -> StorageResult<String> {
        let path = self.key_to_path(destination_key)?;
        let parent = path.parent().unwrap_or(self.root_dir.as_path());
        fs::create_dir_all(parent).await?;

        // 每次尝试独占一个临时文件，出错或被取消时随 drop 删除
        let tmp = Self::part_file(parent, &path)?;
        let mut file = fs::File::from_std(tmp.as_file().try_clone()?);
        let written = Self::write_all(&mut file, source, progress).await?;
        drop(file);

        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
        progress.report(100);

        debug!("本地存储写入完成: key={}, bytes={}", destination_key, written);
        Ok(self.public_url(destination_key))
    }

    fn validate(&self) -> StorageResult<()> {
        if !self.root_dir.is_dir() {
            return Err(StorageError::Config(format!(
                "存储目录不存在: {}",
                self.root_dir.display()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}
