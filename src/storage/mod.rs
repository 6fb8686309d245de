//! 对象存储抽象
//!
//! 调度器通过 `BlobStore` 完成实际的字节传输：
//! - `local`: 本地目录存储
//! - `memory`: 进程内存储（测试和嵌入使用）

pub mod local;
pub mod memory;

use crate::uploader::SourceFile;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

/// 存储操作错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("上传失败: {0}")]
    UploadFailed(String),

    #[error("无效的存储键: {0}")]
    InvalidKey(String),

    #[error("存储配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 传输进度回调
///
/// 由调度器创建并传给 `BlobStore::transfer`，上报的百分比只会前进
pub struct TransferProgress {
    last: AtomicU8,
    callback: Box<dyn Fn(u8) + Send + Sync>,
}

impl TransferProgress {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        Self {
            last: AtomicU8::new(0),
            callback: Box::new(callback),
        }
    }

    /// 不关心进度时使用
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// 上报百分比（0-100），回退或重复的值会被忽略
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            (self.callback)(percent);
        }
    }

    /// 按已传输字节数上报
    pub fn report_bytes(&self, sent: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            ((sent.min(total) as u128 * 100) / total as u128) as u8
        };
        self.report(percent);
    }

    /// 最近一次上报的百分比
    pub fn last_reported(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferProgress")
            .field("last", &self.last_reported())
            .finish()
    }
}

/// 对象存储
///
/// `transfer` 每次尝试调用一次，需支持并发调用
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// 上传内容到 `destination_key`，返回公开地址
    async fn transfer(
        &self,
        source: &SourceFile,
        destination_key: &str,
        progress: &TransferProgress,
    ) -> StorageResult<String>;

    /// 构造调度器时检查存储配置
    fn validate(&self) -> StorageResult<()> {
        Ok(())
    }

    /// 后端名称（用于日志）
    fn name(&self) -> &str;
}

/// 校验存储键，拒绝路径穿越
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("存储键为空".to_string()));
    }
    if key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey(format!(
            "存储键包含非法路径: {}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_progress_only_moves_forward() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = TransferProgress::new(move |p| sink.lock().unwrap().push(p));

        progress.report(10);
        progress.report(5);
        progress.report(10);
        progress.report(60);
        progress.report(200);

        assert_eq!(*seen.lock().unwrap(), vec![10, 60, 100]);
        assert_eq!(progress.last_reported(), 100);
    }

    #[test]
    fn test_report_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = TransferProgress::new(move |p| sink.lock().unwrap().push(p));

        progress.report_bytes(250, 1000);
        progress.report_bytes(999, 1000);
        progress.report_bytes(1000, 1000);

        assert_eq!(*seen.lock().unwrap(), vec![25, 99, 100]);
    }

    #[test]
    fn test_report_bytes_empty_file() {
        let progress = TransferProgress::noop();
        progress.report_bytes(0, 0);
        assert_eq!(progress.last_reported(), 100);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("properties/p1/a.png").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("properties/../../etc").is_err());
    }
}
