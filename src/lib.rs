// Property Uploader Library
// 房源图片上传调度核心库

// 配置管理模块
pub mod config;

// 上传事件模块
pub mod events;

// 日志模块
pub mod logging;

// 对象存储模块
pub mod storage;

// 上传调度模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, ScanConfig, SchedulerConfig, StorageConfig};
pub use events::{StatusPublisher, TimestampedEvent, UploadEvent};
pub use storage::{BlobStore, LocalBlobStore, MemoryBlobStore, StorageError, TransferProgress};
pub use uploader::{
    BatchId, BatchReceipt, CancelOutcome, CappedRetry, Scheduler, SchedulerError, SourceFile,
    TaskId, TaskStatusView, UploadTask, UploadTaskStatus,
};
