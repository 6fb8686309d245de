// 上传调度模块
//
// - task: 任务模型和状态机
// - queue: FIFO 等待队列
// - gate: 并发闸门（槽位池）
// - scheduler: 事件驱动的准入和传输调度
// - retry: 调用方的重试上限包装
// - folder: 本地文件夹扫描

pub mod error;
pub mod folder;
pub mod gate;
pub mod naming;
pub mod policy;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use error::{Result, SchedulerError};
pub use folder::{format_bytes, FolderScanner, ScanOptions, ScannedFile};
pub use gate::{ConcurrencyGate, SlotGuard, DEFAULT_MAX_CONCURRENT_UPLOADS};
pub use naming::{sanitize_segment, DestinationKeyStrategy, GeneratedKey, KeyNaming};
pub use policy::ContentPolicy;
pub use queue::TaskQueue;
pub use retry::CappedRetry;
pub use scheduler::{BatchReceipt, CancelOutcome, Scheduler, CANCELLED_MESSAGE};
pub use task::{
    BatchId, SourceContent, SourceFile, SourceRef, TaskId, TaskStatusView, UploadTask,
    UploadTaskStatus,
};
