use crate::uploader::task::{BatchId, TaskId, UploadTaskStatus};
use thiserror::Error;

/// 调度器操作错误
///
/// 单个任务的上传失败不会以错误形式返回，而是记录在任务的 `last_error` 上
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// 提交的文件不满足准入条件，整批拒绝
    #[error("文件 {filename} 被拒绝: {reason}")]
    Admission { filename: String, reason: String },

    #[error("批次为空，没有可上传的文件")]
    EmptyBatch,

    #[error("任务不存在: {0}")]
    UnknownTask(TaskId),

    #[error("批次不存在: {0}")]
    UnknownBatch(BatchId),

    /// 当前状态不支持该操作
    #[error("任务 {task_id} 当前状态为 {status}，不支持{operation}")]
    InvalidState {
        task_id: TaskId,
        status: UploadTaskStatus,
        operation: &'static str,
    },

    #[error("任务 {task_id} 已尝试 {attempts} 次，达到重试上限")]
    RetryLimitReached { task_id: TaskId, attempts: u32 },

    #[error("配置错误: {0}")]
    Config(String),
}

impl SchedulerError {
    pub(crate) fn admission(filename: &str, reason: impl Into<String>) -> Self {
        SchedulerError::Admission {
            filename: filename.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
