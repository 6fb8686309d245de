// 上传任务定义
//
// 一个 UploadTask 对应一个待上传文件的完整生命周期

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// 上传任务 ID（重试时保持不变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 批次 ID（一次提交产生的所有任务共享）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传内容来源
#[derive(Clone)]
pub enum SourceContent {
    /// 内存中的数据
    Bytes(Bytes),
    /// 本地文件
    File(PathBuf),
}

impl fmt::Debug for SourceContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceContent::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            SourceContent::File(path) => write!(f, "File({:?})", path),
        }
    }
}

/// 待上传的源文件
///
/// 调度器只持有引用，从不修改内容
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// 原始文件名（仅用于展示）
    pub filename: String,
    /// 声明的内容类型，为空时按文件扩展名推断
    pub content_type: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 内容
    pub content: SourceContent,
}

impl SourceFile {
    /// 从内存数据创建
    pub fn from_bytes(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            content: SourceContent::Bytes(data),
        }
    }

    /// 从本地文件创建，内容类型按扩展名推断
    pub async fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let content_type = mime_guess::from_path(&path)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_default();

        Ok(Self {
            filename,
            content_type,
            size: metadata.len(),
            content: SourceContent::File(path),
        })
    }
}

/// 源文件共享句柄
pub type SourceRef = Arc<SourceFile>;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 排队中
    Queued,
    /// 上传中
    Active,
    /// 已完成
    Completed,
    /// 失败（可重试）
    Failed,
}

impl UploadTaskStatus {
    /// 是否为终态（Completed / Failed）
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadTaskStatus::Completed | UploadTaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTaskStatus::Queued => "queued",
            UploadTaskStatus::Active => "active",
            UploadTaskStatus::Completed => "completed",
            UploadTaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: TaskId,
    /// 所属批次
    pub batch_id: BatchId,
    /// 源文件
    #[serde(skip)]
    pub source: SourceRef,
    /// 所属房源 ID
    pub target_entity_id: String,
    /// 原始文件名
    pub filename: String,
    /// 准入时确定的内容类型
    pub content_type: String,
    /// 文件大小
    pub size: u64,
    /// 存储键（提交时生成，重试沿用）
    pub destination_key: String,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 进度百分比 0-100
    pub progress: u8,
    /// 上传成功后的公开地址
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_locator: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// 已尝试次数（首次准入为 1）
    pub attempt: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 最近一次开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 最近一次结束时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务（Queued 状态）
    pub fn new(
        batch_id: BatchId,
        target_entity_id: impl Into<String>,
        source: SourceRef,
        content_type: String,
        destination_key: String,
    ) -> Self {
        Self {
            id: TaskId::new(),
            batch_id,
            target_entity_id: target_entity_id.into(),
            filename: source.filename.clone(),
            content_type,
            size: source.size,
            destination_key,
            source,
            status: UploadTaskStatus::Queued,
            progress: 0,
            result_locator: None,
            last_error: None,
            attempt: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 标记为上传中，开始新一轮尝试
    pub fn mark_active(&mut self) {
        self.status = UploadTaskStatus::Active;
        self.attempt += 1;
        self.progress = 0;
        self.started_at = Some(chrono::Utc::now().timestamp());
    }

    /// 更新进度，返回进度是否前进
    ///
    /// 只在 Active 状态生效，且不会回退
    pub fn advance_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if self.status != UploadTaskStatus::Active || percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, locator: String) {
        self.status = UploadTaskStatus::Completed;
        self.progress = 100;
        self.result_locator = Some(locator);
        self.last_error = None;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.last_error = Some(error);
        self.result_locator = None;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 重新排队（重试）
    pub fn mark_requeued(&mut self) {
        self.status = UploadTaskStatus::Queued;
        self.progress = 0;
        self.last_error = None;
        self.result_locator = None;
    }

    /// 转换为对外展示的状态记录
    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            id: self.id,
            filename: self.filename.clone(),
            status: self.status,
            progress: self.progress,
            result_locator: self.result_locator.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// 任务状态快照（供 UI / 调用方轮询）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: TaskId,
    pub filename: String,
    pub status: UploadTaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_locator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> UploadTask {
        let source = Arc::new(SourceFile::from_bytes("front.jpg", "image/jpeg", vec![0u8; 16]));
        UploadTask::new(
            BatchId::new(),
            "property-42",
            source,
            "image/jpeg".to_string(),
            "properties/property-42/front.jpg".to_string(),
        )
    }

    #[test]
    fn test_task_creation() {
        let task = sample_task();

        assert_eq!(task.status, UploadTaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.size, 16);
        assert_eq!(task.filename, "front.jpg");
        assert!(task.result_locator.is_none());
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert!(!a.to_string().is_empty());
    }

    #[test]
    fn test_progress_is_monotonic_while_active() {
        let mut task = sample_task();

        // 排队中不接受进度
        assert!(!task.advance_progress(10));
        assert_eq!(task.progress, 0);

        task.mark_active();
        assert!(task.advance_progress(30));
        assert!(!task.advance_progress(20));
        assert_eq!(task.progress, 30);

        assert!(task.advance_progress(250));
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = sample_task();

        task.mark_active();
        assert_eq!(task.status, UploadTaskStatus::Active);
        assert_eq!(task.attempt, 1);
        assert!(task.started_at.is_some());

        task.advance_progress(40);
        task.mark_failed("connection reset".to_string());
        assert_eq!(task.status, UploadTaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("connection reset"));

        task.mark_requeued();
        assert_eq!(task.status, UploadTaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert!(task.last_error.is_none());

        task.mark_active();
        assert_eq!(task.attempt, 2);

        task.mark_completed("https://cdn.example.com/a.jpg".to_string());
        assert_eq!(task.status, UploadTaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_status_view_serialization() {
        let mut task = sample_task();
        task.mark_active();
        task.mark_completed("https://cdn.example.com/a.jpg".to_string());

        let json = serde_json::to_value(task.status_view()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["progress"], 100);
        assert_eq!(json["result_locator"], "https://cdn.example.com/a.jpg");
        assert!(json.get("last_error").is_none());
    }
}
