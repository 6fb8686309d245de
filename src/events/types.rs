//! 上传事件类型定义

use crate::uploader::{BatchId, TaskId, UploadTaskStatus};
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、删除等关键事件
    High = 2,
}

/// 上传任务事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建
    Created {
        task_id: TaskId,
        batch_id: BatchId,
        target_entity_id: String,
        filename: String,
        size: u64,
    },
    /// 状态变更
    StatusChanged {
        task_id: TaskId,
        batch_id: BatchId,
        old_status: UploadTaskStatus,
        new_status: UploadTaskStatus,
        attempt: u32,
    },
    /// 进度更新
    Progress {
        task_id: TaskId,
        batch_id: BatchId,
        progress: u8,
    },
    /// 任务完成
    Completed {
        task_id: TaskId,
        batch_id: BatchId,
        locator: String,
        attempt: u32,
    },
    /// 任务失败
    Failed {
        task_id: TaskId,
        batch_id: BatchId,
        error: String,
        attempt: u32,
    },
    /// 任务不再被跟踪（取消、移除或清空批次）
    Deleted { task_id: TaskId, batch_id: BatchId },
}

impl UploadEvent {
    /// 获取任务 ID
    pub fn task_id(&self) -> TaskId {
        match self {
            UploadEvent::Created { task_id, .. }
            | UploadEvent::StatusChanged { task_id, .. }
            | UploadEvent::Progress { task_id, .. }
            | UploadEvent::Completed { task_id, .. }
            | UploadEvent::Failed { task_id, .. }
            | UploadEvent::Deleted { task_id, .. } => *task_id,
        }
    }

    /// 获取批次 ID
    pub fn batch_id(&self) -> BatchId {
        match self {
            UploadEvent::Created { batch_id, .. }
            | UploadEvent::StatusChanged { batch_id, .. }
            | UploadEvent::Progress { batch_id, .. }
            | UploadEvent::Completed { batch_id, .. }
            | UploadEvent::Failed { batch_id, .. }
            | UploadEvent::Deleted { batch_id, .. } => *batch_id,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. } => EventPriority::Low,
            UploadEvent::Created { .. } | UploadEvent::StatusChanged { .. } => {
                EventPriority::Medium
            }
            UploadEvent::Completed { .. }
            | UploadEvent::Failed { .. }
            | UploadEvent::Deleted { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Deleted { .. } => "deleted",
        }
    }
}

/// 带序号和时间戳的事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    /// 事件 ID（发布器内单调递增）
    pub event_id: u64,
    /// 时间戳（Unix 毫秒）
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: UploadEvent,
}

impl TimestampedEvent {
    pub fn new(event_id: u64, event: UploadEvent) -> Self {
        Self {
            event_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let task_id = TaskId::new();
        let batch_id = BatchId::new();
        let event = UploadEvent::StatusChanged {
            task_id,
            batch_id,
            old_status: UploadTaskStatus::Queued,
            new_status: UploadTaskStatus::Active,
            attempt: 1,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "status_changed");
        assert_eq!(json["old_status"], "queued");
        assert_eq!(json["new_status"], "active");
        assert_eq!(json["task_id"], task_id.to_string());

        let back: UploadEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_accessors() {
        let task_id = TaskId::new();
        let batch_id = BatchId::new();

        let progress = UploadEvent::Progress {
            task_id,
            batch_id,
            progress: 40,
        };
        assert_eq!(progress.task_id(), task_id);
        assert_eq!(progress.batch_id(), batch_id);
        assert_eq!(progress.priority(), EventPriority::Low);
        assert_eq!(progress.event_type_name(), "progress");

        let failed = UploadEvent::Failed {
            task_id,
            batch_id,
            error: "timeout".to_string(),
            attempt: 2,
        };
        assert_eq!(failed.priority(), EventPriority::High);
        assert!(failed.priority() > progress.priority());
    }

    #[test]
    fn test_timestamped_event_flatten() {
        let event = UploadEvent::Deleted {
            task_id: TaskId::new(),
            batch_id: BatchId::new(),
        };
        let stamped = TimestampedEvent::new(7, event.clone());

        let json = serde_json::to_value(&stamped).unwrap();
        assert_eq!(json["event_id"], 7);
        assert_eq!(json["event_type"], "deleted");
        assert!(json["timestamp"].as_i64().unwrap() > 0);

        let back: TimestampedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.event, event);
    }
}
