use crate::uploader::error::{Result, SchedulerError};
use crate::uploader::scheduler::Scheduler;
use crate::uploader::task::{BatchId, TaskId, UploadTaskStatus};
use tracing::warn;

/// 带次数上限的重试
///
/// 调度器本身不限制重试次数，上限由调用方通过此包装决定
#[derive(Clone)]
pub struct CappedRetry {
    scheduler: Scheduler,
    max_attempts: u32,
}

impl CappedRetry {
    /// `max_retries` 为首次尝试之外允许的重试次数
    pub fn new(scheduler: Scheduler, max_retries: u32) -> Self {
        Self {
            scheduler,
            max_attempts: max_retries.saturating_add(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 重试单个任务，已达上限时拒绝
    pub fn retry(&self, task_id: TaskId) -> Result<()> {
        let task = self
            .scheduler
            .task(task_id)
            .ok_or(SchedulerError::UnknownTask(task_id))?;

        if task.attempt >= self.max_attempts {
            warn!(
                "任务已达重试上限: task={}, attempts={}",
                task_id, task.attempt
            );
            return Err(SchedulerError::RetryLimitReached {
                task_id,
                attempts: task.attempt,
            });
        }

        self.scheduler.retry(task_id)
    }

    /// 重试批次内所有未达上限的失败任务，返回重新排队的任务
    pub fn retry_failed(&self, batch_id: BatchId) -> Result<Vec<TaskId>> {
        let batch = self.scheduler.batch_snapshot(batch_id);
        if batch.is_empty() {
            return Err(SchedulerError::UnknownBatch(batch_id));
        }

        let mut requeued = Vec::new();
        for task in batch
            .iter()
            .filter(|task| task.status == UploadTaskStatus::Failed)
        {
            match self.retry(task.id) {
                Ok(()) => requeued.push(task.id),
                Err(SchedulerError::RetryLimitReached { .. }) => {}
                Err(e) => warn!("重试失败: task={}, {}", task.id, e),
            }
        }
        Ok(requeued)
    }
}
