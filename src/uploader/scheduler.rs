//! 上传调度器
//!
//! 负责任务的整个生命周期：
//! - 提交批次时一次性校验所有文件，全部通过才创建任务
//! - 事件驱动准入：提交、重试、槽位归还时同步推进队列，不做轮询
//! - 每个准入的任务在 Tokio 运行时上独立传输，结果回写后归还槽位
//! - 失败任务只能由调用方显式重试，调度器内部不自动重试

use crate::config::SchedulerConfig;
use crate::events::{ProgressThrottler, StatusPublisher, TimestampedEvent, UploadEvent};
use crate::storage::{BlobStore, TransferProgress};
use crate::uploader::error::{Result, SchedulerError};
use crate::uploader::gate::{ConcurrencyGate, SlotGuard};
use crate::uploader::naming::DestinationKeyStrategy;
use crate::uploader::policy::ContentPolicy;
use crate::uploader::queue::TaskQueue;
use crate::uploader::task::{
    BatchId, SourceFile, SourceRef, TaskId, TaskStatusView, UploadTask, UploadTaskStatus,
};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 主动取消时记录的错误信息
pub const CANCELLED_MESSAGE: &str = "上传已取消";

/// 批次提交回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub batch_id: BatchId,
    /// 按提交顺序排列的任务 ID
    pub task_ids: Vec<TaskId>,
}

/// 取消结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 排队中的任务已直接移除
    Removed,
    /// 上传中的任务已发出中断请求，最终状态以先发生的结果为准
    Interrupting,
}

/// 任务表中的一条记录
#[derive(Debug)]
struct TaskRecord {
    task: UploadTask,
    /// 提交序号，用于快照排序
    seq: u64,
    /// 当前尝试的取消令牌，每次准入重新创建
    cancel_token: CancellationToken,
    throttler: ProgressThrottler,
}

/// 一次准入生成的传输作业
struct TransferJob {
    task_id: TaskId,
    attempt: u32,
    source: SourceRef,
    destination_key: String,
    cancel_token: CancellationToken,
    slot: SlotGuard,
}

struct SchedulerInner {
    tasks: DashMap<TaskId, TaskRecord>,
    queue: TaskQueue,
    gate: ConcurrencyGate,
    publisher: StatusPublisher,
    store: Arc<dyn BlobStore>,
    key_strategy: Arc<dyn DestinationKeyStrategy>,
    policy: ContentPolicy,
    progress_interval: Duration,
    next_seq: AtomicU64,
    /// 出队与占用槽位必须原子完成
    admission: Mutex<()>,
    /// 任务进入终态、被移除或槽位归还时唤醒等待者
    changed: Notify,
    runtime: Handle,
}

/// 上传调度器
///
/// 可廉价克隆，所有克隆共享同一个任务表、队列和并发闸门
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// 使用配置中的命名方式创建调度器
    ///
    /// 必须在 Tokio 运行时内调用，传输任务将在该运行时上执行
    pub fn new(config: &SchedulerConfig, store: Arc<dyn BlobStore>) -> Result<Self> {
        let key_strategy = Arc::new(config.key_strategy());
        Self::with_key_strategy(config, store, key_strategy)
    }

    /// 使用自定义存储键策略创建调度器
    pub fn with_key_strategy(
        config: &SchedulerConfig,
        store: Arc<dyn BlobStore>,
        key_strategy: Arc<dyn DestinationKeyStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.content_policy()?;

        store.validate().map_err(|e| {
            SchedulerError::Config(format!("存储后端 {} 校验失败: {}", store.name(), e))
        })?;

        let runtime = Handle::try_current().map_err(|_| {
            SchedulerError::Config("调度器必须在 Tokio 运行时中创建".to_string())
        })?;

        info!(
            "创建上传调度器: store={}, max_concurrent={}",
            store.name(),
            config.max_concurrent_uploads
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                tasks: DashMap::new(),
                queue: TaskQueue::new(),
                gate: ConcurrencyGate::new(config.max_concurrent_uploads),
                publisher: StatusPublisher::new(config.event_capacity),
                store,
                key_strategy,
                policy,
                progress_interval: config.progress_throttle(),
                next_seq: AtomicU64::new(0),
                admission: Mutex::new(()),
                changed: Notify::new(),
                runtime,
            }),
        })
    }

    /// 提交一个批次
    ///
    /// 所有文件先通过准入检查，任何一个不通过则整批拒绝且不创建任务。
    /// 立即返回，不等待任何传输
    pub fn submit_batch(
        &self,
        target_entity_id: impl Into<String>,
        sources: Vec<SourceFile>,
    ) -> Result<BatchReceipt> {
        let target_entity_id = target_entity_id.into();
        if sources.is_empty() {
            warn!("拒绝空批次: entity={}", target_entity_id);
            return Err(SchedulerError::EmptyBatch);
        }

        let batch_id = BatchId::new();
        let mut tasks = Vec::with_capacity(sources.len());
        for source in sources {
            let content_type = self.inner.policy.check(&source).map_err(|e| {
                warn!("批次被拒绝: entity={}, {}", target_entity_id, e);
                e
            })?;
            let destination_key = self
                .inner
                .key_strategy
                .destination_key(&target_entity_id, &source.filename);
            tasks.push(UploadTask::new(
                batch_id,
                target_entity_id.clone(),
                Arc::new(source),
                content_type,
                destination_key,
            ));
        }

        let task_ids: Vec<TaskId> = tasks.iter().map(|task| task.id).collect();
        for task in tasks {
            let event = UploadEvent::Created {
                task_id: task.id,
                batch_id,
                target_entity_id: task.target_entity_id.clone(),
                filename: task.filename.clone(),
                size: task.size,
            };
            let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
            self.inner.tasks.insert(
                task.id,
                TaskRecord {
                    task,
                    seq,
                    cancel_token: CancellationToken::new(),
                    throttler: ProgressThrottler::new(self.inner.progress_interval),
                },
            );
            self.inner.publisher.publish(event);
        }

        info!(
            "提交上传批次: batch={}, entity={}, files={}",
            batch_id,
            target_entity_id,
            task_ids.len()
        );

        self.inner.queue.enqueue_all(task_ids.iter().copied());
        self.inner.pump();

        Ok(BatchReceipt { batch_id, task_ids })
    }

    /// 重试失败的任务
    ///
    /// 只接受 Failed 状态，任务保持原 ID 和存储键，追加到队尾
    pub fn retry(&self, task_id: TaskId) -> Result<()> {
        self.inner.requeue_failed(task_id)?;
        self.inner.pump();
        Ok(())
    }

    /// 按提交顺序重试批次内所有失败的任务，返回重新排队的任务
    pub fn retry_failed(&self, batch_id: BatchId) -> Result<Vec<TaskId>> {
        let batch = self.batch_snapshot(batch_id);
        if batch.is_empty() {
            return Err(SchedulerError::UnknownBatch(batch_id));
        }

        let mut requeued = Vec::new();
        for task in batch
            .iter()
            .filter(|task| task.status == UploadTaskStatus::Failed)
        {
            match self.inner.requeue_failed(task.id) {
                Ok(()) => requeued.push(task.id),
                // 快照之后状态已变化（被移除或已被单独重试）
                Err(e) => debug!("跳过重试: {}", e),
            }
        }

        if !requeued.is_empty() {
            info!("批次重试: batch={}, tasks={}", batch_id, requeued.len());
            self.inner.pump();
        }
        Ok(requeued)
    }

    /// 取消任务
    ///
    /// - Queued: 直接移除，不再跟踪
    /// - Active: 发出中断请求，若中断先于传输结果生效，任务以取消信息进入 Failed
    pub fn cancel(&self, task_id: TaskId) -> Result<CancelOutcome> {
        loop {
            if let Some((_, record)) = self
                .inner
                .tasks
                .remove_if(&task_id, |_, r| r.task.status == UploadTaskStatus::Queued)
            {
                self.inner.queue.remove(&task_id);
                info!("取消排队任务: task={}, file={}", task_id, record.task.filename);
                self.inner.forget(&record.task);
                return Ok(CancelOutcome::Removed);
            }

            let record = self
                .inner
                .tasks
                .get(&task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;

            match record.task.status {
                UploadTaskStatus::Active => {
                    record.cancel_token.cancel();
                    info!(
                        "请求中断上传: task={}, attempt={}",
                        task_id, record.task.attempt
                    );
                    return Ok(CancelOutcome::Interrupting);
                }
                // 两次查找之间被重新排队
                UploadTaskStatus::Queued => continue,
                status => {
                    warn!("无法取消任务: task={}, status={}", task_id, status);
                    return Err(SchedulerError::InvalidState {
                        task_id,
                        status,
                        operation: "取消",
                    });
                }
            }
        }
    }

    /// 停止跟踪单个任务（任意状态）
    ///
    /// 上传中的任务不会被中断，但其结果会被丢弃
    pub fn remove_task(&self, task_id: TaskId) -> Result<UploadTask> {
        let (_, record) = self
            .inner
            .tasks
            .remove(&task_id)
            .ok_or(SchedulerError::UnknownTask(task_id))?;
        self.inner.queue.remove(&task_id);
        info!(
            "移除任务: task={}, status={}",
            task_id, record.task.status
        );
        self.inner.forget(&record.task);
        Ok(record.task)
    }

    /// 清空批次，返回移除的任务数
    pub fn clear_batch(&self, batch_id: BatchId) -> usize {
        let removed = self.inner.clear_where(|task| task.batch_id == batch_id);
        info!("清空批次: batch={}, removed={}", batch_id, removed);
        removed
    }

    /// 清空所有任务
    pub fn clear_all(&self) -> usize {
        let removed = self.inner.clear_where(|_| true);
        info!("清空所有上传任务: removed={}", removed);
        removed
    }

    /// 清除已完成的任务
    pub fn clear_completed(&self) -> usize {
        let removed = self
            .inner
            .clear_where(|task| task.status == UploadTaskStatus::Completed);
        info!("清除已完成的上传任务: removed={}", removed);
        removed
    }

    /// 清除失败的任务
    pub fn clear_failed(&self) -> usize {
        let removed = self
            .inner
            .clear_where(|task| task.status == UploadTaskStatus::Failed);
        info!("清除失败的上传任务: removed={}", removed);
        removed
    }

    /// 所有任务的快照，按提交顺序排列
    pub fn snapshot(&self) -> Vec<UploadTask> {
        self.inner.collect(|_| true)
    }

    pub fn task(&self, task_id: TaskId) -> Option<UploadTask> {
        self.inner.tasks.get(&task_id).map(|r| r.task.clone())
    }

    /// 单个批次的快照，按提交顺序排列
    pub fn batch_snapshot(&self, batch_id: BatchId) -> Vec<UploadTask> {
        self.inner.collect(|task| task.batch_id == batch_id)
    }

    /// 对外展示的状态记录
    pub fn status_views(&self) -> Vec<TaskStatusView> {
        self.snapshot().iter().map(UploadTask::status_view).collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.count(UploadTaskStatus::Active)
    }

    pub fn queued_count(&self) -> usize {
        self.inner.count(UploadTaskStatus::Queued)
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.gate.max_slots()
    }

    /// 运行时调整并发上限
    ///
    /// 缩容不会中断正在上传的任务
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<()> {
        if max_concurrent == 0 {
            return Err(SchedulerError::Config(
                "max_concurrent_uploads 必须大于 0".to_string(),
            ));
        }
        self.inner.gate.resize(max_concurrent);
        debug!("槽位状态: {:?}", self.inner.gate.slots_status());
        self.inner.pump();
        Ok(())
    }

    /// 是否没有排队任务且没有进行中的传输
    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// 等待调度器空闲
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// 等待批次内仍被跟踪的任务全部进入终态，返回批次快照
    pub async fn wait_batch(&self, batch_id: BatchId) -> Result<Vec<UploadTask>> {
        if self.batch_snapshot(batch_id).is_empty() {
            return Err(SchedulerError::UnknownBatch(batch_id));
        }

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.batch_snapshot(batch_id);
            if batch.iter().all(|task| task.status.is_terminal()) {
                return Ok(batch);
            }
            notified.await;
        }
    }

    /// 订阅状态事件
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        let receiver = self.inner.publisher.subscribe();
        debug!(
            "新增事件订阅者，当前共 {} 个",
            self.inner.publisher.subscriber_count()
        );
        receiver
    }

    /// 当前占用的槽位数（含已被移除但仍在传输的任务）
    pub fn slots_in_use(&self) -> usize {
        self.inner.gate.used()
    }
}

impl SchedulerInner {
    /// 推进队列：在有空闲槽位时按 FIFO 准入任务
    ///
    /// 持锁期间只做内存操作，作业在释放锁之后才派发
    fn pump(self: &Arc<Self>) {
        let mut events = Vec::new();
        let mut jobs = Vec::new();

        {
            let _admission = self.admission.lock();
            while self.gate.available() > 0 {
                let Some(task_id) = self.queue.dequeue() else {
                    break;
                };

                let Some(mut record) = self.tasks.get_mut(&task_id) else {
                    debug!("跳过已移除的任务: {}", task_id);
                    continue;
                };
                if record.task.status != UploadTaskStatus::Queued {
                    debug!(
                        "跳过非排队状态的任务: task={}, status={}",
                        task_id, record.task.status
                    );
                    continue;
                }

                let Some(slot) = self.gate.try_acquire(task_id) else {
                    drop(record);
                    self.queue.push_front(task_id);
                    break;
                };

                record.task.mark_active();
                record.cancel_token = CancellationToken::new();
                record.throttler.reset();

                info!(
                    "开始上传: task={}, file={}, attempt={}, slot={}",
                    task_id,
                    record.task.filename,
                    record.task.attempt,
                    slot.slot_id()
                );

                events.push(UploadEvent::StatusChanged {
                    task_id,
                    batch_id: record.task.batch_id,
                    old_status: UploadTaskStatus::Queued,
                    new_status: UploadTaskStatus::Active,
                    attempt: record.task.attempt,
                });
                jobs.push(TransferJob {
                    task_id,
                    attempt: record.task.attempt,
                    source: record.task.source.clone(),
                    destination_key: record.task.destination_key.clone(),
                    cancel_token: record.cancel_token.clone(),
                    slot,
                });
            }
        }

        for event in events {
            self.publisher.publish(event);
        }
        for job in jobs {
            self.runtime.spawn(Arc::clone(self).run_transfer(job));
        }
    }

    /// 执行一次传输尝试
    async fn run_transfer(self: Arc<Self>, job: TransferJob) {
        let TransferJob {
            task_id,
            attempt,
            source,
            destination_key,
            cancel_token,
            slot,
        } = job;

        let progress = {
            let inner = Arc::clone(&self);
            TransferProgress::new(move |percent| inner.on_progress(task_id, attempt, percent))
        };

        let outcome = {
            let transfer = AssertUnwindSafe(self.store.transfer(
                &source,
                &destination_key,
                &progress,
            ))
            .catch_unwind();

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => Err(CANCELLED_MESSAGE.to_string()),
                result = transfer => match result {
                    Ok(Ok(locator)) => Ok(locator),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => Err(format!("存储后端异常: {}", panic_message(payload.as_ref()))),
                },
            }
        };
        drop(progress);

        self.finish(task_id, attempt, outcome);

        debug!("归还上传槽位: slot={}, task={}", slot.slot_id(), task_id);
        slot.release();
        self.pump();
        self.changed.notify_waiters();
    }

    /// 回写传输结果，过期的尝试或已不再跟踪的任务直接丢弃
    fn finish(&self, task_id: TaskId, attempt: u32, outcome: std::result::Result<String, String>) {
        let event = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                debug!("任务已移除，丢弃传输结果: task={}", task_id);
                return;
            };
            if record.task.attempt != attempt || record.task.status != UploadTaskStatus::Active {
                debug!(
                    "丢弃过期的传输结果: task={}, attempt={}, current={}",
                    task_id, attempt, record.task.attempt
                );
                return;
            }

            let batch_id = record.task.batch_id;
            record.throttler.force_emit();
            match outcome {
                Ok(locator) => {
                    info!(
                        "上传完成: task={}, file={}, locator={}",
                        task_id, record.task.filename, locator
                    );
                    record.task.mark_completed(locator.clone());
                    UploadEvent::Completed {
                        task_id,
                        batch_id,
                        locator,
                        attempt,
                    }
                }
                Err(error) => {
                    warn!(
                        "上传失败: task={}, file={}, attempt={}, error={}",
                        task_id, record.task.filename, attempt, error
                    );
                    record.task.mark_failed(error.clone());
                    UploadEvent::Failed {
                        task_id,
                        batch_id,
                        error,
                        attempt,
                    }
                }
            }
        };
        self.publisher.publish(event);
    }

    fn on_progress(&self, task_id: TaskId, attempt: u32, percent: u8) {
        let event = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if record.task.attempt != attempt || !record.task.advance_progress(percent) {
                return;
            }

            let emit = if record.task.progress >= 100 {
                record.throttler.force_emit()
            } else {
                record.throttler.should_emit()
            };
            if !emit {
                return;
            }

            UploadEvent::Progress {
                task_id,
                batch_id: record.task.batch_id,
                progress: record.task.progress,
            }
        };
        debug!("上传进度: {:?}", event);
        self.publisher.publish(event);
    }

    /// Failed -> Queued 并追加到队尾，不推进队列
    fn requeue_failed(&self, task_id: TaskId) -> Result<()> {
        let event = {
            let mut record = self
                .tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::UnknownTask(task_id))?;

            if record.task.status != UploadTaskStatus::Failed {
                warn!(
                    "无法重试任务: task={}, status={}",
                    task_id, record.task.status
                );
                return Err(SchedulerError::InvalidState {
                    task_id,
                    status: record.task.status,
                    operation: "重试",
                });
            }

            record.task.mark_requeued();
            record.throttler.reset();
            info!(
                "任务重新排队: task={}, file={}, attempts={}",
                task_id, record.task.filename, record.task.attempt
            );

            UploadEvent::StatusChanged {
                task_id,
                batch_id: record.task.batch_id,
                old_status: UploadTaskStatus::Failed,
                new_status: UploadTaskStatus::Queued,
                attempt: record.task.attempt,
            }
        };

        self.publisher.publish(event);
        self.queue.enqueue(task_id);
        Ok(())
    }

    /// 移除满足条件的任务，返回移除数量
    fn clear_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&UploadTask) -> bool,
    {
        let candidates: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| predicate(&entry.task))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = HashSet::new();
        for task_id in candidates {
            // 收集之后状态可能已变化，移除时重新判断
            if let Some((_, record)) = self.tasks.remove_if(&task_id, |_, r| predicate(&r.task)) {
                self.publisher.publish(UploadEvent::Deleted {
                    task_id,
                    batch_id: record.task.batch_id,
                });
                removed.insert(task_id);
            }
        }

        if !removed.is_empty() {
            self.queue.retain(|task_id| !removed.contains(task_id));
            self.changed.notify_waiters();
        }
        removed.len()
    }

    /// 任务已从任务表删除后的收尾
    fn forget(&self, task: &UploadTask) {
        self.publisher.publish(UploadEvent::Deleted {
            task_id: task.id,
            batch_id: task.batch_id,
        });
        self.changed.notify_waiters();
    }

    fn collect<F>(&self, predicate: F) -> Vec<UploadTask>
    where
        F: Fn(&UploadTask) -> bool,
    {
        let mut tasks: Vec<(u64, UploadTask)> = self
            .tasks
            .iter()
            .filter(|entry| predicate(&entry.task))
            .map(|entry| (entry.seq, entry.task.clone()))
            .collect();
        tasks.sort_by_key(|(seq, _)| *seq);
        tasks.into_iter().map(|(_, task)| task).collect()
    }

    fn count(&self, status: UploadTaskStatus) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.task.status == status)
            .count()
    }

    fn is_idle(&self) -> bool {
        let _admission = self.admission.lock();
        self.queue.is_empty() && self.gate.used() == 0
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}
