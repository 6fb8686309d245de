//! 等待队列
//!
//! 尚未获得槽位的任务按提交顺序排队（FIFO），重试的任务追加到队尾

use crate::uploader::task::TaskId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// 任务等待队列
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<TaskId>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加到队尾
    pub fn enqueue(&self, task_id: TaskId) {
        self.inner.lock().push_back(task_id);
    }

    /// 批量追加，保持给定顺序
    pub fn enqueue_all<I>(&self, task_ids: I)
    where
        I: IntoIterator<Item = TaskId>,
    {
        self.inner.lock().extend(task_ids);
    }

    /// 取出队首任务，队列为空时返回 None
    pub fn dequeue(&self) -> Option<TaskId> {
        self.inner.lock().pop_front()
    }

    /// 放回队首（出队后未能获得槽位时使用）
    pub fn push_front(&self, task_id: TaskId) {
        self.inner.lock().push_front(task_id);
    }

    /// 移除指定任务，返回是否存在
    pub fn remove(&self, task_id: &TaskId) -> bool {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|id| id != task_id);
        queue.len() != before
    }

    /// 只保留满足条件的任务，返回移除数量
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&TaskId) -> bool,
    {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|id| keep(id));
        before - queue.len()
    }

    #[cfg(test)]
    fn contains(&self, task_id: &TaskId) -> bool {
        self.inner.lock().contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<TaskId> {
        self.inner.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        let ids: Vec<TaskId> = (0..4).map(|_| TaskId::new()).collect();

        queue.enqueue_all(ids.clone());
        assert_eq!(queue.len(), 4);

        for id in &ids {
            assert_eq!(queue.dequeue(), Some(*id));
        }
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_goes_to_tail() {
        let queue = TaskQueue::new();
        let first = TaskId::new();
        let second = TaskId::new();
        let third = TaskId::new();

        queue.enqueue(first);
        queue.enqueue(second);

        // first 被取出后失败重试，应排在 second 和 third 之后
        assert_eq!(queue.dequeue(), Some(first));
        queue.enqueue(third);
        queue.enqueue(first);

        assert_eq!(queue.pending(), vec![second, third, first]);
    }

    #[test]
    fn test_remove_and_retain() {
        let queue = TaskQueue::new();
        let ids: Vec<TaskId> = (0..5).map(|_| TaskId::new()).collect();
        queue.enqueue_all(ids.clone());

        assert!(queue.remove(&ids[2]));
        assert!(!queue.remove(&ids[2]));
        assert!(!queue.contains(&ids[2]));

        let removed = queue.retain(|id| *id != ids[0] && *id != ids[4]);
        assert_eq!(removed, 2);
        assert_eq!(queue.pending(), vec![ids[1], ids[3]]);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_dequeue() {
        let queue = Arc::new(TaskQueue::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    queue.enqueue(TaskId::new());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut drained = 0;
        while queue.dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 400);
    }

    proptest! {
        #[test]
        fn prop_dequeue_order_matches_enqueue_order(count in 0usize..64) {
            let queue = TaskQueue::new();
            let ids: Vec<TaskId> = (0..count).map(|_| TaskId::new()).collect();
            for id in &ids {
                queue.enqueue(*id);
            }

            let mut out = Vec::new();
            while let Some(id) = queue.dequeue() {
                out.push(id);
            }
            prop_assert_eq!(out, ids);
        }
    }
}
