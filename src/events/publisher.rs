use super::{TimestampedEvent, UploadEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

/// 默认事件通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// 任务状态发布器
///
/// 基于 broadcast 通道，发布永不阻塞调度器；
/// 订阅者处理过慢时会收到 `Lagged`，可通过快照重新同步
#[derive(Debug)]
pub struct StatusPublisher {
    sender: broadcast::Sender<TimestampedEvent>,
    event_id_counter: AtomicU64,
}

impl StatusPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            event_id_counter: AtomicU64::new(1),
        }
    }

    /// 发布事件，没有订阅者时直接丢弃
    pub fn publish(&self, event: UploadEvent) {
        let event_id = self.event_id_counter.fetch_add(1, Ordering::SeqCst);
        trace!(
            "发布事件: id={}, type={}, task={}",
            event_id,
            event.event_type_name(),
            event.task_id()
        );
        let _ = self.sender.send(TimestampedEvent::new(event_id, event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::{BatchId, TaskId};

    fn deleted() -> UploadEvent {
        UploadEvent::Deleted {
            task_id: TaskId::new(),
            batch_id: BatchId::new(),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = StatusPublisher::new(4);
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(deleted());
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let publisher = StatusPublisher::new(16);
        let mut rx1 = publisher.subscribe();
        let mut rx2 = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        let first = deleted();
        let second = deleted();
        publisher.publish(first.clone());
        publisher.publish(second.clone());

        for rx in [&mut rx1, &mut rx2] {
            let a = rx.recv().await.unwrap();
            let b = rx.recv().await.unwrap();
            assert_eq!(a.event, first);
            assert_eq!(b.event, second);
            assert!(a.event_id < b.event_id);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let publisher = StatusPublisher::new(2);
        let mut rx = publisher.subscribe();

        for _ in 0..5 {
            publisher.publish(deleted());
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
