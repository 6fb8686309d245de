//! 并发闸门
//!
//! 管理上传槽位，同一时刻最多 N 个任务处于上传中。
//! - 槽位通过 `SlotGuard` 持有，Drop 时自动归还，保证每次成功获取恰好归还一次
//! - 支持动态调整容量：扩容立即生效，缩容不打断已占用的槽位

use crate::uploader::task::TaskId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 默认最大并发上传数
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;

/// 上传槽位
#[derive(Debug, Clone)]
struct UploadSlot {
    /// 槽位ID
    id: usize,
    /// 占用此位的任务ID
    task_id: Option<TaskId>,
}

impl UploadSlot {
    fn new(id: usize) -> Self {
        Self { id, task_id: None }
    }

    fn is_free(&self) -> bool {
        self.task_id.is_none()
    }
}

#[derive(Debug)]
struct GateState {
    /// 最大槽位数（支持动态调整）
    max_slots: AtomicUsize,
    /// 槽位列表
    slots: Mutex<Vec<UploadSlot>>,
}

impl GateState {
    fn release(&self, slot_id: usize, task_id: &TaskId) {
        let mut slots = self.slots.lock();
        match slots.iter_mut().find(|s| s.id == slot_id) {
            Some(slot) if slot.task_id.as_ref() == Some(task_id) => {
                slot.task_id = None;
                debug!("释放上传槽位: slot_id={}, task_id={}", slot_id, task_id);
            }
            _ => {
                warn!("槽位释放异常: slot {} 不属于任务 {}", slot_id, task_id);
            }
        }

        // 缩容后遗留的超限空闲槽位在这里清理
        let max_slots = self.max_slots.load(Ordering::SeqCst);
        slots.retain(|s| s.id < max_slots || !s.is_free());
    }
}

/// 并发闸门
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    state: Arc<GateState>,
}

/// 已占用的槽位
///
/// Drop 时归还槽位，无论上传成功、失败还是 panic
#[derive(Debug)]
#[must_use = "槽位在 SlotGuard 被丢弃时立即释放"]
pub struct SlotGuard {
    state: Arc<GateState>,
    slot_id: usize,
    task_id: TaskId,
}

impl SlotGuard {
    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 显式归还槽位
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.release(self.slot_id, &self.task_id);
    }
}

impl ConcurrencyGate {
    /// 创建新的并发闸门
    pub fn new(max_slots: usize) -> Self {
        let slots = (0..max_slots).map(UploadSlot::new).collect();

        info!("创建上传并发闸门，最大槽位数: {}", max_slots);

        Self {
            state: Arc::new(GateState {
                max_slots: AtomicUsize::new(max_slots),
                slots: Mutex::new(slots),
            }),
        }
    }

    /// 获取最大槽位数
    pub fn max_slots(&self) -> usize {
        self.state.max_slots.load(Ordering::SeqCst)
    }

    /// 尝试获取槽位
    ///
    /// 已占用槽位数小于上限时成功，否则返回 None
    pub fn try_acquire(&self, task_id: TaskId) -> Option<SlotGuard> {
        let max_slots = self.max_slots();
        let mut slots = self.state.slots.lock();

        // 超出上限的槽位（缩容遗留）仍被占用时同样计数
        let used = slots.iter().filter(|s| !s.is_free()).count();
        if used >= max_slots {
            debug!("无可用上传槽位: task_id={}", task_id);
            return None;
        }

        let slot = slots
            .iter_mut()
            .find(|s| s.id < max_slots && s.is_free())?;
        slot.task_id = Some(task_id);
        debug!("分配上传槽位: slot_id={}, task_id={}", slot.id, task_id);

        Some(SlotGuard {
            state: self.state.clone(),
            slot_id: slot.id,
            task_id,
        })
    }

    /// 当前已占用槽位数
    pub fn used(&self) -> usize {
        self.state.slots.lock().iter().filter(|s| !s.is_free()).count()
    }

    /// 当前可用槽位数
    pub fn available(&self) -> usize {
        self.max_slots().saturating_sub(self.used())
    }

    /// 动态调整容量
    ///
    /// # 扩容策略
    /// - 直接追加新的空闲槽位
    ///
    /// # 缩容策略
    /// - 不会中断已占用的槽位，超出新上限的任务继续运行到完成
    /// - 只移除空闲槽位，占用中的超限槽位在归还时清理
    /// - 已占用数回落到新上限以下之前不会有新的准入
    pub fn resize(&self, new_max: usize) {
        let old_max = self.max_slots();
        if new_max == old_max {
            debug!("上传并发闸门容量无需调整: {}", old_max);
            return;
        }

        let mut slots = self.state.slots.lock();

        if new_max > old_max {
            let existing: Vec<usize> = slots.iter().map(|s| s.id).collect();
            for id in old_max..new_max {
                if !existing.contains(&id) {
                    slots.push(UploadSlot::new(id));
                }
            }
            slots.sort_by_key(|s| s.id);
            info!("上传并发闸门扩容: {} -> {}", old_max, new_max);
        } else {
            let occupied_beyond_limit = slots
                .iter()
                .filter(|s| s.id >= new_max && !s.is_free())
                .count();
            slots.retain(|s| s.id < new_max || !s.is_free());

            if occupied_beyond_limit > 0 {
                warn!(
                    "上传并发闸门缩容: {} -> {} (有 {} 个超出新上限的槽位仍被占用，将继续运行)",
                    old_max, new_max, occupied_beyond_limit
                );
            } else {
                info!("上传并发闸门缩容: {} -> {}", old_max, new_max);
            }
        }

        self.state.max_slots.store(new_max, Ordering::SeqCst);
    }

    /// 获取所有槽位状态（用于调试）
    pub fn slots_status(&self) -> Vec<(usize, Option<TaskId>)> {
        self.state
            .slots
            .lock()
            .iter()
            .map(|s| (s.id, s.task_id))
            .collect()
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_UPLOADS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gate_creation() {
        let gate = ConcurrencyGate::default();
        assert_eq!(gate.max_slots(), 3);
        assert_eq!(gate.available(), 3);
        assert_eq!(gate.used(), 0);
    }

    #[test]
    fn test_try_acquire_until_full() {
        let gate = ConcurrencyGate::new(2);

        let first = gate.try_acquire(TaskId::new());
        assert_eq!(first.as_ref().map(|g| g.slot_id()), Some(0));

        let second = gate.try_acquire(TaskId::new());
        assert_eq!(second.as_ref().map(|g| g.slot_id()), Some(1));

        assert!(gate.try_acquire(TaskId::new()).is_none());
        assert_eq!(gate.used(), 2);
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn test_release_on_drop() {
        let gate = ConcurrencyGate::new(1);
        let task_id = TaskId::new();

        {
            let guard = gate.try_acquire(task_id).unwrap();
            assert_eq!(guard.task_id(), task_id);
            assert_eq!(gate.used(), 1);
        }

        assert_eq!(gate.used(), 0);
        assert!(gate.try_acquire(TaskId::new()).is_some());
    }

    #[test]
    fn test_explicit_release() {
        let gate = ConcurrencyGate::new(1);
        let guard = gate.try_acquire(TaskId::new()).unwrap();
        guard.release();
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_release_after_panic() {
        let gate = ConcurrencyGate::new(1);
        let gate_clone = gate.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = gate_clone.try_acquire(TaskId::new()).unwrap();
            panic!("transfer blew up");
        }));

        assert!(result.is_err());
        assert_eq!(gate.used(), 0);
    }

    #[test]
    fn test_resize_expand() {
        let gate = ConcurrencyGate::new(2);
        let _a = gate.try_acquire(TaskId::new()).unwrap();
        let _b = gate.try_acquire(TaskId::new()).unwrap();
        assert!(gate.try_acquire(TaskId::new()).is_none());

        gate.resize(4);
        assert_eq!(gate.max_slots(), 4);
        assert_eq!(gate.available(), 2);

        let _c = gate.try_acquire(TaskId::new()).unwrap();
        let _d = gate.try_acquire(TaskId::new()).unwrap();
        assert_eq!(gate.used(), 4);
    }

    #[test]
    fn test_resize_shrink_with_occupied_slots() {
        let gate = ConcurrencyGate::new(3);
        let a = gate.try_acquire(TaskId::new()).unwrap();
        let b = gate.try_acquire(TaskId::new()).unwrap();
        let c = gate.try_acquire(TaskId::new()).unwrap();

        gate.resize(1);
        assert_eq!(gate.max_slots(), 1);
        // 已占用的槽位继续运行
        assert_eq!(gate.used(), 3);
        assert_eq!(gate.available(), 0);

        drop(c);
        drop(b);
        // 仍有 1 个占用，等于新上限
        assert!(gate.try_acquire(TaskId::new()).is_none());

        drop(a);
        let next = gate.try_acquire(TaskId::new()).unwrap();
        assert_eq!(next.slot_id(), 0);
        assert_eq!(gate.slots_status().len(), 1);
    }

    #[test]
    fn test_resize_no_change() {
        let gate = ConcurrencyGate::new(3);
        let _a = gate.try_acquire(TaskId::new()).unwrap();
        gate.resize(3);
        assert_eq!(gate.used(), 1);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire() {
        let gate = ConcurrencyGate::new(5);
        let mut handles = Vec::new();

        for _ in 0..20 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.try_acquire(TaskId::new()) }));
        }

        let mut guards = Vec::new();
        for handle in handles {
            if let Some(guard) = handle.await.unwrap() {
                guards.push(guard);
            }
        }

        assert_eq!(guards.len(), 5);
        assert_eq!(gate.used(), 5);

        guards.clear();
        assert_eq!(gate.used(), 0);
    }

    proptest! {
        // 任意 acquire/release 序列下，已占用数不超过上限，且全部归还后回到 0
        #[test]
        fn prop_slots_never_exceed_limit(
            limit in 1usize..6,
            ops in proptest::collection::vec(any::<bool>(), 1..80),
        ) {
            let gate = ConcurrencyGate::new(limit);
            let mut held: Vec<SlotGuard> = Vec::new();

            for acquire in ops {
                if acquire {
                    if let Some(guard) = gate.try_acquire(TaskId::new()) {
                        held.push(guard);
                    }
                } else if !held.is_empty() {
                    held.remove(0);
                }
                prop_assert!(gate.used() <= limit);
                prop_assert_eq!(gate.used(), held.len());
            }

            held.clear();
            prop_assert_eq!(gate.used(), 0);
        }
    }
}
