use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Monitor 上的具名等待条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// 有新帧入队
    QueueNotEmpty,
    /// 队列腾出空间
    QueueNotFull,
    /// 解码器状态或播放意图改变
    StateChanged,
}

/// 单一互斥锁 + 具名条件变量
///
/// 所有跨线程共享的解码器状态都放在 T 里；锁不可重入，持有 guard 时不能再次 lock
pub struct Monitor<T> {
    inner: Mutex<T>,
    queue_not_empty: Condvar,
    queue_not_full: Condvar,
    state_changed: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            queue_not_empty: Condvar::new(),
            queue_not_full: Condvar::new(),
            state_changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    fn condvar(&self, condition: WaitCondition) -> &Condvar {
        match condition {
            WaitCondition::QueueNotEmpty => &self.queue_not_empty,
            WaitCondition::QueueNotFull => &self.queue_not_full,
            WaitCondition::StateChanged => &self.state_changed,
        }
    }

    /// 等待条件被通知（可能伪唤醒，调用方需重新检查）
    pub fn wait(&self, guard: &mut MutexGuard<'_, T>, condition: WaitCondition) {
        self.condvar(condition).wait(guard);
    }

    /// 带超时等待，返回 true 表示超时
    pub fn wait_for(
        &self,
        guard: &mut MutexGuard<'_, T>,
        condition: WaitCondition,
        timeout: Duration,
    ) -> bool {
        self.condvar(condition).wait_for(guard, timeout).timed_out()
    }

    /// 在 predicate 为 true 时持续等待
    pub fn wait_while<F>(&self, guard: &mut MutexGuard<'_, T>, condition: WaitCondition, mut predicate: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        while predicate(&mut **guard) {
            self.condvar(condition).wait(guard);
        }
    }

    pub fn notify(&self, condition: WaitCondition) {
        self.condvar(condition).notify_all();
    }

    /// 唤醒所有条件上的等待者（状态转换时使用）
    pub fn notify_all(&self) {
        self.queue_not_empty.notify_all();
        self.queue_not_full.notify_all();
        self.state_changed.notify_all();
    }
}
