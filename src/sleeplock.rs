//! 睡眠锁模块
//! 提供基于进程休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的进程会排入等待队列并进入休眠状态，避免忙等待。
//! 块缓存用它作为每个缓冲块的所有权锁，持有期间可以进行磁盘 I/O。

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};

use arrayvec::ArrayVec;

use crate::consts::NPROC;
use crate::error::{halt, KernelError};
use crate::process::{Pid, Scheduler};
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的进程会进入休眠状态，
/// 直到锁被释放后被唤醒。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护锁状态与等待队列
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<SleepState>,
    name: &'static str,
    data: UnsafeCell<T>,
}

/// 睡眠锁的内部状态，由内部自旋锁保护。
struct SleepState {
    /// 锁是否已被占用
    locked: bool,
    /// 持有者的进程号，仅在 `locked` 为真时有意义
    pid: Pid,
    /// 按到达顺序排队的等待者
    waiters: ArrayVec<Pid, NPROC>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new(
                SleepState {
                    locked: false,
                    pid: 0,
                    waiters: ArrayVec::new_const(),
                },
                "sleeplock",
            ),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞进程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查锁状态：
    ///   - 如果已锁定：把当前进程排入等待队列，释放内部自旋锁后睡眠，
    ///     被唤醒后重新获取内部自旋锁并再次检查
    ///   - 如果未锁定：记录持有者并返回守卫
    /// 3. 释放内部自旋锁（锁状态已记录，无需继续保护）
    ///
    /// 没有超时，也不能取消：调用者一直等待，直到持有者释放。
    ///
    /// # 可能的错误
    /// - 持有者再次获取同一把锁会造成自死锁，视为锁纪律违例而停机；
    /// - 等待者超过 `NPROC` 个说明进程号重复或锁状态被破坏，同样停机。
    pub fn lock<'a>(&'a self, sched: &'a dyn Scheduler) -> SleepLockGuard<'a, T> {
        let me = sched.my_pid();
        let mut guard = self.lock.lock();
        if guard.locked && guard.pid == me {
            drop(guard);
            KernelError::LockDisciplineViolation("sleeplock acquire").fatal();
        }

        while guard.locked {
            if !guard.waiters.contains(&me) && guard.waiters.try_push(me).is_err() {
                drop(guard);
                halt(format_args!("sleeplock {}: too many waiters", self.name));
            }
            drop(guard);
            sched.park();
            guard = self.lock.lock();
        }

        guard.locked = true;
        guard.pid = me;
        // 虚假唤醒后抢到锁的进程可能还留在队列里
        guard.waiters.retain(|pid| *pid != me);
        drop(guard);

        SleepLockGuard {
            lock: self,
            sched,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 当前进程是否持有该锁
    pub fn holding(&self, sched: &dyn Scheduler) -> bool {
        let guard = self.lock.lock();
        guard.locked && guard.pid == sched.my_pid()
    }

    /// 锁名，用于调试输出
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// 清除锁状态后唤醒队首的等待者。被唤醒者仍需与新来的进程竞争，
    /// 竞争失败时会重新排队。
    fn unlock(&self, sched: &dyn Scheduler) {
        let mut guard = self.lock.lock();
        if !guard.locked || guard.pid != sched.my_pid() {
            drop(guard);
            KernelError::LockDisciplineViolation("sleeplock release").fatal();
        }
        guard.locked = false;
        let next = if guard.waiters.is_empty() {
            None
        } else {
            Some(guard.waiters.remove(0))
        };
        drop(guard);

        if let Some(pid) = next {
            sched.unpark(pid);
        }
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 睡眠锁属于进程而不是 CPU，守卫因此不能被移交给其他进程（`!Send`）。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    sched: &'a dyn Scheduler,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 当前进程是否仍持有守卫对应的锁
    pub fn holding(&self) -> bool {
        self.lock.holding(self.sched)
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁并唤醒一个等待者
    fn drop(&mut self) {
        self.lock.unlock(self.sched);
    }
}
