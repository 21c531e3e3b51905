//! 进程调度接口
//!
//! 内存管理层本身不实现调度，只通过 [`Scheduler`] 向调度器借用三件事：
//! 当前进程号、让当前进程睡眠、唤醒指定进程。睡眠锁依赖这些操作
//! 实现阻塞等待。

/// 进程号
pub type Pid = usize;

/// 调度器提供给睡眠锁的最小接口。
///
/// # 语义约定
/// `park` / `unpark` 采用“令牌”语义：若 `unpark(pid)` 先于该进程的 `park()`
/// 到达，则随后的 `park()` 立即返回，唤醒不会丢失。`park()` 允许虚假返回，
/// 调用者必须在循环中重新检查等待条件。
pub trait Scheduler: Sync {
    /// 当前正在运行的进程号，在进程的整个生命周期内保持不变
    fn my_pid(&self) -> Pid;

    /// 让当前进程睡眠，直到被 `unpark` 唤醒
    fn park(&self);

    /// 唤醒进程 `pid`
    fn unpark(&self, pid: Pid);
}
