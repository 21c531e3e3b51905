//! 时钟计数

use core::sync::atomic::{AtomicU64, Ordering};

/// 单调递增的时钟源。
///
/// 读取不加锁；读到稍旧的值是可以接受的，块缓存只用它给空闲缓冲块排序。
pub trait TickSource: Sync {
    fn ticks(&self) -> u64;
}

/// 全局时钟计数器，由时钟中断推进
pub struct Ticks(AtomicU64);

impl Ticks {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// 处理一次时钟中断
    pub fn clock_intr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for Ticks {
    fn ticks(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
