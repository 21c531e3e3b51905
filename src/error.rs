//! 内核错误类型
//!
//! 只有资源耗尽会作为 `Result` 返回给调用者；其余两类表示内核内部不变量被破坏，
//! 一律通过 [`KernelError::fatal`] 停机。

use core::fmt;

/// 内存管理层的错误分类。
///
/// 携带的字符串标明出错的位置（通常是函数名），随 panic 信息一起输出。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// 没有空闲页帧，或所有缓冲块都在被引用
    ResourceExhausted(&'static str),
    /// 未持有所有权锁就提交/释放缓冲块，或重复释放
    LockDisciplineViolation(&'static str),
    /// 释放未对齐、越界或已经完全释放的页帧
    AllocatorCorruption(&'static str),
}

impl KernelError {
    /// 错误类别的名字，也是 panic 信息的前缀
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ResourceExhausted(_) => "resource exhausted",
            Self::LockDisciplineViolation(_) => "lock discipline violation",
            Self::AllocatorCorruption(_) => "allocator corruption",
        }
    }

    pub const fn site(&self) -> &'static str {
        match self {
            Self::ResourceExhausted(site)
            | Self::LockDisciplineViolation(site)
            | Self::AllocatorCorruption(site) => site,
        }
    }

    /// 报告错误并停机。
    ///
    /// 这是内核的致命错误出口：先以 error 级别记录日志，再 panic，
    /// 调用者不会得到任何恢复的机会。
    #[cold]
    #[track_caller]
    pub fn fatal(self) -> ! {
        halt(format_args!("{}", self))
    }
}

/// 不属于任何错误类别的致命错误（初始化顺序错误、驱动收到越界请求等）的出口，
/// 与 [`KernelError::fatal`] 一样先记录 error 级别日志再 panic。
#[cold]
#[track_caller]
pub fn halt(msg: fmt::Arguments<'_>) -> ! {
    log::error!("{}", msg);
    panic!("{}", msg)
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.site())
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
