//! xv6 风格内核的内存管理层：物理页帧分配器与分桶的块缓存。
//!
//! 内核之外的部分（调度、时钟、块设备驱动）通过 [`Scheduler`]、[`TickSource`]
//! 与 [`BlockDevice`] 三个接口接入。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

#[cfg(test)]
mod testing;

pub use clock::{TickSource, Ticks};
pub use driver::{BlockDevice, RamDisk};
pub use error::{KernelError, Result};
pub use fs::{Bcache, Buf, BufData};
pub use mm::{Kmem, PhysAddr};
pub use process::{Pid, Scheduler};
