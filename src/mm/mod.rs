//! 内存管理模块

use crate::consts::PGSIZE;

pub use addr::{pg_round_down, pg_round_up, PhysAddr};
pub use kalloc::Kmem;

mod addr;
pub mod kalloc;
mod list;

/// 按页对齐的一整页内存，可用来静态地预留交给 [`Kmem`] 管理的区间
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE],
}

impl RawSinglePage {
    pub const fn new() -> Self {
        Self { data: [0; PGSIZE] }
    }
}

impl Default for RawSinglePage {
    fn default() -> Self {
        Self::new()
    }
}
