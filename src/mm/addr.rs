//! 提供物理地址包装

use core::convert::TryFrom;
use core::fmt;
use core::result::Result;

use crate::consts::PGSIZE;

/// 向上对齐到页边界
#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

/// 向下对齐到页边界
#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// 物理地址。
///
/// 通过 `TryFrom<usize>` 构造的地址保证按页对齐；`from_raw` 不做检查，
/// 页帧分配器会在 `kfree` / `add_ref` 时再次校验。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub(super) usize);

impl PhysAddr {
    /// # 安全性
    /// 调用者保证 `raw` 是一个真实的物理地址。
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn into_raw(self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    #[inline]
    pub fn is_page_aligned(&self) -> bool {
        self.0 % PGSIZE == 0
    }
}

impl TryFrom<usize> for PhysAddr {
    type Error = &'static str;

    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr % PGSIZE != 0 {
            return Err("PhysAddr addr not aligned");
        }
        Ok(PhysAddr(addr))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}
