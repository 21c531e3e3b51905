//! 空闲页帧链表
//!
//! 侵入式单链表：每个空闲页帧的第一个机器字被解释为指向下一个空闲页帧的指针，
//! 链表本身只保存表头。这种复用空闲内存的做法只在本模块内出现。

use core::ptr;

use crate::consts::PGSIZE;

#[repr(C)]
struct Run {
    next: *mut Run,
}

pub struct FreeList {
    head: *mut Run,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// 把 `raw_addr` 处的页帧压入链表头部。
    ///
    /// # 安全性
    /// `raw_addr` 必须按页对齐、指向一整页可写内存，且在弹出之前
    /// 不被任何其他代码访问。
    pub unsafe fn push(&mut self, raw_addr: usize) {
        debug_assert_eq!(raw_addr % PGSIZE, 0);
        let run = raw_addr as *mut Run;
        ptr::write(run, Run { next: self.head });
        self.head = run;
    }

    /// 弹出链表头部的页帧，链表为空时返回 `None`。
    ///
    /// # 安全性
    /// 链表中的每个页帧都必须是经由 `push` 放入且之后未被改写的。
    pub unsafe fn pop(&mut self) -> Option<usize> {
        if self.head.is_null() {
            return None;
        }
        let run = self.head;
        self.head = ptr::read(run).next;
        Some(run as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}
