//! 物理页帧分配器
//!
//! 以整页（4096 字节）为单位为用户进程、内核栈、页表页和管道缓冲区分配物理内存。
//! 每个页帧带一个引用计数，支持多个所有者共享同一页帧（例如写时复制）。

use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::slice;

use crate::consts::mm::{JUNK_ALLOC, JUNK_FREE};
use crate::consts::{PGSHIFT, PGSIZE};
use crate::error::{halt, KernelError, Result};
use crate::spinlock::SpinLock;

use super::addr::{pg_round_down, pg_round_up, PhysAddr};
use super::list::FreeList;

/// 页帧分配器。
///
/// 引用计数表和空闲链表由同一把自旋锁保护，因此 `kalloc`、`kfree`、
/// `add_ref` 彼此之间是原子的：计数的修改与链表的修改在同一个临界区内完成，
/// 不会出现某个页帧刚被释放并重新分配、而另一处仍以为可以安全增加其计数的情况。
///
/// 在调用 [`Kmem::kinit`] 之前，分配总是失败。
pub struct Kmem(SpinLock<FrameTable>);

impl Kmem {
    pub const fn new() -> Self {
        Self(SpinLock::new(FrameTable::uninit(), "kmem"))
    }

    /// 初始化页帧分配器。
    ///
    /// # 功能说明
    /// 管理区间 `[start, end)`（两端分别向内对齐到页边界）。区间开头的若干页
    /// 用来存放引用计数表，它们的计数永久为 1，不参与分配；其余页帧的计数先被
    /// 置为 1，再逐一“释放”到空闲链表上。
    ///
    /// # 可能的错误
    /// - 重复初始化、或区间放不下计数表之外的任何页帧时直接 panic。
    ///
    /// # 安全性
    /// - 调用者保证 `[start, end)` 是有效、可写、且此后只归分配器支配的物理内存；
    /// - 必须在任何分配操作之前调用，且只调用一次。
    pub unsafe fn kinit(&self, start: usize, end: usize) {
        let mut table = self.0.lock();
        table.init(pg_round_up(start), pg_round_down(end));
        log::info!("kmem: available physical memory [{:#x}, {:#x})", start, end);

        #[cfg(feature = "verbose_init_info")]
        log::info!(
            "kmem: {} frames, first allocatable frame at {:#x}",
            table.nframes,
            table.first
        );

        log::info!("kmem: init memory done, {} free frames", table.nfree);
    }

    /// 分配一个物理页帧。
    ///
    /// 弹出空闲链表的表头并把它的引用计数从 0 置为 1（同一个临界区内完成），
    /// 然后用垃圾字节填满整页以暴露对未初始化内存的读取。不清零。
    ///
    /// # 返回值
    /// - `Ok(pa)`：新页帧的物理地址；
    /// - `Err(KernelError::ResourceExhausted)`：没有空闲页帧。
    pub fn kalloc(&self) -> Result<PhysAddr> {
        let raw = self.0.lock().pop();
        match raw {
            Some(raw) => {
                // 此时调用者是唯一的所有者，填充无需持锁
                unsafe { ptr::write_bytes(raw as *mut u8, JUNK_ALLOC, PGSIZE) };
                Ok(PhysAddr(raw))
            }
            None => {
                #[cfg(feature = "kernel_warning")]
                log::warn!("kalloc: out of memory");
                Err(KernelError::ResourceExhausted("kalloc"))
            }
        }
    }

    /// 放弃对页帧 `pa` 的一个引用。
    ///
    /// 引用计数减一；若减到 0，则用另一种垃圾字节填满整页（暴露释放后使用）
    /// 并放回空闲链表；否则页帧继续归其余所有者使用。
    ///
    /// # 可能的错误
    /// 以下情况均为分配器损坏，直接停机：
    /// - `pa` 未按页对齐，或不在可分配范围内；
    /// - `pa` 的引用计数已经为 0（重复释放）。
    pub fn kfree(&self, pa: PhysAddr) {
        self.0.lock().put(pa.into_raw());
    }

    /// 为已分配的页帧 `pa` 增加一个所有者，不触碰空闲链表。
    ///
    /// 对空闲页帧调用、地址非法或计数溢出都会导致停机。
    pub fn add_ref(&self, pa: PhysAddr) {
        self.0.lock().dup(pa.into_raw());
    }

    /// 页帧 `pa` 当前的引用计数。
    ///
    /// 写时复制的缺页处理据此决定是复制页面，还是直接复用唯一所有者的页面。
    pub fn ref_count(&self, pa: PhysAddr) -> u32 {
        let mut table = self.0.lock();
        let index = table.index(pa.into_raw(), "ref_count: bad address");
        table.refs()[index]
    }

    /// 空闲页帧的数目
    pub fn free_pages(&self) -> usize {
        self.0.lock().nfree
    }
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}

/// 引用计数表与空闲链表，整体由 [`Kmem`] 的自旋锁保护。
struct FrameTable {
    /// 受管区间的起点，也是计数表所在的位置
    base: usize,
    /// 第一个可分配的页帧，位于计数表之后
    first: usize,
    /// 受管区间的终点（不含）
    end: usize,
    /// 受管页帧总数，也是计数表的长度
    nframes: usize,
    /// 空闲链表上的页帧数
    nfree: usize,
    refs: NonNull<u32>,
    freelist: FreeList,
    initialized: bool,
}

// 裸指针只指向分配器独占的物理内存，并且只在持锁时解引用
unsafe impl Send for FrameTable {}

impl FrameTable {
    const fn uninit() -> Self {
        Self {
            base: 0,
            first: 0,
            end: 0,
            nframes: 0,
            nfree: 0,
            refs: NonNull::dangling(),
            freelist: FreeList::new(),
            initialized: false,
        }
    }

    unsafe fn init(&mut self, base: usize, end: usize) {
        if self.initialized {
            halt(format_args!("kmem: init twice"));
        }
        if base >= end {
            halt(format_args!("kmem: empty range [{:#x}, {:#x})", base, end));
        }

        let nframes = (end - base) / PGSIZE;
        let first = pg_round_up(base + nframes * size_of::<u32>());
        if first >= end {
            halt(format_args!("kmem: no frame left after frame table"));
        }

        self.base = base;
        self.first = first;
        self.end = end;
        self.nframes = nframes;
        self.refs = NonNull::new_unchecked(base as *mut u32);
        self.refs().fill(1);
        self.initialized = true;

        let mut pa = first;
        while pa + PGSIZE <= end {
            self.put(pa);
            pa += PGSIZE;
        }
    }

    fn refs(&mut self) -> &mut [u32] {
        unsafe { slice::from_raw_parts_mut(self.refs.as_ptr(), self.nframes) }
    }

    /// 校验 `pa` 并换算成计数表下标
    fn index(&self, pa: usize, site: &'static str) -> usize {
        if pa % PGSIZE != 0 || pa < self.first || pa >= self.end {
            KernelError::AllocatorCorruption(site).fatal();
        }
        (pa - self.base) >> PGSHIFT
    }

    fn pop(&mut self) -> Option<usize> {
        let raw = unsafe { self.freelist.pop() }?;
        let index = self.index(raw, "kalloc: bad free list entry");
        let refs = self.refs();
        if refs[index] != 0 {
            KernelError::AllocatorCorruption("kalloc: free frame is referenced").fatal();
        }
        refs[index] = 1;
        self.nfree -= 1;
        Some(raw)
    }

    fn put(&mut self, pa: usize) {
        let index = self.index(pa, "kfree: bad address");
        let refs = self.refs();
        if refs[index] == 0 {
            KernelError::AllocatorCorruption("kfree: double free").fatal();
        }
        refs[index] -= 1;
        if refs[index] != 0 {
            return;
        }

        unsafe {
            ptr::write_bytes(pa as *mut u8, JUNK_FREE, PGSIZE);
            self.freelist.push(pa);
        }
        self.nfree += 1;
    }

    fn dup(&mut self, pa: usize) {
        let index = self.index(pa, "add_ref: bad address");
        let refs = self.refs();
        if refs[index] == 0 {
            KernelError::AllocatorCorruption("add_ref: free frame").fatal();
        }
        match refs[index].checked_add(1) {
            Some(count) => refs[index] = count,
            None => KernelError::AllocatorCorruption("add_ref: refcount overflow").fatal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::RawSinglePage;
    use crate::testing::{capture_logs, logged};
    use log::Level;
    use std::panic::{self, AssertUnwindSafe};
    use std::collections::HashSet;
    use std::thread;

    /// 一块能容纳计数表外加 `usable` 个可分配页帧的内存
    fn arena(usable: usize) -> (Vec<RawSinglePage>, Kmem) {
        let mut pages: Vec<RawSinglePage> = (0..usable + 1).map(|_| RawSinglePage::new()).collect();
        let start = pages.as_mut_ptr() as usize;
        let end = start + pages.len() * PGSIZE;
        let kmem = Kmem::new();
        unsafe { kmem.kinit(start, end) };
        (pages, kmem)
    }

    #[test]
    fn four_frame_pool_exhausts_and_reuses() {
        let (_pages, kmem) = arena(4);
        assert_eq!(kmem.free_pages(), 4);

        let frames: Vec<PhysAddr> = (0..4).map(|_| kmem.kalloc().unwrap()).collect();
        let distinct: HashSet<PhysAddr> = frames.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
        assert!(frames.iter().all(|pa| pa.is_page_aligned()));

        assert_eq!(kmem.kalloc(), Err(KernelError::ResourceExhausted("kalloc")));

        kmem.kfree(frames[2]);
        assert_eq!(kmem.kalloc(), Ok(frames[2]));
    }

    #[test]
    fn alloc_then_free_restores_baseline() {
        let (_pages, kmem) = arena(8);
        let before = kmem.free_pages();

        let pa = kmem.kalloc().unwrap();
        assert_eq!(kmem.ref_count(pa), 1);
        assert_eq!(kmem.free_pages(), before - 1);

        kmem.kfree(pa);
        assert_eq!(kmem.ref_count(pa), 0);
        assert_eq!(kmem.free_pages(), before);
        assert!(kmem.kalloc().is_ok());
    }

    #[test]
    #[should_panic(expected = "allocator corruption: kfree: double free")]
    fn shared_frame_drains_then_fourth_free_is_corruption() {
        let (_pages, kmem) = arena(2);
        let pa = kmem.kalloc().unwrap();
        kmem.add_ref(pa);
        kmem.add_ref(pa);
        assert_eq!(kmem.ref_count(pa), 3);

        let before = kmem.free_pages();
        kmem.kfree(pa);
        kmem.kfree(pa);
        assert_eq!(kmem.ref_count(pa), 1);
        assert_eq!(kmem.free_pages(), before);
        kmem.kfree(pa);
        assert_eq!(kmem.ref_count(pa), 0);
        assert_eq!(kmem.free_pages(), before + 1);

        kmem.kfree(pa);
    }

    #[test]
    fn junk_fill_on_alloc_and_free() {
        let (_pages, kmem) = arena(1);
        let pa = kmem.kalloc().unwrap();
        let page = unsafe { slice::from_raw_parts(pa.as_mut_ptr(), PGSIZE) };
        assert!(page.iter().all(|&b| b == JUNK_ALLOC));

        kmem.kfree(pa);
        let page = unsafe { slice::from_raw_parts(pa.as_mut_ptr(), PGSIZE) };
        // 第一个字被空闲链表占用
        assert!(page[size_of::<usize>()..].iter().all(|&b| b == JUNK_FREE));
    }

    #[test]
    #[should_panic(expected = "allocator corruption: kfree: bad address")]
    fn misaligned_free_is_corruption() {
        let (_pages, kmem) = arena(2);
        let pa = kmem.kalloc().unwrap();
        kmem.kfree(unsafe { PhysAddr::from_raw(pa.as_usize() + 8) });
    }

    #[test]
    #[should_panic(expected = "allocator corruption: kfree: bad address")]
    fn freeing_frame_table_is_corruption() {
        let (pages, kmem) = arena(2);
        kmem.kfree(unsafe { PhysAddr::from_raw(pages.as_ptr() as usize) });
    }

    #[test]
    #[should_panic(expected = "allocator corruption: add_ref: free frame")]
    fn add_ref_on_free_frame_is_corruption() {
        let (_pages, kmem) = arena(2);
        let pa = kmem.kalloc().unwrap();
        kmem.kfree(pa);
        kmem.add_ref(pa);
    }

    #[test]
    #[should_panic(expected = "allocator corruption: add_ref: refcount overflow")]
    fn add_ref_overflow_is_corruption() {
        let (_pages, kmem) = arena(2);
        let pa = kmem.kalloc().unwrap();
        {
            let mut table = kmem.0.lock();
            let index = table.index(pa.into_raw(), "ref_count: bad address");
            table.refs()[index] = u32::MAX;
        }
        kmem.add_ref(pa);
    }

    #[test]
    fn second_kinit_logs_error_but_not_range() {
        capture_logs();
        let (mut pages, kmem) = arena(2);
        let range_lines = || {
            logged()
                .iter()
                .filter(|(_, msg)| msg.starts_with("kmem: available physical memory"))
                .count()
        };
        assert_eq!(range_lines(), 1);

        let start = pages.as_mut_ptr() as usize;
        let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            kmem.kinit(start, start + 3 * PGSIZE)
        }));
        assert!(result.is_err());
        assert_eq!(range_lines(), 1);
        assert!(logged().contains(&(Level::Error, "kmem: init twice".to_string())));
    }

    #[test]
    #[should_panic(expected = "kmem: init twice")]
    fn init_twice_panics() {
        let (mut pages, kmem) = arena(2);
        let start = pages.as_mut_ptr() as usize;
        unsafe { kmem.kinit(start, start + 3 * PGSIZE) };
    }

    #[test]
    fn uninitialized_allocator_is_empty() {
        let kmem = Kmem::new();
        assert_eq!(kmem.free_pages(), 0);
        assert!(kmem.kalloc().is_err());
    }

    #[test]
    fn concurrent_alloc_hands_out_distinct_frames() {
        const HARTS: usize = 4;
        const PER_HART: usize = 8;
        let (_pages, kmem) = arena(HARTS * PER_HART);

        let frames: Vec<PhysAddr> = thread::scope(|s| {
            let handles: Vec<_> = (0..HARTS)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        for _ in 0..PER_HART {
                            let pa = kmem.kalloc().unwrap();
                            // 写入自己的标记，若页帧被重复分配就会被别人覆盖
                            unsafe { *(pa.as_mut_ptr() as *mut usize) = pa.as_usize() };
                            mine.push(pa);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let distinct: HashSet<PhysAddr> = frames.iter().copied().collect();
        assert_eq!(distinct.len(), HARTS * PER_HART);
        assert_eq!(kmem.free_pages(), 0);
        for pa in &frames {
            assert_eq!(unsafe { *(pa.as_mut_ptr() as *const usize) }, pa.as_usize());
        }

        thread::scope(|s| {
            for chunk in frames.chunks(PER_HART) {
                let kmem = &kmem;
                s.spawn(move || chunk.iter().for_each(|&pa| kmem.kfree(pa)));
            }
        });
        assert_eq!(kmem.free_pages(), HARTS * PER_HART);
    }
}
