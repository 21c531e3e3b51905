//! 缓存层
//!
//! 块缓存由固定数目的缓冲块组成，缓存磁盘块的副本。缓存既减少了磁盘读取，
//! 也为多个进程共同使用的磁盘块提供了同步点。
//!
//! 接口：
//! - 要取得某个磁盘块的缓冲块，调用 `bread`；
//! - 修改缓冲块数据后，调用 `bwrite` 写回磁盘；
//! - 用完后调用 `brelse`（或直接丢弃 `Buf`）；
//! - 同一时刻只有一个进程能使用某个缓冲块，不要持有过久。
//!
//! 缓冲块按 `blockno % NBUCKET` 分散在若干哈希桶中，命中只需锁住一个桶；
//! 未命中时在全局锁保护下从整个缓存池挑选最久未使用的空闲缓冲块回收。

use array_macro::array;

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::clock::TickSource;
use crate::consts::fs::{BSIZE, NBUCKET, NBUF, NODEV};
use crate::driver::BlockDevice;
use crate::error::{halt, KernelError, Result};
use crate::process::Scheduler;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

use super::bucket::Bucket;

/// 块缓冲区缓存（Buffer Cache），用于块设备的读写缓存。
///
/// 在内核初始化阶段构造一次并调用 [`Bcache::binit`]，之后以引用的形式
/// 交给文件系统使用，运行期间不会销毁。
///
/// # 锁
/// - `lock`：全局锁，串行化未命中时的查找与回收；
/// - `buckets`：每个桶一把自旋锁，保护桶的链表以及桶内缓冲块的引用计数；
/// - 每个缓冲块的睡眠锁：所有权锁，持有者才能读写数据，可跨越磁盘 I/O。
///
/// 加锁顺序固定为：全局锁，目标桶锁，被回收缓冲块所在的桶锁。
/// 自旋锁从不跨越 I/O 持有。
pub struct Bcache<'k> {
    lock: SpinLock<()>,
    buckets: [SpinLock<Bucket>; NBUCKET],
    bufs: [BufInner; NBUF],
    initialized: AtomicBool,
    disk: &'k dyn BlockDevice,
    clock: &'k dyn TickSource,
    sched: &'k dyn Scheduler,
}

impl<'k> Bcache<'k> {
    pub const fn new(
        disk: &'k dyn BlockDevice,
        clock: &'k dyn TickSource,
        sched: &'k dyn Scheduler,
    ) -> Self {
        Self {
            lock: SpinLock::new((), "bcache"),
            buckets: array![_ => SpinLock::new(Bucket::new(), "bcache.bucket"); NBUCKET],
            bufs: array![_ => BufInner::new(); NBUF],
            initialized: AtomicBool::new(false),
            disk,
            clock,
            sched,
        }
    }

    /// 初始化块缓存：把所有缓冲块挂到 0 号桶上。
    ///
    /// 此后缓冲块只会在回收时于桶之间迁移，不会再被创建或销毁。
    /// 只能调用一次。
    pub fn binit(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            halt(format_args!("bcache: init twice"));
        }
        let mut bucket = self.buckets[0].lock();
        for index in 0..NBUF {
            bucket.push_front(index);
        }
        drop(bucket);

        #[cfg(feature = "verbose_init_info")]
        log::info!("bcache: {} buffers of {} bytes, {} buckets", NBUF, BSIZE, NBUCKET);

        log::info!("bcache: init done");
    }

    /// 获取指定设备与块号对应的缓冲块，缓冲块耗尽时停机。
    ///
    /// 见 [`Bcache::try_bget`]。
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        match self.try_bget(dev, blockno) {
            Ok(buf) => buf,
            Err(err) => err.fatal(),
        }
    }

    /// 获取指定设备与块号对应的缓冲块，返回时调用者持有其所有权锁。
    ///
    /// # 流程解释
    /// - 命中：锁住目标桶，在桶内查找 `(dev, blockno)`；找到则引用计数加一，
    ///   释放桶锁，再（可能睡眠地）获取该缓冲块的所有权锁。
    /// - 未命中：依次获取全局锁与目标桶锁，在整个缓存池中重新查找一遍，
    ///   因为等待全局锁期间别的进程可能已经缓存了该块；若找到，放弃回收，
    ///   释放两把锁后从头重来。否则回收全局最久未使用的空闲缓冲块，
    ///   见 [`Bcache::evict`]。
    ///
    /// 该函数不做磁盘读取，调用者需根据有效位决定是否读盘，见 [`Bcache::bread`]。
    ///
    /// # 可能的错误
    /// - 所有缓冲块都被引用时返回 `KernelError::ResourceExhausted`；
    /// - `dev` 为保留的 `NODEV` 时 panic。
    pub fn try_bget(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        if dev == NODEV {
            halt(format_args!("bget: reserved device number"));
        }
        if !self.initialized.load(Ordering::Acquire) {
            halt(format_args!("bcache: used before binit"));
        }
        let target = blockno as usize % NBUCKET;

        loop {
            let bucket = self.buckets[target].lock();
            let hit = bucket.iter().find(|&index| self.bufs[index].holds(dev, blockno));
            if let Some(index) = hit {
                self.bufs[index].refcnt.fetch_add(1, Ordering::Relaxed);
                drop(bucket);
                return Ok(self.lock_buf(index, dev, blockno));
            }
            drop(bucket);

            let global = self.lock.lock();
            let mut bucket = self.buckets[target].lock();
            if self.bufs.iter().any(|b| b.holds(dev, blockno)) {
                drop(bucket);
                drop(global);
                #[cfg(feature = "kernel_warning")]
                log::warn!("bget: block ({}, {}) cached concurrently, retry", dev, blockno);
                continue;
            }

            let index = self.evict(target, &mut bucket, dev, blockno)?;
            drop(bucket);
            drop(global);
            return Ok(self.lock_buf(index, dev, blockno));
        }
    }

    /// 回收一个空闲缓冲块，供 `(dev, blockno)` 使用。
    ///
    /// 调用者持有全局锁和目标桶 `target` 的锁（`bucket`）。
    ///
    /// # 流程解释
    /// 1. 扫描整个缓存池（不限于目标桶），挑选引用计数为 0 且释放时间戳最小的缓冲块；
    /// 2. 若它属于另一个桶，获取那个桶的锁，并在锁内重新确认其引用计数仍为 0
    ///    （挑选时没有持有那个桶的锁，期间可能有进程命中了它）；确认失败则
    ///    释放该桶锁，回到第 1 步；
    /// 3. 把它从原桶摘下，插到目标桶头部，设置新的设备号与块号，
    ///    标记为无效，引用计数置为 1。
    ///
    /// 每次重试都意味着有别的进程在挑选与确认之间命中了候选缓冲块，
    /// 重试次数不超过缓存池大小乘以并发的命中次数。
    fn evict(&self, target: usize, bucket: &mut Bucket, dev: u32, blockno: u32) -> Result<usize> {
        loop {
            let victim = self
                .find_lru()
                .ok_or(KernelError::ResourceExhausted("bget: no buffers"))?;

            let home = self.bucket_of(victim);
            if home == target {
                bucket.remove(victim);
                bucket.push_front(victim);
                self.bufs[victim].claim(dev, blockno);
                return Ok(victim);
            }

            let mut old = self.buckets[home].lock();
            if self.bufs[victim].refcnt.load(Ordering::Relaxed) != 0 {
                drop(old);
                #[cfg(feature = "kernel_warning")]
                log::warn!("bget: victim {} taken by a concurrent hit, search again", victim);
                continue;
            }
            old.remove(victim);
            bucket.push_front(victim);
            self.bufs[victim].claim(dev, blockno);
            drop(old);
            return Ok(victim);
        }
    }

    /// 全局 LRU：引用计数为 0 且释放时间戳最小的缓冲块，时间戳相同取下标最小者
    fn find_lru(&self) -> Option<usize> {
        self.bufs
            .iter()
            .enumerate()
            .filter(|(_, b)| b.refcnt.load(Ordering::Relaxed) == 0)
            .min_by_key(|(_, b)| b.stamp.load(Ordering::Relaxed))
            .map(|(index, _)| index)
    }

    /// 缓冲块当前所在的桶。块号只在持有全局锁时改变。
    fn bucket_of(&self, index: usize) -> usize {
        self.bufs[index].blockno.load(Ordering::Relaxed) as usize % NBUCKET
    }

    fn lock_buf(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            index,
            dev,
            blockno,
            bcache: self,
            data: ManuallyDrop::new(self.bufs[index].data.lock(self.sched)),
        }
    }

    /// 返回一个内容与磁盘一致的缓冲块，缓冲块耗尽时停机。
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        match self.try_bread(dev, blockno) {
            Ok(buf) => buf,
            Err(err) => err.fatal(),
        }
    }

    /// 返回一个内容与磁盘一致的缓冲块。
    ///
    /// 若缓冲块无效（刚被回收），在持有所有权锁的情况下同步读盘，再标记为有效。
    pub fn try_bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let mut buf = self.try_bget(dev, blockno)?;
        let inner = &self.bufs[buf.index];
        if !inner.valid.load(Ordering::Relaxed) {
            self.disk.read(dev, blockno, buf.data_mut());
            inner.valid.store(true, Ordering::Relaxed);
        }
        Ok(buf)
    }

    /// 所有权锁已释放后，在所属桶的锁内把引用计数减一；
    /// 减到 0 时记录当前时钟，供 LRU 回收排序。
    fn brelse(&self, index: usize) {
        let b = &self.bufs[index];
        let bucket = self.buckets[self.bucket_of(index)].lock();
        let refcnt = b.refcnt.load(Ordering::Relaxed);
        if refcnt == 0 {
            drop(bucket);
            KernelError::LockDisciplineViolation("brelse: refcnt underflow").fatal();
        }
        b.refcnt.store(refcnt - 1, Ordering::Relaxed);
        if refcnt == 1 {
            b.stamp.store(self.clock.ticks(), Ordering::Relaxed);
        }
        drop(bucket);
    }

    fn bpin(&self, index: usize) {
        let _bucket = self.buckets[self.bucket_of(index)].lock();
        self.bufs[index].refcnt.fetch_add(1, Ordering::Relaxed);
    }

    fn bunpin(&self, index: usize) {
        let bucket = self.buckets[self.bucket_of(index)].lock();
        let refcnt = self.bufs[index].refcnt.load(Ordering::Relaxed);
        // 调用者自己持有的那一份引用不能被 unpin 抵消
        if refcnt <= 1 {
            drop(bucket);
            KernelError::LockDisciplineViolation("bunpin").fatal();
        }
        self.bufs[index].refcnt.store(refcnt - 1, Ordering::Relaxed);
    }
}

/// 缓冲块的元信息与数据。
///
/// 元信息字段都是原子变量，但写入总是在相应的自旋锁内进行：
/// `dev`/`blockno` 在全局锁与桶锁内，`refcnt`/`stamp` 在所属桶的锁内。
/// 原子性只是让回收时不持桶锁的全局扫描成为良定义的读取，
/// 扫描结果在真正回收前会在桶锁内重新确认。
struct BufInner {
    dev: AtomicU32,
    blockno: AtomicU32,
    /// 持有者与等待者的数目
    refcnt: AtomicU32,
    /// 引用计数最后一次降为 0 时的时钟
    stamp: AtomicU64,
    /// 数据是否已从磁盘读入
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            dev: AtomicU32::new(NODEV),
            blockno: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }

    fn holds(&self, dev: u32, blockno: u32) -> bool {
        self.dev.load(Ordering::Relaxed) == dev && self.blockno.load(Ordering::Relaxed) == blockno
    }

    fn claim(&self, dev: u32, blockno: u32) {
        self.dev.store(dev, Ordering::Relaxed);
        self.blockno.store(blockno, Ordering::Relaxed);
        self.valid.store(false, Ordering::Relaxed);
        self.refcnt.store(1, Ordering::Relaxed);
    }
}

/// 已持有所有权锁的缓冲块。
///
/// `Buf` 本身就是持锁的凭证：只能通过 `bget`/`bread` 得到，释放时被消耗，
/// 因此不可能在未持锁时提交或释放，也不可能重复释放。它不能被移交给其他进程。
pub struct Buf<'a> {
    index: usize,
    dev: u32,
    blockno: u32,
    bcache: &'a Bcache<'a>,
    data: ManuallyDrop<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.data
    }

    /// 把缓冲块内容同步写回磁盘。调用者必须持有所有权锁。
    pub fn bwrite(&mut self) {
        if !self.data.holding() {
            KernelError::LockDisciplineViolation("bwrite").fatal();
        }
        self.bcache.disk.write(self.dev, self.blockno, &self.data);
    }

    /// 释放缓冲块，等价于丢弃 `Buf`
    pub fn brelse(self) {}

    /// 引用计数加一，使缓冲块在释放后仍不会被回收（例如被日志引用）
    pub fn pin(&self) {
        self.bcache.bpin(self.index);
    }

    /// 撤销一次 `pin`
    pub fn unpin(&self) {
        self.bcache.bunpin(self.index);
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if !self.data.holding() {
            KernelError::LockDisciplineViolation("brelse").fatal();
        }
        // 先释放所有权锁，再在桶锁内减少引用计数
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.bcache.brelse(self.index);
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
