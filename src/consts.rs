//! 内核常量

/// 每页字节数
pub const PGSIZE: usize = 4096;
/// 页内偏移位数
pub const PGSHIFT: usize = 12;

/// 最大进程数，同时也是一把睡眠锁上最多的等待者数目
pub const NPROC: usize = 64;

pub mod fs {
    /// 块大小（字节）
    pub const BSIZE: usize = 1024;
    /// 一次文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;
    /// 块缓存中的缓冲块数目
    pub const NBUF: usize = MAXOPBLOCKS * 3;
    /// 块缓存的哈希桶数目，按 `blockno % NBUCKET` 分桶
    pub const NBUCKET: usize = 13;
    /// 保留的设备号，标记从未缓存过任何块的缓冲块
    pub const NODEV: u32 = u32::MAX;
}

pub mod mm {
    /// 分配页帧时填充的垃圾字节，用于暴露对未初始化内存的读取
    pub const JUNK_ALLOC: u8 = 5;
    /// 释放页帧时填充的垃圾字节，用于暴露释放后使用
    pub const JUNK_FREE: u8 = 1;
}
