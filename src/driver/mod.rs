//! 设备驱动模块，定义块缓存所依赖的块设备接口

use crate::fs::BufData;

mod ramdisk;

pub use ramdisk::RamDisk;

/// 块设备驱动接口。
///
/// 读写都是同步的：返回时数据已经传输完毕。块缓存保证同一个缓冲块
/// 任何时刻最多只有一个未完成的请求（调用者持有该缓冲块的所有权锁）。
pub trait BlockDevice: Sync {
    /// 把设备 `dev` 上第 `blockno` 块读入 `data`
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData);

    /// 把 `data` 写到设备 `dev` 上第 `blockno` 块
    fn write(&self, dev: u32, blockno: u32, data: &BufData);
}
