//! 内存盘：把 QEMU 用 `-initrd fs.img` 载入内存的磁盘镜像当作块设备使用

use crate::consts::fs::BSIZE;
use crate::error::halt;
use crate::fs::BufData;
use crate::spinlock::SpinLock;

use super::BlockDevice;

/// 以一段内存为后备存储的块设备。
///
/// 只模拟一块盘，请求中的设备号被忽略。
pub struct RamDisk<'a> {
    image: SpinLock<&'a mut [u8]>,
}

impl<'a> RamDisk<'a> {
    pub const fn new(image: &'a mut [u8]) -> Self {
        Self {
            image: SpinLock::new(image, "ramdisk"),
        }
    }

    /// 镜像中完整块的数目
    pub fn nblocks(&self) -> usize {
        self.image.lock().len() / BSIZE
    }

    fn range(&self, len: usize, blockno: u32) -> core::ops::Range<usize> {
        let start = blockno as usize * BSIZE;
        if start + BSIZE > len {
            halt(format_args!("ramdisk: blockno {} too big", blockno));
        }
        start..start + BSIZE
    }
}

impl<'a> BlockDevice for RamDisk<'a> {
    fn read(&self, _dev: u32, blockno: u32, data: &mut BufData) {
        let image = self.image.lock();
        let range = self.range(image.len(), blockno);
        data.copy_from_slice(&image[range]);
    }

    fn write(&self, _dev: u32, blockno: u32, data: &BufData) {
        let mut image = self.image.lock();
        let range = self.range(image.len(), blockno);
        image[range].copy_from_slice(&data[..]);
    }
}
