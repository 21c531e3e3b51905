//! 文件系统模块
//!
//! 目前只包含块缓存：把磁盘块缓存在内存中，并为并发访问同一块的进程提供同步。

mod bio;
mod bucket;

pub use bio::{Bcache, Buf, BufData};
