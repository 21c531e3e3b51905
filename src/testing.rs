//! 宿主机上的测试替身：用线程模拟进程，用内存模拟磁盘，把日志记到线程局部的缓冲里

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, Thread};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::consts::fs::BSIZE;
use crate::driver::BlockDevice;
use crate::fs::BufData;
use crate::process::{Pid, Scheduler};

static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static PID: Pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
}

/// 每个宿主线程是一个进程，睡眠与唤醒由 `thread::park`/`Thread::unpark` 实现。
///
/// park 的许可语义保证唤醒先于睡眠到达时不会丢失。
pub struct HostScheduler {
    threads: Mutex<HashMap<Pid, Thread>>,
}

impl HostScheduler {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }
}

impl Scheduler for HostScheduler {
    fn my_pid(&self) -> Pid {
        let pid = PID.with(|pid| *pid);
        self.threads
            .lock()
            .unwrap()
            .entry(pid)
            .or_insert_with(thread::current);
        pid
    }

    fn park(&self) {
        thread::park();
    }

    fn unpark(&self, pid: Pid) {
        if let Some(thread) = self.threads.lock().unwrap().get(&pid) {
            thread.unpark();
        }
    }
}

/// 记录读写次数的内存磁盘，未写过的块读出全零
pub struct MemDisk {
    blocks: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 不经过缓存，直接把整块填成 `byte`
    pub fn fill(&self, dev: u32, blockno: u32, byte: u8) {
        self.blocks.lock().unwrap().insert((dev, blockno), vec![byte; BSIZE]);
    }

    pub fn block(&self, dev: u32, blockno: u32) -> Vec<u8> {
        self.blocks
            .lock()
            .unwrap()
            .get(&(dev, blockno))
            .cloned()
            .unwrap_or_else(|| vec![0; BSIZE])
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        data.copy_from_slice(&self.block(dev, blockno));
    }

    fn write(&self, dev: u32, blockno: u32, data: &BufData) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock().unwrap().insert((dev, blockno), data.to_vec());
    }
}

thread_local! {
    static RECORDS: RefCell<Vec<(Level, String)>> = RefCell::new(Vec::new());
}

/// 按线程记录日志，并行运行的测试互不干扰
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let entry = (record.level(), record.args().to_string());
        RECORDS.with(|records| records.borrow_mut().push(entry));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// 安装记录日志的 logger（全局只装一次），并清空当前线程已记录的日志
pub fn capture_logs() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);
    RECORDS.with(|records| records.borrow_mut().clear());
}

/// 当前线程记录下的日志
pub fn logged() -> Vec<(Level, String)> {
    RECORDS.with(|records| records.borrow().clone())
}
