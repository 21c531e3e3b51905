//! 块缓存的哈希桶
//!
//! 每个桶是一条以下标相连的循环双向链表，链表结点就是缓冲块在全局数组中的下标，
//! 下标 `HEAD`（即 `NBUF`）充当哨兵。所有结点的链接都保存在桶自己的数组里，
//! 因此一个桶的链表只受该桶的自旋锁保护，缓冲块在桶之间迁移时只需分别修改
//! 两个桶各自的链接。

use crate::consts::fs::NBUF;

/// 哨兵结点的下标
const HEAD: usize = NBUF;

#[derive(Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

pub(super) struct Bucket {
    /// `links[i]` 只在缓冲块 `i` 属于本桶时有意义，`links[HEAD]` 是哨兵
    links: [Link; NBUF + 1],
}

impl Bucket {
    pub(super) const fn new() -> Self {
        Self {
            links: [Link { prev: HEAD, next: HEAD }; NBUF + 1],
        }
    }

    /// 把缓冲块 `index` 插到链表头部
    pub(super) fn push_front(&mut self, index: usize) {
        debug_assert!(index < NBUF);
        let first = self.links[HEAD].next;
        self.links[index] = Link { prev: HEAD, next: first };
        self.links[first].prev = index;
        self.links[HEAD].next = index;
    }

    /// 把缓冲块 `index` 从链表中摘下，调用者保证它在本桶中
    pub(super) fn remove(&mut self, index: usize) {
        debug_assert!(index < NBUF);
        let Link { prev, next } = self.links[index];
        self.links[prev].next = next;
        self.links[next].prev = prev;
        self.links[index] = Link { prev: HEAD, next: HEAD };
    }

    pub(super) fn is_empty(&self) -> bool {
        self.links[HEAD].next == HEAD
    }

    /// 从头到尾依次给出本桶中缓冲块的下标
    pub(super) fn iter(&self) -> Iter<'_> {
        Iter {
            bucket: self,
            cur: self.links[HEAD].next,
        }
    }
}

pub(super) struct Iter<'a> {
    bucket: &'a Bucket,
    cur: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == HEAD {
            return None;
        }
        let index = self.cur;
        self.cur = self.bucket.links[index].next;
        Some(index)
    }
}
