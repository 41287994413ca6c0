//! Free-space index (§4.6): an in-memory, mutex-protected, bucketed
//! first-fit allocator rebuilt from scratch every time the database opens.
//! Pages currently checked out by a writer are simply absent from the
//! index until re-added.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::common::FSI_BUCKET_COUNT;

/// A page and the free space it reported the last time it was indexed.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub pgno: u32,
    pub free_space: usize,
}

struct Buckets {
    buckets: Vec<VecDeque<PageInfo>>,
}

impl Buckets {
    fn new() -> Self {
        Self {
            buckets: (0..=FSI_BUCKET_COUNT).map(|_| VecDeque::new()).collect(),
        }
    }

    fn bucket_index(free_space: usize) -> usize {
        (free_space / crate::common::FSI_BUCKET_WIDTH).min(FSI_BUCKET_COUNT)
    }
}

pub struct FreeSpaceIndex {
    inner: Mutex<Buckets>,
}

impl Default for FreeSpaceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Buckets::new()),
        }
    }

    /// File a page under the bucket matching its current free space.
    pub fn add(&self, pgno: u32, free_space: usize) {
        let mut inner = self.inner.lock();
        let idx = Buckets::bucket_index(free_space);
        inner.buckets[idx].push_back(PageInfo { pgno, free_space });
    }

    /// Remove and return the first page with at least `need` bytes free,
    /// scanning buckets from `ceil(need / width)` upward. The returned page
    /// is no longer indexed; the caller must `add` it back after use.
    pub fn select(&self, need: usize) -> Option<PageInfo> {
        let mut inner = self.inner.lock();
        let width = crate::common::FSI_BUCKET_WIDTH;
        let start = need.div_ceil(width).min(FSI_BUCKET_COUNT);
        for bucket in &mut inner.buckets[start..] {
            if let Some(info) = bucket.pop_front() {
                return Some(info);
            }
        }
        None
    }

    /// Remove every entry for `pgno`, regardless of bucket. Used when a
    /// page is being truncated away during recovery.
    pub fn remove_page(&self, pgno: u32) {
        let mut inner = self.inner.lock();
        for bucket in inner.buckets.iter_mut() {
            bucket.retain(|info| info.pgno != pgno);
        }
    }
}
