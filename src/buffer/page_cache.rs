//! Page cache (PC, §4.2): a bounded, reference-counted buffer pool guarding
//! exactly one mutex over its map and a condition variable that de-dupes
//! concurrent faults on the same page. Refcounts stand in for pin counts;
//! `get_page`/`release` must always be paired (§5).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::common::PAGE_SIZE;
use crate::error::{DbError, Result};
use crate::storage::disk::DiskManager;

struct FrameInner {
    buf: Vec<u8>,
    dirty: bool,
    refcount: usize,
}

/// A cached page. Holders obtained it through `PageCache::get_page` or
/// `PageCache::new_page` and must return it through `PageCache::release`.
pub struct PageFrame {
    pub pgno: u32,
    inner: Mutex<FrameInner>,
    /// Per-page latch serializing layout mutation (`PageX`/`PageOne` ops)
    /// independent of the cache's own admission mutex.
    pub latch: RwLock<()>,
}

impl PageFrame {
    fn new(pgno: u32, buf: Vec<u8>, refcount: usize) -> Arc<Self> {
        Arc::new(Self {
            pgno,
            inner: Mutex::new(FrameInner {
                buf,
                dirty: false,
                refcount,
            }),
            latch: RwLock::new(()),
        })
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        f(&inner.buf)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        inner.dirty = true;
        f(&mut inner.buf)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }
}

enum Slot {
    Loading,
    Ready(Arc<PageFrame>),
}

struct Shared {
    map: HashMap<u32, Slot>,
    disk: DiskManager,
}

pub struct PageCache {
    shared: Mutex<Shared>,
    loaded: Condvar,
    capacity: usize,
}

impl PageCache {
    /// `capacity` is the number of page slots kept resident, not bytes.
    pub fn new(disk: DiskManager, capacity: usize) -> Self {
        Self {
            shared: Mutex::new(Shared {
                map: HashMap::new(),
                disk,
            }),
            loaded: Condvar::new(),
            capacity,
        }
    }

    /// Append `init_bytes` as a new page on disk and admit it to the cache
    /// pinned once. The caller owns the returned frame and must `release`
    /// it exactly once.
    pub fn new_page(&self, init_bytes: &[u8]) -> Result<Arc<PageFrame>> {
        let mut shared = self.shared.lock();
        self.make_room(&mut shared)?;
        let pgno = shared.disk.append_page(init_bytes)?;
        let frame = PageFrame::new(pgno, init_bytes.to_vec(), 1);
        shared.map.insert(pgno, Slot::Ready(frame.clone()));
        debug!(pgno, "page admitted via new_page");
        Ok(frame)
    }

    /// Fetch page `pgno`, reading it from disk on a cold miss. Blocks only
    /// to de-duplicate a concurrent cold read of the same page; never blocks
    /// waiting for cache space: a full cache with nothing evictable fails
    /// with `DatabaseBusy` (§9).
    pub fn get_page(&self, pgno: u32) -> Result<Arc<PageFrame>> {
        loop {
            let mut shared = self.shared.lock();
            match shared.map.get(&pgno) {
                Some(Slot::Ready(frame)) => {
                    frame.inner.lock().refcount += 1;
                    trace!(pgno, "page cache hit");
                    return Ok(frame.clone());
                }
                Some(Slot::Loading) => {
                    self.loaded.wait(&mut shared);
                    continue;
                }
                None => {
                    self.make_room(&mut shared)?;
                    shared.map.insert(pgno, Slot::Loading);
                    let mut buf = vec![0u8; PAGE_SIZE];
                    let read_result = shared.disk.read_page(pgno, &mut buf);
                    match read_result {
                        Ok(()) => {
                            let frame = PageFrame::new(pgno, buf, 1);
                            shared.map.insert(pgno, Slot::Ready(frame.clone()));
                            self.loaded.notify_all();
                            trace!(pgno, "page cache miss, loaded from disk");
                            return Ok(frame);
                        }
                        Err(e) => {
                            shared.map.remove(&pgno);
                            self.loaded.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Decrement the frame's refcount. A clean page stays resident for a
    /// future `get_page` or eviction; a page that reaches refcount 0 while
    /// dirty is flushed and unmapped immediately (§4.2).
    pub fn release(&self, frame: &Arc<PageFrame>) -> Result<()> {
        let mut shared = self.shared.lock();
        let (refcount, dirty) = {
            let mut inner = frame.inner.lock();
            inner.refcount = inner.refcount.saturating_sub(1);
            (inner.refcount, inner.dirty)
        };
        if refcount == 0 && dirty {
            self.flush_locked(&mut shared, frame)?;
            shared.map.remove(&frame.pgno);
        }
        Ok(())
    }

    pub fn flush_page(&self, frame: &Arc<PageFrame>) -> Result<()> {
        let mut shared = self.shared.lock();
        self.flush_locked(&mut shared, frame)
    }

    fn flush_locked(&self, shared: &mut Shared, frame: &Arc<PageFrame>) -> Result<()> {
        let mut inner = frame.inner.lock();
        if inner.dirty {
            shared.disk.write_page(frame.pgno, &inner.buf)?;
            shared.disk.sync()?;
            inner.dirty = false;
        }
        Ok(())
    }

    /// Try to evict one refcount-0 resident page to make room for a new
    /// admission. No-op if the map has spare capacity.
    fn make_room(&self, shared: &mut Shared) -> Result<()> {
        if shared.map.len() < self.capacity {
            return Ok(());
        }
        let victim_pgno = shared.map.iter().find_map(|(pgno, slot)| match slot {
            Slot::Ready(frame) if frame.inner.lock().refcount == 0 => Some(*pgno),
            _ => None,
        });
        match victim_pgno {
            Some(pgno) => {
                if let Some(Slot::Ready(frame)) = shared.map.get(&pgno).map(|s| match s {
                    Slot::Ready(f) => Slot::Ready(f.clone()),
                    Slot::Loading => Slot::Loading,
                }) {
                    self.flush_locked(shared, &frame)?;
                }
                shared.map.remove(&pgno);
                debug!(pgno, "evicted page to make room");
                Ok(())
            }
            None => {
                warn!("page cache full with no zero-refcount victim");
                Err(DbError::DatabaseBusy)
            }
        }
    }

    /// Flush every dirty resident page, then close the underlying disk
    /// manager's file handle (implicit on drop).
    pub fn close(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        let frames: Vec<Arc<PageFrame>> = shared
            .map
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(frame) => Some(frame.clone()),
                Slot::Loading => None,
            })
            .collect();
        for frame in frames {
            self.flush_locked(&mut shared, &frame)?;
        }
        shared.map.clear();
        Ok(())
    }

    /// Discard every resident page with `pgno > max_pgno` and truncate the
    /// underlying file to match. Used by recovery to undo an interrupted
    /// `new_page`.
    pub fn truncate_by_pgno(&self, max_pgno: u32) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.map.retain(|pgno, _| *pgno <= max_pgno);
        shared.disk.truncate_by_pgno(max_pgno)?;
        Ok(())
    }

    /// Total number of pages in the underlying file, Page 0 included.
    pub fn page_count(&self) -> Result<u32> {
        self.shared.lock().disk.page_count()
    }
}
