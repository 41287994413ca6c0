//! Data items (DI, §4.5): a short-lived view over one raw item on a cached
//! page, plus the before/after bracket that pairs an in-place mutation with
//! its WAL record. Owned by whoever called `DataManager::read`/`insert`;
//! must be paired with exactly one `release` (§5).

use std::sync::Arc;

use parking_lot::{lock_api::RawRwLock as _, Mutex, RawRwLock};

use crate::buffer::page_cache::PageFrame;
use crate::common::{Uid, Xid, ITEM_HEADER_SIZE};
use crate::error::Result;
use crate::transaction::wal::{Wal, WalRecord};

/// Encode a payload into the raw on-page item layout: `[valid=0][size][payload]`.
pub fn encode_item(payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(ITEM_HEADER_SIZE + payload.len());
    raw.push(0); // valid
    raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// A reference to one item living at `offset` on `frame`. The per-item latch
/// is a raw read/write lock so callers can bracket a mutation with explicit
/// `before`/`after` calls instead of holding an RAII guard across them (the
/// write is built up in two method calls, not one scope).
pub struct DataItem {
    uid: Uid,
    frame: Arc<PageFrame>,
    offset: usize,
    raw_len: usize,
    old_raw: Mutex<Vec<u8>>,
    latch: RawRwLock,
    wal: Arc<Wal>,
}

impl DataItem {
    pub(crate) fn new(uid: Uid, frame: Arc<PageFrame>, offset: usize, raw_len: usize, wal: Arc<Wal>) -> Self {
        Self {
            uid,
            frame,
            offset,
            raw_len,
            old_raw: Mutex::new(Vec::new()),
            latch: RawRwLock::INIT,
            wal,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The payload, exclusive of the `[valid][size]` header.
    pub fn data(&self) -> Vec<u8> {
        self.frame.read(|buf| {
            buf[self.offset + ITEM_HEADER_SIZE..self.offset + self.raw_len].to_vec()
        })
    }

    pub fn is_valid(&self) -> bool {
        self.frame.read(|buf| buf[self.offset] == 0)
    }

    /// Acquire the write latch and snapshot the current raw bytes so a
    /// failed write can be reverted with `un_before`.
    pub fn before(&self) {
        self.latch.lock_exclusive();
        self.frame.write(|buf| {
            let mut old = self.old_raw.lock();
            old.clear();
            old.extend_from_slice(&buf[self.offset..self.offset + self.raw_len]);
        });
    }

    /// Revert to the bytes captured by `before` and release the write latch
    /// without logging anything.
    pub fn un_before(&self) {
        self.frame.write(|buf| {
            let old = self.old_raw.lock();
            buf[self.offset..self.offset + self.raw_len].copy_from_slice(&old);
        });
        unsafe { self.latch.unlock_exclusive() };
    }

    /// Overwrite the payload bytes in place. Caller must keep the same
    /// length: all in-core mutations this core makes are replacements, never
    /// resizes (§6.2).
    pub fn overwrite(&self, new_payload: &[u8]) {
        debug_assert_eq!(new_payload.len(), self.raw_len - ITEM_HEADER_SIZE);
        self.frame.write(|buf| {
            let start = self.offset + ITEM_HEADER_SIZE;
            buf[start..start + new_payload.len()].copy_from_slice(new_payload);
        });
    }

    /// Build and log an UPDATE record carrying both the pre- and post-images
    /// captured since `before`, then release the write latch. WAL durability
    /// precedes page durability (§5): the record is fsynced here; the page
    /// itself is only flushed later, by the page cache.
    pub fn after(&self, xid: Xid) -> Result<()> {
        let old_raw = self.old_raw.lock().clone();
        let new_raw = self
            .frame
            .read(|buf| buf[self.offset..self.offset + self.raw_len].to_vec());
        let record = WalRecord::Update {
            xid,
            uid: self.uid,
            old_raw,
            new_raw,
        };
        self.wal.log(&record.encode())?;
        unsafe { self.latch.unlock_exclusive() };
        Ok(())
    }

    pub fn lock(&self) {
        self.latch.lock_exclusive();
    }

    pub fn unlock(&self) {
        unsafe { self.latch.unlock_exclusive() };
    }

    pub fn r_lock(&self) {
        self.latch.lock_shared();
    }

    pub fn r_unlock(&self) {
        unsafe { self.latch.unlock_shared() };
    }

    /// Mark a raw item buffer dead (tombstone). Used by logical delete paths
    /// that write a replacement raw buffer rather than going through `after`.
    pub fn set_raw_invalid(raw: &mut [u8]) {
        raw[0] = 1;
    }

    pub(crate) fn frame(&self) -> &Arc<PageFrame> {
        &self.frame
    }
}
