//! Data manager (DM, §4.7): the façade every layer above L5 talks to. Picks
//! a target page via the free-space index, logs before it mutates, and
//! reconciles the free-space index afterward so the next inserter sees an
//! accurate picture.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::page_cache::PageCache;
use crate::common::{offset_of, page_of, Uid, Xid, MAX_FREE_SPACE};
use crate::error::{DbError, Result};
use crate::storage::data_item::{encode_item, DataItem};
use crate::storage::disk::DiskManager;
use crate::storage::fsi::FreeSpaceIndex;
use crate::storage::page::PageX;
use crate::transaction::wal::{Wal, WalRecord};

pub struct DataManager {
    pc: Arc<PageCache>,
    wal: Arc<Wal>,
    fsi: Arc<FreeSpaceIndex>,
}

impl DataManager {
    pub fn new(pc: Arc<PageCache>, wal: Arc<Wal>, fsi: Arc<FreeSpaceIndex>) -> Self {
        Self { pc, wal, fsi }
    }

    /// Convenience bootstrap used by unit tests and anything that wants a
    /// fresh, already-open heap with no crash-recovery history: creates the
    /// `.db` and `.log` files, writes Page 0, and starts with an empty FSI.
    /// `Database::create` (§6.4) performs the equivalent wiring alongside a
    /// `Tss`; this constructor skips that because the layers below it don't
    /// need one.
    pub fn create(db_path: impl AsRef<Path>, log_path: impl AsRef<Path>, cache_pages: usize) -> Result<Self> {
        use crate::storage::page::PageOne;

        let mut disk = DiskManager::create(db_path)?;
        let mut page_zero = PageOne::init_raw();
        let marker = open_marker();
        PageOne::set_vc_open(&mut page_zero, &marker);
        disk.append_page(&page_zero)?;

        let pc = Arc::new(PageCache::new(disk, cache_pages));
        let wal = Arc::new(Wal::create(log_path)?);
        let fsi = Arc::new(FreeSpaceIndex::new());
        Ok(Self::new(pc, wal, fsi))
    }

    pub fn page_cache(&self) -> &Arc<PageCache> {
        &self.pc
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn fsi(&self) -> &Arc<FreeSpaceIndex> {
        &self.fsi
    }

    /// Decode `uid`'s item; `None` if it's been tombstoned.
    pub fn read(&self, uid: Uid) -> Result<Option<DataItem>> {
        let pgno = page_of(uid);
        let offset = offset_of(uid) as usize;
        let frame = self.pc.get_page(pgno)?;
        let (valid, size) = frame.read(|buf| {
            (buf[offset], u16::from_le_bytes([buf[offset + 1], buf[offset + 2]]))
        });
        if valid != 0 {
            self.pc.release(&frame)?;
            trace!(uid, "read found tombstoned item");
            return Ok(None);
        }
        let raw_len = 3 + size as usize;
        Ok(Some(DataItem::new(uid, frame, offset, raw_len, self.wal.clone())))
    }

    /// Wrap `data` in an item, pick (or allocate) a page for it, log the
    /// INSERT record, physically write it, and return its uid.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let raw = encode_item(data);
        if raw.len() > MAX_FREE_SPACE {
            return Err(DbError::DataTooLarge {
                size: raw.len(),
                max: MAX_FREE_SPACE,
            });
        }

        let picked = self.fsi.select(raw.len());
        let frame = match picked {
            Some(info) => self.pc.get_page(info.pgno)?,
            None => self.pc.new_page(&PageX::init_raw())?,
        };
        let pgno = frame.pgno;

        let offset = frame.read(PageX::get_fso);
        let record = WalRecord::Insert {
            xid,
            pgno,
            offset,
            raw: raw.clone(),
        };
        self.wal.log(&record.encode())?;

        frame.write(|buf| PageX::insert(buf, &raw));
        let free_after = frame.read(PageX::free_space);
        self.pc.release(&frame)?;
        self.fsi.add(pgno, free_after);

        let uid = crate::common::uid_of(pgno, offset);
        debug!(xid, uid, pgno, "inserted item");
        Ok(uid)
    }

    /// Thin forwarding wrapper: `DataItem::after` already builds and logs the
    /// UPDATE record; this just gives callers a DM-shaped entry point (§4.7).
    pub fn log_update(&self, xid: Xid, di: &DataItem) -> Result<()> {
        di.after(xid)
    }

    pub fn release(&self, di: &DataItem) -> Result<()> {
        self.pc.release(di.frame())
    }

    pub fn close(&self) -> Result<()> {
        self.pc.close()
    }
}

/// Fresh random bytes stamped into Page 0's open span at every open (§3).
pub fn open_marker() -> [u8; 8] {
    use rand::Rng;
    rand::rng().random()
}
