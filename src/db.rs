//! The public surface (§6.4): a `Database` handle wrapping the version
//! manager, transaction state store, and page cache into `create`/`open`,
//! `begin`/`commit`/`abort`, `read`/`insert`/`delete`, and `close`. Nothing
//! above this module is in scope: SQL parsing, the table manager, secondary
//! indexes, and the wire protocol all sit on top of it elsewhere (§1).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::buffer::page_cache::{PageCache, PageFrame};
use crate::common::{IsolationLevel, Uid};
use crate::config::EngineOptions;
use crate::data_manager::{open_marker, DataManager};
use crate::error::Result;
use crate::storage::disk::DiskManager;
use crate::storage::fsi::FreeSpaceIndex;
use crate::storage::page::{PageOne, PageX};
use crate::transaction::lock_table::LockTable;
use crate::transaction::mvcc::{Transaction, VersionManager};
use crate::transaction::recovery;
use crate::transaction::tss::Tss;
use crate::transaction::wal::Wal;

struct Paths {
    db: PathBuf,
    log: PathBuf,
    xid: PathBuf,
}

impl Paths {
    fn for_prefix(prefix: &Path) -> Self {
        let with_ext = |ext: &str| -> PathBuf {
            let mut s: OsString = prefix.as_os_str().to_owned();
            s.push(".");
            s.push(ext);
            PathBuf::from(s)
        };
        Self {
            db: with_ext("db"),
            log: with_ext("log"),
            xid: with_ext("xid"),
        }
    }
}

pub struct Database {
    dm: Arc<DataManager>,
    vm: Arc<VersionManager>,
    tss: Arc<Tss>,
    pc: Arc<PageCache>,
    /// Pinned for the handle's entire life: Page 0's marker must differ
    /// between `open` and `close` (§3), so it stays resident and mutable
    /// rather than cycling through the cache like ordinary data pages.
    page_zero: Arc<PageFrame>,
    opts: EngineOptions,
}

impl Database {
    pub fn create(path_prefix: impl AsRef<Path>, opts: EngineOptions) -> Result<Self> {
        let opts = opts.validate()?;
        let paths = Paths::for_prefix(path_prefix.as_ref());

        let tss = Arc::new(Tss::create(&paths.xid)?);
        let wal = Arc::new(Wal::create(&paths.log)?);
        let disk = DiskManager::create(&paths.db)?;
        let pc = Arc::new(PageCache::new(disk, opts.cache_pages));

        let mut page_zero_bytes = PageOne::init_raw();
        PageOne::set_vc_open(&mut page_zero_bytes, &open_marker());
        let page_zero = pc.new_page(&page_zero_bytes)?;
        debug_assert_eq!(page_zero.pgno, 0, "page 0 must be the first page appended");

        let fsi = Arc::new(FreeSpaceIndex::new());
        let dm = Arc::new(DataManager::new(pc.clone(), wal, fsi));
        let lock_table = Arc::new(LockTable::new());
        let vm = Arc::new(VersionManager::new(dm.clone(), tss.clone(), lock_table));

        info!(path = %paths.db.display(), "database created");
        Ok(Self { dm, vm, tss, pc, page_zero, opts })
    }

    pub fn open(path_prefix: impl AsRef<Path>, opts: EngineOptions) -> Result<Self> {
        let opts = opts.validate()?;
        let paths = Paths::for_prefix(path_prefix.as_ref());

        let tss = Arc::new(Tss::open(&paths.xid)?);
        let wal = Arc::new(Wal::open(&paths.log)?);
        let disk = DiskManager::open(&paths.db)?;
        let pc = Arc::new(PageCache::new(disk, opts.cache_pages));

        let page_zero = pc.get_page(0)?;
        let clean_shutdown = page_zero.read(PageOne::check_vc);
        if !clean_shutdown {
            info!("page 0 markers disagree, running recovery");
            recovery::recover(&wal, &tss, &pc)?;
        } else {
            info!("clean shutdown detected, skipping recovery");
        }

        let fsi = Arc::new(FreeSpaceIndex::new());
        let page_count = pc.page_count()?;
        for pgno in 1..page_count {
            let frame = pc.get_page(pgno)?;
            let free = frame.read(PageX::free_space);
            fsi.add(pgno, free);
            pc.release(&frame)?;
        }

        page_zero.write(|buf| PageOne::set_vc_open(buf, &open_marker()));

        let dm = Arc::new(DataManager::new(pc.clone(), wal, fsi));
        let lock_table = Arc::new(LockTable::new());
        let vm = Arc::new(VersionManager::new(dm.clone(), tss.clone(), lock_table));

        Ok(Self { dm, vm, tss, pc, page_zero, opts })
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Transaction> {
        self.vm.begin(level)
    }

    pub fn begin_default(&self) -> Result<Transaction> {
        self.vm.begin(self.opts.default_isolation)
    }

    pub fn commit(&self, txn: Transaction) -> Result<()> {
        self.vm.commit(txn)
    }

    pub fn abort(&self, txn: Transaction) -> Result<()> {
        self.vm.abort(txn)
    }

    pub fn read(&self, txn: &Transaction, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.vm.read(txn, uid)
    }

    pub fn insert(&self, txn: &Transaction, data: &[u8]) -> Result<Uid> {
        self.vm.insert(txn, data)
    }

    pub fn delete(&self, txn: &Transaction, uid: Uid) -> Result<bool> {
        self.vm.delete(txn, uid)
    }

    /// Stamp Page 0's close marker, flush everything, and close the
    /// underlying files. Consuming `self` makes a use-after-close a compile
    /// error rather than a runtime one.
    pub fn close(self) -> Result<()> {
        self.page_zero.write(PageOne::set_vc_close);
        self.pc.release(&self.page_zero)?;
        self.dm.close()?;
        self.tss.close()?;
        info!("database closed cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn clean_lifecycle_round_trips_through_reopen() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("t");

        let db = Database::create(&prefix, EngineOptions::default()).unwrap();
        let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = db.insert(&txn, b"hello").unwrap();
        db.commit(txn).unwrap();
        db.close().unwrap();

        let db = Database::open(&prefix, EngineOptions::default()).unwrap();
        let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(db.read(&reader, uid).unwrap(), Some(b"hello".to_vec()));
        db.commit(reader).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn crash_after_commit_is_recovered_on_reopen() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("t");

        let db = Database::create(&prefix, EngineOptions::default()).unwrap();
        let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = db.insert(&txn, b"abc").unwrap();
        db.commit(txn).unwrap();
        // simulate a crash: drop the handle without calling close(), so
        // page 0's markers are left disagreeing.
        drop(db);

        let db = Database::open(&prefix, EngineOptions::default()).unwrap();
        let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(db.read(&reader, uid).unwrap(), Some(b"abc".to_vec()));
        db.commit(reader).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn crash_with_uncommitted_writer_is_undone_on_reopen() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("t");

        let db = Database::create(&prefix, EngineOptions::default()).unwrap();
        let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = db.insert(&txn, b"xxx").unwrap();
        // no commit -- simulate a crash.
        drop(txn);
        drop(db);

        let db = Database::open(&prefix, EngineOptions::default()).unwrap();
        let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(db.read(&reader, uid).unwrap(), None);
        db.commit(reader).unwrap();
        db.close().unwrap();
    }
}
