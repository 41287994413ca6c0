//! Version manager (VM, §4.8): MVCC entries layered on top of the data
//! manager. An entry's payload is `[xmin:8][xmax:8][data]`; visibility is
//! computed fresh on every read from the reader's transaction state, never
//! cached, so it stays correct as other transactions commit around it.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{IsolationLevel, Uid, Xid};
use crate::data_manager::DataManager;
use crate::error::{DbError, Result};
use crate::transaction::lock_table::LockTable;
use crate::transaction::tss::Tss;

const ENTRY_HEADER_LEN: usize = 16;

fn encode_entry(xmin: Xid, xmax: Xid, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENTRY_HEADER_LEN + data.len());
    buf.extend_from_slice(&xmin.to_le_bytes());
    buf.extend_from_slice(&xmax.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

fn decode_entry(raw: &[u8]) -> (Xid, Xid, &[u8]) {
    let xmin = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let xmax = u64::from_le_bytes(raw[8..16].try_into().unwrap());
    (xmin, xmax, &raw[16..])
}

/// The set of XIDs active when a repeatable-read transaction began, plus the
/// smallest of them ("xmin-limit"): an entry created by a later-starting
/// transaction is never visible, no matter what it later commits to (§4.8.1).
#[derive(Debug, Clone)]
pub struct Snapshot {
    active: HashSet<Xid>,
    xmin_limit: Xid,
}

/// A live transaction handle returned by `VersionManager::begin`.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub xid: Xid,
    pub level: IsolationLevel,
    snapshot: Option<Snapshot>,
}

pub struct VersionManager {
    dm: Arc<DataManager>,
    tss: Arc<Tss>,
    lock_table: Arc<LockTable>,
    active: Mutex<HashSet<Xid>>,
}

impl VersionManager {
    pub fn new(dm: Arc<DataManager>, tss: Arc<Tss>, lock_table: Arc<LockTable>) -> Self {
        Self {
            dm,
            tss,
            lock_table,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Transaction> {
        let xid = self.tss.begin()?;
        let snapshot = if level == IsolationLevel::RepeatableRead {
            let active = self.active.lock();
            let xmin_limit = active.iter().copied().min().unwrap_or(xid + 1);
            Some(Snapshot {
                active: active.clone(),
                xmin_limit,
            })
        } else {
            None
        };
        self.active.lock().insert(xid);
        debug!(xid, ?level, "transaction began");
        Ok(Transaction { xid, level, snapshot })
    }

    pub fn commit(&self, txn: Transaction) -> Result<()> {
        self.active.lock().remove(&txn.xid);
        self.tss.commit(txn.xid)?;
        self.lock_table.remove(txn.xid);
        debug!(xid = txn.xid, "transaction committed");
        Ok(())
    }

    pub fn abort(&self, txn: Transaction) -> Result<()> {
        self.active.lock().remove(&txn.xid);
        self.tss.abort(txn.xid)?;
        self.lock_table.remove(txn.xid);
        debug!(xid = txn.xid, "transaction aborted");
        Ok(())
    }

    fn visible_rc(&self, t: Xid, c: Xid, d: Xid) -> bool {
        if c == t && d == 0 {
            return true;
        }
        if self.tss.is_committed(c) {
            if d == 0 {
                return true;
            }
            if d != t && !self.tss.is_committed(d) {
                return true;
            }
        }
        false
    }

    fn visible_rr(&self, t: Xid, c: Xid, d: Xid, snap: &Snapshot) -> bool {
        if c == t && d == 0 {
            return true;
        }
        if c >= snap.xmin_limit {
            return false;
        }
        let creator_committed_before_snapshot = self.tss.is_committed(c) && !snap.active.contains(&c);
        if !creator_committed_before_snapshot {
            return false;
        }
        if d == 0 {
            return true;
        }
        let deleter_committed_before_snapshot = self.tss.is_committed(d) && !snap.active.contains(&d);
        if d != t && !deleter_committed_before_snapshot {
            return true;
        }
        false
    }

    fn visible(&self, txn: &Transaction, xmin: Xid, xmax: Xid) -> bool {
        match &txn.snapshot {
            None => self.visible_rc(txn.xid, xmin, xmax),
            Some(snap) => self.visible_rr(txn.xid, xmin, xmax, snap),
        }
    }

    /// Read `uid` as seen by `txn`. `None` if the underlying item is
    /// tombstoned or the entry isn't visible under `txn`'s isolation rule.
    pub fn read(&self, txn: &Transaction, uid: Uid) -> Result<Option<Vec<u8>>> {
        let di = match self.dm.read(uid)? {
            Some(di) => di,
            None => return Ok(None),
        };
        let raw = di.data();
        self.dm.release(&di)?;
        let (xmin, xmax, data) = decode_entry(&raw);
        trace!(xid = txn.xid, uid, xmin, xmax, "mvcc read");
        if self.visible(txn, xmin, xmax) {
            Ok(Some(data.to_vec()))
        } else {
            Ok(None)
        }
    }

    pub fn insert(&self, txn: &Transaction, data: &[u8]) -> Result<Uid> {
        let entry = encode_entry(txn.xid, 0, data);
        let uid = self.dm.insert(txn.xid, &entry)?;
        trace!(xid = txn.xid, uid, "mvcc insert");
        Ok(uid)
    }

    /// Logically delete `uid` on behalf of `txn`: set its `xmax`. Returns
    /// `Ok(false)` if the entry isn't currently visible to `txn` (nothing to
    /// delete from its point of view), `Err(ConcurrentUpdate)` if another
    /// live transaction already deleted it, `Err(Deadlock)` if acquiring the
    /// row lock would close a wait-for cycle.
    pub fn delete(&self, txn: &Transaction, uid: Uid) -> Result<bool> {
        {
            let di = self.dm.read(uid)?.ok_or(DbError::NullEntry(uid))?;
            let raw = di.data();
            self.dm.release(&di)?;
            let (xmin, xmax, _) = decode_entry(&raw);
            if !self.visible(txn, xmin, xmax) {
                return Ok(false);
            }
            if xmax != 0 && xmax != txn.xid {
                return Err(DbError::ConcurrentUpdate { uid, other: xmax });
            }
        }

        if let Some(latch) = self.lock_table.add(txn.xid, uid)? {
            latch.wait();
        }

        let di = self.dm.read(uid)?.ok_or(DbError::NullEntry(uid))?;
        let raw = di.data();
        let (xmin, xmax, data) = decode_entry(&raw);
        if !self.visible(txn, xmin, xmax) {
            self.dm.release(&di)?;
            return Ok(false);
        }
        if xmax != 0 && xmax != txn.xid {
            self.dm.release(&di)?;
            return Err(DbError::ConcurrentUpdate { uid, other: xmax });
        }

        let new_raw = encode_entry(xmin, txn.xid, data);
        di.before();
        di.overwrite(&new_raw);
        di.after(txn.xid)?;
        self.dm.release(&di)?;
        debug!(xid = txn.xid, uid, "mvcc delete");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_manager::DataManager;
    use tempfile::tempdir;

    fn fresh_vm() -> (tempfile::TempDir, VersionManager) {
        let dir = tempdir().unwrap();
        let tss = Arc::new(Tss::create(dir.path().join("t.xid")).unwrap());
        let dm = Arc::new(DataManager::create(dir.path().join("t.db"), dir.path().join("t.log"), 16).unwrap());
        let lt = Arc::new(LockTable::new());
        (dir, VersionManager::new(dm, tss, lt))
    }

    #[test]
    fn read_committed_sees_own_uncommitted_writes() {
        let (_dir, vm) = fresh_vm();
        let txn = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(&txn, b"hello").unwrap();
        assert_eq!(vm.read(&txn, uid).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn read_committed_hides_other_active_transactions_writes() {
        let (_dir, vm) = fresh_vm();
        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(&t1, b"hello").unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(&t2, uid).unwrap(), None);

        vm.commit(t1).unwrap();
        assert_eq!(vm.read(&t2, uid).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn repeatable_read_snapshot_is_stable_across_later_commits() {
        let (_dir, vm) = fresh_vm();
        let t1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();

        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(&t2, b"new row").unwrap();
        vm.commit(t2).unwrap();

        assert_eq!(vm.read(&t1, uid).unwrap(), None);

        let t3 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(&t3, uid).unwrap(), Some(b"new row".to_vec()));
    }

    #[test]
    fn concurrent_delete_conflict_is_reported() {
        let (_dir, vm) = fresh_vm();
        let t0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(&t0, b"row").unwrap();
        vm.commit(t0).unwrap();

        let t1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let t2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();

        assert!(vm.delete(&t1, uid).unwrap());
        let err = vm.delete(&t2, uid);
        assert!(matches!(err, Err(DbError::ConcurrentUpdate { .. })));
    }
}
