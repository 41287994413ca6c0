//! Transaction state store (TSS, §4.1): the durable ACTIVE/COMMITTED/ABORTED
//! status of every XID ever allocated. A single file: an 8-byte header
//! holding the maximum XID allocated so far, followed by one status byte per
//! XID (1-based: XID 1's byte sits right after the header).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::trace;

use crate::common::{Xid, XID_SUPER};
use crate::error::{DbError, Result};

const HEADER_LEN: u64 = 8;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

struct State {
    file: File,
    max_xid: Xid,
}

/// Durable per-XID status. `begin` is the only operation that allocates a new
/// XID, so it is the only one that needs the whole-file mutex; `commit`/
/// `abort` only ever touch their own XID's byte.
pub struct Tss {
    state: Mutex<State>,
    path: PathBuf,
}

fn slot_offset(xid: Xid) -> u64 {
    debug_assert!(xid >= 1, "xid 0 is the super-transaction and has no on-disk slot");
    HEADER_LEN + (xid - 1)
}

impl Tss {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(DbError::FileExists(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|_| DbError::FileCannotRW(path.display().to_string()))?;
        file.write_all(&0u64.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self {
            state: Mutex::new(State { file, max_xid: 0 }),
            path,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(DbError::FileNotExists(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| DbError::FileCannotRW(path.display().to_string()))?;
        let actual_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        let max_xid = u64::from_le_bytes(header);
        let expected_len = HEADER_LEN + max_xid;
        if actual_len != expected_len {
            return Err(DbError::BadStateFile {
                path: path.display().to_string(),
                expected: expected_len,
                found: actual_len,
            });
        }
        Ok(Self {
            state: Mutex::new(State { file, max_xid }),
            path,
        })
    }

    /// Allocate the next XID, mark it ACTIVE, and fsync. The only writer of
    /// `max_xid`, so it serializes under the whole-file mutex (§5).
    pub fn begin(&self) -> Result<Xid> {
        let mut state = self.state.lock();
        let xid = state.max_xid + 1;
        let offset = slot_offset(xid);
        state.file.seek(SeekFrom::Start(offset))?;
        state
            .file
            .write_all(&[STATUS_ACTIVE])
            .unwrap_or_else(|e| panic!("TSS status write failed, durability invariant broken: {e}"));
        state.file.seek(SeekFrom::Start(0))?;
        state
            .file
            .write_all(&xid.to_le_bytes())
            .unwrap_or_else(|e| panic!("TSS header write failed: {e}"));
        state
            .file
            .sync_all()
            .unwrap_or_else(|e| panic!("TSS fsync failed, durability invariant broken: {e}"));
        state.max_xid = xid;
        trace!(xid, "transaction began");
        Ok(xid)
    }

    fn write_status(&self, xid: Xid, status: u8) -> Result<()> {
        let mut state = self.state.lock();
        let offset = slot_offset(xid);
        state.file.seek(SeekFrom::Start(offset))?;
        state
            .file
            .write_all(&[status])
            .unwrap_or_else(|e| panic!("TSS status write failed, durability invariant broken: {e}"));
        state
            .file
            .sync_all()
            .unwrap_or_else(|e| panic!("TSS fsync failed, durability invariant broken: {e}"));
        Ok(())
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        trace!(xid, "transaction committed");
        self.write_status(xid, STATUS_COMMITTED)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        trace!(xid, "transaction aborted");
        self.write_status(xid, STATUS_ABORTED)
    }

    fn read_status(&self, xid: Xid) -> u8 {
        let mut state = self.state.lock();
        let offset = slot_offset(xid);
        state.file.seek(SeekFrom::Start(offset)).expect("seek into tss file");
        let mut byte = [0u8; 1];
        state.file.read_exact(&mut byte).expect("read tss status byte");
        byte[0]
    }

    pub fn is_active(&self, xid: Xid) -> bool {
        if xid == XID_SUPER {
            return false;
        }
        self.read_status(xid) == STATUS_ACTIVE
    }

    pub fn is_committed(&self, xid: Xid) -> bool {
        if xid == XID_SUPER {
            return true;
        }
        self.read_status(xid) == STATUS_COMMITTED
    }

    pub fn is_aborted(&self, xid: Xid) -> bool {
        if xid == XID_SUPER {
            return false;
        }
        self.read_status(xid) == STATUS_ABORTED
    }

    pub fn max_xid(&self) -> Xid {
        self.state.lock().max_xid
    }

    pub fn close(&self) -> Result<()> {
        let state = self.state.lock();
        state.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn begin_commit_abort_round_trip() {
        let dir = tempdir().unwrap();
        let tss = Tss::create(dir.path().join("t.xid")).unwrap();

        let a = tss.begin().unwrap();
        let b = tss.begin().unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(tss.is_active(a) && tss.is_active(b));

        tss.commit(a).unwrap();
        assert!(tss.is_committed(a));
        assert!(!tss.is_active(a));

        tss.abort(b).unwrap();
        assert!(tss.is_aborted(b));
    }

    #[test]
    fn super_transaction_is_always_committed() {
        let dir = tempdir().unwrap();
        let tss = Tss::create(dir.path().join("t.xid")).unwrap();
        assert!(tss.is_committed(XID_SUPER));
        assert!(!tss.is_active(XID_SUPER));
        assert!(!tss.is_aborted(XID_SUPER));
    }

    #[test]
    fn file_size_invariant_holds_after_many_begins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.xid");
        let tss = Tss::create(&path).unwrap();
        for _ in 0..8192 {
            tss.begin().unwrap();
        }
        assert_eq!(path.metadata().unwrap().len(), HEADER_LEN + 8192);
    }

    #[test]
    fn reopen_detects_truncated_file_as_bad_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.xid");
        {
            let tss = Tss::create(&path).unwrap();
            tss.begin().unwrap();
            tss.begin().unwrap();
        }
        // corrupt: chop off the last status byte.
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(HEADER_LEN + 1).unwrap();
        assert!(matches!(Tss::open(&path), Err(DbError::BadStateFile { .. })));
    }
}
