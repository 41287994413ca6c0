//! Recovery (§4.10): driven once at `Database::open` when Page 0's markers
//! disagree. Redoes every committed operation in log order, undoes every
//! operation whose transaction never committed in reverse log order, then
//! retires any XID recovery finds still ACTIVE.

use tracing::{info, warn};

use crate::buffer::page_cache::PageCache;
use crate::common::offset_of;
use crate::error::Result;
use crate::storage::page::PageX;
use crate::transaction::tss::Tss;
use crate::transaction::wal::{Wal, WalRecord};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub redone: usize,
    pub undone: usize,
    pub retired: usize,
    pub truncated_to_pgno: u32,
}

/// Run the full redo/undo procedure against an already-open page cache and
/// WAL. Returns once every committed write is durably reapplied and every
/// uncommitted write has been rolled back to a tombstone or its pre-image.
pub fn recover(wal: &Wal, tss: &Tss, pc: &PageCache) -> Result<RecoveryStats> {
    wal.rewind();
    let mut records = Vec::new();
    while let Some(bytes) = wal.next()? {
        if let Some(rec) = WalRecord::decode(&bytes) {
            records.push(rec);
        }
    }
    wal.truncate_bad_tail()?;

    let max_pgno = records.iter().map(WalRecord::pgno).max().unwrap_or(0);
    pc.truncate_by_pgno(max_pgno)?;
    info!(records = records.len(), max_pgno, "recovery scan complete");

    let mut redone = 0;
    for rec in &records {
        if rec.pgno() > max_pgno {
            continue;
        }
        if tss.is_committed(rec.xid()) {
            apply_redo(pc, rec)?;
            redone += 1;
        }
    }

    let mut undone = 0;
    for rec in records.iter().rev() {
        if rec.pgno() > max_pgno {
            continue;
        }
        if !tss.is_committed(rec.xid()) {
            apply_undo(pc, rec)?;
            undone += 1;
        }
    }

    let mut retired = 0;
    for xid in 1..=tss.max_xid() {
        if tss.is_active(xid) {
            tss.abort(xid)?;
            retired += 1;
        }
    }

    warn!(redone, undone, retired, "recovery applied");
    Ok(RecoveryStats {
        redone,
        undone,
        retired,
        truncated_to_pgno: max_pgno,
    })
}

fn apply_redo(pc: &PageCache, rec: &WalRecord) -> Result<()> {
    match rec {
        WalRecord::Insert { pgno, offset, raw, .. } => {
            let frame = pc.get_page(*pgno)?;
            frame.write(|buf| PageX::recover_insert(buf, raw, *offset));
            pc.release(&frame)
        }
        WalRecord::Update { uid, new_raw, .. } => {
            let pgno = crate::common::page_of(*uid);
            let offset = offset_of(*uid);
            let frame = pc.get_page(pgno)?;
            frame.write(|buf| PageX::recover_update(buf, new_raw, offset));
            pc.release(&frame)
        }
    }
}

fn apply_undo(pc: &PageCache, rec: &WalRecord) -> Result<()> {
    match rec {
        WalRecord::Insert { pgno, offset, raw, .. } => {
            let mut tombstone = raw.clone();
            tombstone[0] = 1;
            let frame = pc.get_page(*pgno)?;
            frame.write(|buf| PageX::recover_update(buf, &tombstone, *offset));
            pc.release(&frame)
        }
        WalRecord::Update { uid, old_raw, .. } => {
            let pgno = crate::common::page_of(*uid);
            let offset = offset_of(*uid);
            let frame = pc.get_page(pgno)?;
            frame.write(|buf| PageX::recover_update(buf, old_raw, offset));
            pc.release(&frame)
        }
    }
}
