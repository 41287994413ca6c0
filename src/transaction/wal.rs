//! Write-ahead log (WAL, §4.3). File layout: `[xchecksum:4] [rec1] [rec2] …
//! [badtail?]`. Each record is `[size:4][checksum:4][data:size]`. The
//! checksum is a running multiplicative fold, not CRC: `c' = c*SEED + byte`.
//! `xchecksum` folds every record's checksum the same way, so a single
//! corrupted byte anywhere invalidates everything appended after it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::common::{page_of, Uid, Xid};
use crate::error::{DbError, Result};

/// Multiplicative fold seed (§4.3). Arbitrary but fixed for the file format.
const SEED: u32 = 13331;

fn fold(seed: u32, bytes: &[u8]) -> u32 {
    let mut c = seed;
    for &b in bytes {
        c = c.wrapping_mul(SEED).wrapping_add(b as u32);
    }
    c
}

fn record_checksum(data: &[u8]) -> u32 {
    fold(0, data)
}

fn fold_xchecksum(xchecksum: u32, record_checksum: u32) -> u32 {
    fold(xchecksum, &record_checksum.to_le_bytes())
}

/// The two WAL record kinds DM/VM ever emit (§6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Insert {
        xid: Xid,
        pgno: u32,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

impl WalRecord {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            WalRecord::Insert { xid, pgno, offset, raw } => {
                let mut buf = Vec::with_capacity(1 + 8 + 4 + 2 + raw.len());
                buf.push(TYPE_INSERT);
                buf.extend_from_slice(&xid.to_le_bytes());
                buf.extend_from_slice(&pgno.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(raw);
                buf
            }
            WalRecord::Update { xid, uid, old_raw, new_raw } => {
                let mut buf = Vec::with_capacity(1 + 8 + 8 + old_raw.len() + new_raw.len());
                buf.push(TYPE_UPDATE);
                buf.extend_from_slice(&xid.to_le_bytes());
                buf.extend_from_slice(&uid.to_le_bytes());
                buf.extend_from_slice(old_raw);
                buf.extend_from_slice(new_raw);
                buf
            }
        }
    }

    /// Decode a record body. Returns `None` for an unrecognized leading byte
    /// (never produced by this crate, but guards against a hand-corrupted
    /// file slipping past the checksum).
    pub fn decode(data: &[u8]) -> Option<WalRecord> {
        if data.is_empty() {
            return None;
        }
        match data[0] {
            TYPE_INSERT => {
                if data.len() < 1 + 8 + 4 + 2 {
                    return None;
                }
                let xid = u64::from_le_bytes(data[1..9].try_into().ok()?);
                let pgno = u32::from_le_bytes(data[9..13].try_into().ok()?);
                let offset = u16::from_le_bytes(data[13..15].try_into().ok()?);
                let raw = data[15..].to_vec();
                Some(WalRecord::Insert { xid, pgno, offset, raw })
            }
            TYPE_UPDATE => {
                if data.len() < 1 + 8 + 8 {
                    return None;
                }
                let xid = u64::from_le_bytes(data[1..9].try_into().ok()?);
                let uid = u64::from_le_bytes(data[9..17].try_into().ok()?);
                let rest = &data[17..];
                if rest.len() % 2 != 0 {
                    return None;
                }
                let half = rest.len() / 2;
                Some(WalRecord::Update {
                    xid,
                    uid,
                    old_raw: rest[..half].to_vec(),
                    new_raw: rest[half..].to_vec(),
                })
            }
            _ => None,
        }
    }

    pub fn xid(&self) -> Xid {
        match self {
            WalRecord::Insert { xid, .. } => *xid,
            WalRecord::Update { xid, .. } => *xid,
        }
    }

    /// Page a redo/undo of this record must touch.
    pub fn pgno(&self) -> u32 {
        match self {
            WalRecord::Insert { pgno, .. } => *pgno,
            WalRecord::Update { uid, .. } => page_of(*uid),
        }
    }
}

struct State {
    file: File,
    /// Byte offset of the next record to hand back from `next`.
    cursor: u64,
    xchecksum: u32,
    /// Set once `next` hits a truncated or checksum-mismatched record; the
    /// offset it stopped at is the first bad byte, ready for `truncate`.
    bad_tail: Option<u64>,
}

/// Append-only, checksum-framed log. One mutex guards append+fsync; iteration
/// (`rewind`/`next`) is single-threaded by contract (only recovery iterates).
pub struct Wal {
    state: Mutex<State>,
    path: PathBuf,
}

const HEADER_LEN: u64 = 4;

impl Wal {
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
        file.write_all(&0u32.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self {
            state: Mutex::new(State {
                file,
                cursor: HEADER_LEN,
                xchecksum: 0,
                bad_tail: None,
            }),
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
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(DbError::BadLogFile {
                path: path.display().to_string(),
                reason: format!("file is only {len} bytes, shorter than the 4-byte header"),
            });
        }
        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; 4];
        file.read_exact(&mut header)?;
        let xchecksum = u32::from_le_bytes(header);
        Ok(Self {
            state: Mutex::new(State {
                file,
                cursor: HEADER_LEN,
                xchecksum,
                bad_tail: None,
            }),
            path,
        })
    }

    /// Append `data` as a new record, fold it into the running `xchecksum`,
    /// and fsync before returning. §5: any caller relying on this record's
    /// effect being durable must see this return `Ok` first.
    pub fn log(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let checksum = record_checksum(data);
        let mut record = Vec::with_capacity(8 + data.len());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(data);

        state.file.seek(SeekFrom::End(0))?;
        state
            .file
            .write_all(&record)
            .unwrap_or_else(|e| panic!("WAL append failed, durability invariant broken: {e}"));
        state.file.sync_all().unwrap_or_else(|e| {
            panic!("WAL fsync failed, durability invariant broken: {e}")
        });

        state.xchecksum = fold_xchecksum(state.xchecksum, checksum);
        state.file.seek(SeekFrom::Start(0))?;
        state
            .file
            .write_all(&state.xchecksum.to_le_bytes())
            .unwrap_or_else(|e| panic!("WAL header update failed: {e}"));
        state
            .file
            .sync_all()
            .unwrap_or_else(|e| panic!("WAL header fsync failed: {e}"));
        trace!(bytes = data.len(), "wal record appended");
        Ok(())
    }

    /// Reset the iterator to the first record, right after the header.
    pub fn rewind(&self) {
        let mut state = self.state.lock();
        state.cursor = HEADER_LEN;
        state.bad_tail = None;
    }

    /// Return the next record's data, or `None` at a clean EOF or a bad
    /// tail. A record whose declared length runs past the end of the file,
    /// or whose checksum disagrees, stops iteration and remembers the
    /// offset it stopped at as the bad tail (§9 open question, resolved in
    /// favor of "truncate", not "panic").
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        if state.bad_tail.is_some() {
            return Ok(None);
        }
        let len = state.file.metadata()?.len();
        let start = state.cursor;
        if start >= len {
            return Ok(None);
        }
        if start + 8 > len {
            warn!(offset = start, "wal record header runs past eof, marking bad tail");
            state.bad_tail = Some(start);
            return Ok(None);
        }
        state.file.seek(SeekFrom::Start(start))?;
        let mut header = [0u8; 8];
        state.file.read_exact(&mut header)?;
        let size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if start + 8 + size > len {
            warn!(offset = start, size, "wal record body runs past eof, marking bad tail");
            state.bad_tail = Some(start);
            return Ok(None);
        }
        let mut data = vec![0u8; size as usize];
        state.file.read_exact(&mut data)?;
        if record_checksum(&data) != checksum {
            warn!(offset = start, "wal record checksum mismatch, marking bad tail");
            state.bad_tail = Some(start);
            return Ok(None);
        }
        state.cursor = start + 8 + size;
        Ok(Some(data))
    }

    /// Offset of the first corrupted byte found by the last `next` pass, if
    /// any. Recovery truncates to here once it has finished scanning.
    pub fn bad_tail_offset(&self) -> Option<u64> {
        self.state.lock().bad_tail
    }

    /// Cut the file down to `len` bytes. Used to drop a bad tail, or by
    /// tests exercising truncation directly.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let state = self.state.lock();
        state.file.set_len(len)?;
        state.file.sync_all()?;
        Ok(())
    }

    /// Convenience wrapper: truncate to the bad tail recorded by the last
    /// scan, if one was found.
    pub fn truncate_bad_tail(&self) -> Result<()> {
        if let Some(offset) = self.bad_tail_offset() {
            debug!(offset, "truncating wal bad tail");
            self.truncate(offset)?;
        }
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

    fn fresh_wal() -> (tempfile::TempDir, Wal) {
        let dir = tempdir().unwrap();
        let wal = Wal::create(dir.path().join("t.log")).unwrap();
        (dir, wal)
    }

    #[test]
    fn log_then_iterate_round_trips() {
        let (_dir, wal) = fresh_wal();
        let rec = WalRecord::Insert {
            xid: 1,
            pgno: 2,
            offset: 2,
            raw: vec![0, 3, 0, 1, 2, 3],
        };
        wal.log(&rec.encode()).unwrap();

        wal.rewind();
        let got = wal.next().unwrap().unwrap();
        assert_eq!(WalRecord::decode(&got).unwrap(), rec);
        assert!(wal.next().unwrap().is_none());
        assert!(wal.bad_tail_offset().is_none());
    }

    #[test]
    fn truncated_last_record_is_a_bad_tail() {
        let (_dir, wal) = fresh_wal();
        let rec = WalRecord::Update {
            xid: 5,
            uid: 42,
            old_raw: vec![1, 2, 3],
            new_raw: vec![4, 5, 6],
        };
        wal.log(&rec.encode()).unwrap();
        let good_len = wal.path().metadata().unwrap().len();
        // append some extra garbage bytes that look like the start of a new
        // record header but are then cut short.
        wal.log(&[9, 9, 9]).unwrap();
        wal.truncate(good_len + 4).unwrap();

        wal.rewind();
        let first = wal.next().unwrap().unwrap();
        assert_eq!(WalRecord::decode(&first).unwrap(), rec);
        assert!(wal.next().unwrap().is_none());
        assert!(wal.bad_tail_offset().is_some());

        wal.truncate_bad_tail().unwrap();
        assert_eq!(wal.path().metadata().unwrap().len(), good_len);
    }

    #[test]
    fn corrupted_checksum_is_a_bad_tail() {
        let (_dir, wal) = fresh_wal();
        let rec = WalRecord::Insert {
            xid: 1,
            pgno: 1,
            offset: 2,
            raw: vec![0, 1, 0, 7],
        };
        wal.log(&rec.encode()).unwrap();

        // flip a byte inside the record's data region, past the 8 byte frame
        // header, so the checksum no longer matches.
        {
            let mut f = OpenOptions::new().write(true).open(wal.path()).unwrap();
            f.seek(SeekFrom::Start(HEADER_LEN + 8)).unwrap();
            f.write_all(&[0xFFu8]).unwrap();
        }

        wal.rewind();
        assert!(wal.next().unwrap().is_none());
        assert!(wal.bad_tail_offset().is_some());
    }
}
