use thiserror::Error;

/// Error kinds the storage and transaction core must distinguish.
///
/// Recoverable, user-facing kinds (`ConcurrentUpdate`, `Deadlock`, `NullEntry`,
/// `DataTooLarge`, `DatabaseBusy`) are ordinary returns the caller may retry or
/// report. Durability violations (WAL fsync failure, TSS fsync failure, file
/// extension failure) are not represented here: those escalate to `panic!` at
/// the call site per the core's error handling design, rather than being
/// silently downgraded to a `Result`.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("bad state file at {path}: expected size {expected}, found {found}")]
    BadStateFile {
        path: String,
        expected: u64,
        found: u64,
    },

    #[error("bad log file at {path}: {reason}")]
    BadLogFile { path: String, reason: String },

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("file does not exist: {0}")]
    FileNotExists(String),

    #[error("cannot open file for read/write: {0}")]
    FileCannotRW(String),

    #[error("page cache is full and no page can be evicted")]
    CacheFull,

    #[error("database busy: no cache slot available to satisfy the request")]
    DatabaseBusy,

    #[error("data of {size} bytes exceeds max free space {max}")]
    DataTooLarge { size: usize, max: usize },

    #[error("concurrent update: xid {other} already deleted uid {uid}")]
    ConcurrentUpdate { uid: u64, other: u64 },

    #[error("deadlock detected, transaction {xid} aborted")]
    Deadlock { xid: u64 },

    #[error("uid {0} refers to a dead or missing entry")]
    NullEntry(u64),

    #[error("requested cache of {requested} pages is below the minimum of {minimum}")]
    MemTooSmall { requested: usize, minimum: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
