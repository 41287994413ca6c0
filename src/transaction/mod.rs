//! Transaction core: durable per-XID status (L0), the write-ahead log (L2),
//! MVCC versioning (L7), the lock table (L8), and crash recovery (L9). See
//! `crate::storage` and `crate::buffer` for the layers below these.

pub mod lock_table;
pub mod mvcc;
pub mod recovery;
pub mod tss;
pub mod wal;

pub use lock_table::{Latch, LockTable};
pub use mvcc::{Snapshot, Transaction, VersionManager};
pub use recovery::{recover, RecoveryStats};
pub use tss::Tss;
pub use wal::{Wal, WalRecord};
