//! Storage and transaction core of a small relational database engine:
//! paged heap storage, a write-ahead log, durable transaction state, MVCC
//! versioning, a deadlock-detecting lock table, and crash recovery. SQL
//! parsing, the table manager, secondary indexes, the wire protocol, and the
//! interactive shell are out of scope, external collaborators this crate's
//! `Database` handle (§6.4) is built to be embedded underneath.

pub mod buffer;
pub mod common;
pub mod config;
pub mod data_manager;
pub mod db;
pub mod error;
pub mod storage;
pub mod transaction;

pub use common::{IsolationLevel, Uid, Xid};
pub use config::EngineOptions;
pub use data_manager::DataManager;
pub use db::Database;
pub use error::{DbError, Result};
pub use transaction::Transaction;
