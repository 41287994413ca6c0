//! End-to-end scenarios against the public `Database` handle (spec §8). Each
//! test gets its own scratch directory via `tempfile::tempdir` so none share
//! on-disk state.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rusty_db::{DbError, EngineOptions, IsolationLevel};

fn opts() -> EngineOptions {
    EngineOptions::new(16).unwrap()
}

/// The crate never installs a global subscriber itself (§10.2); tests do it
/// once so a failing assertion's `tracing` output is visible instead of
/// silently dropped. Safe to call from every test since the second and later
/// calls just find a subscriber already set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn clean_lifecycle_survives_reopen_without_recovery() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("t");

    let db = rusty_db::Database::create(&prefix, opts()).unwrap();
    let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = db.insert(&txn, b"hello").unwrap();
    db.commit(txn).unwrap();
    db.close().unwrap();

    let db = rusty_db::Database::open(&prefix, opts()).unwrap();
    let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(db.read(&reader, uid).unwrap(), Some(b"hello".to_vec()));
    db.commit(reader).unwrap();
    db.close().unwrap();
}

#[test]
fn crash_after_commit_redoes_the_insert() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("t");

    let db = rusty_db::Database::create(&prefix, opts()).unwrap();
    let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = db.insert(&txn, b"abc").unwrap();
    db.commit(txn).unwrap();
    // a crash never calls close(), so page 0's open/close markers are left
    // disagreeing for the next open() to notice.
    drop(db);

    let db = rusty_db::Database::open(&prefix, opts()).unwrap();
    let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(db.read(&reader, uid).unwrap(), Some(b"abc".to_vec()));
    db.commit(reader).unwrap();
    db.close().unwrap();
}

#[test]
fn crash_with_uncommitted_writer_is_undone() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("t");

    let db = rusty_db::Database::create(&prefix, opts()).unwrap();
    let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = db.insert(&txn, b"xxx").unwrap();
    drop(txn); // never committed
    drop(db);

    let db = rusty_db::Database::open(&prefix, opts()).unwrap();
    let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(db.read(&reader, uid).unwrap(), None);
    db.commit(reader).unwrap();
    db.close().unwrap();
}

#[test]
fn concurrent_delete_of_the_same_row_conflicts() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = rusty_db::Database::create(dir.path().join("t"), opts()).unwrap();

    let setup = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = db.insert(&setup, b"row").unwrap();
    db.commit(setup).unwrap();

    let t1 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();

    assert!(db.delete(&t1, uid).unwrap());
    let err = db.delete(&t2, uid);
    assert!(matches!(err, Err(DbError::ConcurrentUpdate { .. })));

    db.commit(t1).unwrap();
    db.abort(t2).unwrap();
    db.close().unwrap();
}

// `Database::delete` resolves a conflict against an already-claimed row
// synchronously (see `concurrent_delete_of_the_same_row_conflicts`), so the
// lock table's queueing and deadlock-detecting path is only reached while
// racing for a row nobody has claimed yet, not reproducible deterministically
// through the public `Database` surface. Exercise it directly instead, at the
// layer it is actually implemented (`transaction::lock_table`), with the same
// literal shape as the cross-locking scenario: two transactions each hold one
// resource and then reach for the other's.
#[test]
fn deadlock_aborts_the_cycle_closer_and_unblocks_the_survivor() {
    init_tracing();
    use rusty_db::transaction::LockTable;

    let lt = Arc::new(LockTable::new());
    let (xid1, xid2) = (1u64, 2u64);
    let (uid1, uid2) = (10u64, 20u64);

    // t1 locks u1, t2 locks u2.
    assert!(lt.add(xid1, uid1).unwrap().is_none());
    assert!(lt.add(xid2, uid2).unwrap().is_none());

    // t1 reaches for u2 (held by t2) and blocks on another thread.
    let latch = lt.add(xid1, uid2).unwrap().expect("u2 is held, t1 must queue");
    let lt_bg = lt.clone();
    let blocked = thread::spawn(move || {
        latch.wait();
        lt_bg.add(xid1, uid2)
    });

    // give the background thread time to register its wait before t2 closes
    // the cycle; there is no public hook to observe "queued" from here, so a
    // short deterministic sleep stands in for a handshake.
    thread::sleep(Duration::from_millis(50));

    // t2 reaching for u1 (held by t1) closes the wait-for cycle: t2 -> u1 ->
    // t1 -> u2 -> t2. The requester (t2) is the one aborted.
    let err = lt.add(xid2, uid1);
    assert!(matches!(err, Err(DbError::Deadlock { xid }) if xid == xid2));

    // t2 aborts: release everything it holds, which hands u2 to t1's queued
    // request and wakes it.
    lt.remove(xid2);
    assert!(blocked.join().unwrap().unwrap().is_none());

    lt.remove(xid1);
}

#[test]
fn repeatable_read_snapshot_is_stable_across_a_later_commit() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = rusty_db::Database::create(dir.path().join("t"), opts()).unwrap();

    let t1 = db.begin(IsolationLevel::RepeatableRead).unwrap();

    let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    let uid = db.insert(&t2, b"new row").unwrap();
    db.commit(t2).unwrap();

    // t1's snapshot was taken before t2 began, so the new row is invisible
    // no matter that t2 has since committed.
    assert_eq!(db.read(&t1, uid).unwrap(), None);

    let t3 = db.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(db.read(&t3, uid).unwrap(), Some(b"new row".to_vec()));

    db.commit(t1).unwrap();
    db.commit(t3).unwrap();
    db.close().unwrap();
}
