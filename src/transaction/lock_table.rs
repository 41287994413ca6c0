//! Lock table (LT, §4.9): a wait-for graph over UIDs with DFS-based deadlock
//! detection. Every waiter owns its own latch, a one-shot binary semaphore
//! registered in the graph and signaled by whichever `remove` call hands the
//! resource to it, rather than everyone blocking on one global condition
//! (§9 redesign note).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::common::{Uid, Xid};
use crate::error::{DbError, Result};

/// A single-use, manually-signaled latch. `wait` blocks until some other
/// thread calls `release`; calling `release` twice, or on an already-released
/// latch, is harmless.
pub struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            released: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }

    fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.cond.notify_all();
    }
}

#[derive(Default)]
struct Graph {
    holds: HashMap<Uid, Xid>,
    waits: HashMap<Xid, Uid>,
    queue: HashMap<Uid, VecDeque<Xid>>,
    latches: HashMap<Xid, Arc<Latch>>,
}

impl Graph {
    /// Does adding `waits[start] = uid` (already applied by the caller) close
    /// a cycle back to `start`? Walk holder-of-what-I-wait-on repeatedly.
    fn creates_cycle(&self, start: Xid) -> bool {
        let mut current = start;
        let mut seen: HashSet<Xid> = HashSet::new();
        seen.insert(current);
        loop {
            let uid = match self.waits.get(&current) {
                Some(uid) => *uid,
                None => return false,
            };
            let holder = match self.holds.get(&uid) {
                Some(holder) => *holder,
                None => return false,
            };
            if holder == start {
                return true;
            }
            if !seen.insert(holder) {
                // a cycle exists but it doesn't loop back to `start`; can't
                // happen in a well-formed graph (every waiter has exactly one
                // outgoing wait edge), but bail out rather than spin forever.
                return false;
            }
            current = holder;
        }
    }
}

/// Wait-for graph plus per-resource FIFO queues (§3, §4.9).
pub struct LockTable {
    inner: Mutex<Graph>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Graph::default()),
        }
    }

    /// Request exclusive access to `uid` on behalf of `xid`. Returns `Ok(None)`
    /// if the lock was granted immediately (including re-entrant: `xid`
    /// already holds it); `Ok(Some(latch))` if the caller must block on
    /// `latch.wait()`; `Err(Deadlock)` if granting the wait would close a
    /// cycle, in which case `xid`'s wait is rolled back before returning.
    pub fn add(&self, xid: Xid, uid: Uid) -> Result<Option<Arc<Latch>>> {
        let mut g = self.inner.lock();

        if g.holds.get(&uid) == Some(&xid) {
            return Ok(None);
        }
        if !g.holds.contains_key(&uid) {
            g.holds.insert(uid, xid);
            trace!(xid, uid, "lock granted immediately");
            return Ok(None);
        }

        let latch = Latch::new();
        g.latches.insert(xid, latch.clone());
        g.waits.insert(xid, uid);
        g.queue.entry(uid).or_default().push_back(xid);

        if g.creates_cycle(xid) {
            warn!(xid, uid, "deadlock detected, aborting requester");
            if let Some(q) = g.queue.get_mut(&uid) {
                q.retain(|&w| w != xid);
            }
            g.waits.remove(&xid);
            g.latches.remove(&xid);
            return Err(DbError::Deadlock { xid });
        }

        trace!(xid, uid, "lock request queued");
        Ok(Some(latch))
    }

    /// Release every resource `xid` holds, handing each to the next queued
    /// waiter (if any) and signaling its latch. Also clears any wait `xid`
    /// itself was registered for (used when aborting a blocked waiter).
    pub fn remove(&self, xid: Xid) {
        let mut g = self.inner.lock();

        let held: Vec<Uid> = g
            .holds
            .iter()
            .filter(|&(_, &holder)| holder == xid)
            .map(|(&uid, _)| uid)
            .collect();

        for uid in held {
            g.holds.remove(&uid);
            let next = g.queue.get_mut(&uid).and_then(|q| q.pop_front());
            match next {
                Some(waiter) => {
                    g.holds.insert(uid, waiter);
                    g.waits.remove(&waiter);
                    if let Some(latch) = g.latches.remove(&waiter) {
                        latch.release();
                    }
                    trace!(xid, uid, waiter, "lock handed to next waiter");
                }
                None => {
                    g.queue.remove(&uid);
                }
            }
        }

        g.waits.remove(&xid);
        g.latches.remove(&xid);
        for q in g.queue.values_mut() {
            q.retain(|&w| w != xid);
        }
    }

    #[cfg(test)]
    fn holds(&self, uid: Uid) -> Option<Xid> {
        self.inner.lock().holds.get(&uid).copied()
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        let g = self.inner.lock();
        for (&uid, queue) in &g.queue {
            for &xid in queue {
                if g.waits.get(&xid) != Some(&uid) {
                    return false;
                }
            }
        }
        for (&xid, &uid) in &g.waits {
            match g.queue.get(&uid) {
                Some(q) if q.contains(&xid) => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_requester_gets_lock_immediately() {
        let lt = LockTable::new();
        assert!(lt.add(1, 100).unwrap().is_none());
        assert_eq!(lt.holds(100), Some(1));
    }

    #[test]
    fn reentrant_request_is_free() {
        let lt = LockTable::new();
        assert!(lt.add(1, 100).unwrap().is_none());
        assert!(lt.add(1, 100).unwrap().is_none());
    }

    #[test]
    fn second_requester_queues_and_wakes_on_remove() {
        let lt = Arc::new(LockTable::new());
        assert!(lt.add(1, 100).unwrap().is_none());
        let latch = lt.add(2, 100).unwrap().expect("should queue");
        assert!(lt.invariants_hold());

        let lt2 = lt.clone();
        let handle = thread::spawn(move || {
            latch.wait();
            lt2.holds(100)
        });

        thread::sleep(Duration::from_millis(20));
        lt.remove(1);
        assert_eq!(handle.join().unwrap(), Some(2));
    }

    #[test]
    fn cycle_is_rejected_as_deadlock() {
        let lt = LockTable::new();
        assert!(lt.add(1, 10).unwrap().is_none());
        assert!(lt.add(2, 20).unwrap().is_none());
        // 1 waits on 20 (held by 2) -- queues fine.
        assert!(lt.add(1, 20).unwrap().is_some());
        // 2 waits on 10 (held by 1): 2 -> 10 -> 1 -> 20 -> 2, a cycle.
        let err = lt.add(2, 10);
        assert!(matches!(err, Err(DbError::Deadlock { xid: 2 })));
        assert!(lt.invariants_hold());
    }
}
