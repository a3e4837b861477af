//! Commit-time write locking over object collections.
//!
//! A committing transaction takes a write lock covering every object type
//! it touched, all at once, so readers and other committers see commits
//! as atomic per collection set. Establishment blocks until every wanted
//! collection is free; a concurrent abort of the owning transaction can
//! interrupt the wait.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{CoreError, CoreResult};
use crate::types::{ObjectTypeId, TransactionId};

#[derive(Debug, Default)]
struct LockState {
    held: HashSet<ObjectTypeId>,
}

/// Store-wide write lock coordination point.
#[derive(Debug, Default)]
pub(crate) struct LockSync {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockSync {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct LockFlags {
    aborted: bool,
    established: bool,
}

/// A write lock over a set of object collections.
///
/// Created unestablished; [`WriteLock::establish`] blocks until every
/// wanted collection is free or [`WriteLock::abort`] interrupts it.
pub(crate) struct WriteLock {
    sync: Arc<LockSync>,
    bases: Vec<ObjectTypeId>,
    txn: TransactionId,
    flags: Mutex<LockFlags>,
}

impl WriteLock {
    /// Creates an unestablished lock over `bases`.
    pub fn new(sync: Arc<LockSync>, txn: TransactionId, mut bases: Vec<ObjectTypeId>) -> Self {
        bases.sort_unstable();
        bases.dedup();
        Self {
            sync,
            bases,
            txn,
            flags: Mutex::new(LockFlags::default()),
        }
    }

    /// Blocks until every wanted collection is free, then claims them all.
    ///
    /// Fails with [`CoreError::LockRefused`] if [`Self::abort`] interrupted
    /// the wait.
    pub fn establish(&self) -> CoreResult<()> {
        let mut state = self.sync.state.lock();
        loop {
            if self.flags.lock().aborted {
                return Err(CoreError::LockRefused);
            }
            if self.bases.iter().all(|base| !state.held.contains(base)) {
                state.held.extend(self.bases.iter().copied());
                self.flags.lock().established = true;
                trace!(txn = %self.txn, bases = ?self.bases, "write lock established");
                return Ok(());
            }
            self.sync.cond.wait(&mut state);
        }
    }

    /// Releases an established lock.
    pub fn release(&self) {
        let mut state = self.sync.state.lock();
        let mut flags = self.flags.lock();
        if flags.established {
            for base in &self.bases {
                state.held.remove(base);
            }
            flags.established = false;
        }
        drop(flags);
        drop(state);
        self.sync.cond.notify_all();
    }

    /// Interrupts a pending establishment.
    ///
    /// Returns false if the lock is already established, in which case the
    /// holder must release it through the normal path.
    pub fn abort(&self) -> bool {
        let _state = self.sync.state.lock();
        let mut flags = self.flags.lock();
        if flags.established {
            return false;
        }
        flags.aborted = true;
        drop(flags);
        self.sync.cond.notify_all();
        true
    }
}

impl std::fmt::Debug for WriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLock")
            .field("txn", &self.txn)
            .field("bases", &self.bases)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn types(ids: &[u16]) -> Vec<ObjectTypeId> {
        ids.iter().map(|&id| ObjectTypeId::new(id)).collect()
    }

    #[test]
    fn disjoint_locks_coexist() {
        let sync = Arc::new(LockSync::new());
        let a = WriteLock::new(Arc::clone(&sync), TransactionId::new(1), types(&[1]));
        let b = WriteLock::new(Arc::clone(&sync), TransactionId::new(2), types(&[2]));

        a.establish().unwrap();
        b.establish().unwrap();
        a.release();
        b.release();
    }

    #[test]
    fn overlapping_lock_waits_for_release() {
        let sync = Arc::new(LockSync::new());
        let a = WriteLock::new(Arc::clone(&sync), TransactionId::new(1), types(&[1, 2]));
        a.establish().unwrap();

        let b = Arc::new(WriteLock::new(
            Arc::clone(&sync),
            TransactionId::new(2),
            types(&[2]),
        ));
        let waiter = {
            let b = Arc::clone(&b);
            thread::spawn(move || b.establish())
        };

        // Give the waiter time to block, then free the collections.
        thread::sleep(Duration::from_millis(50));
        a.release();

        waiter.join().unwrap().unwrap();
        b.release();
    }

    #[test]
    fn abort_interrupts_pending_establish() {
        let sync = Arc::new(LockSync::new());
        let a = WriteLock::new(Arc::clone(&sync), TransactionId::new(1), types(&[1]));
        a.establish().unwrap();

        let b = Arc::new(WriteLock::new(
            Arc::clone(&sync),
            TransactionId::new(2),
            types(&[1]),
        ));
        let waiter = {
            let b = Arc::clone(&b);
            thread::spawn(move || b.establish())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(b.abort());

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(CoreError::LockRefused)));
        a.release();
    }

    #[test]
    fn abort_fails_once_established() {
        let sync = Arc::new(LockSync::new());
        let a = WriteLock::new(Arc::clone(&sync), TransactionId::new(1), types(&[1]));
        a.establish().unwrap();
        assert!(!a.abort());
        a.release();
    }
}
