//! Deletion manager: serializes object deletion against link anchoring.
//!
//! Two races have to lose deterministically. A transaction about to point
//! an asymmetric link at a target takes a delete lock on it first, so the
//! target cannot be deleted out from under the new reference. A
//! transaction about to delete an object moves it to deleting status,
//! which refuses while any other transaction holds a delete lock on it.
//! State here is transient and session-scoped; nothing survives a restart.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{Invid, TransactionId};

#[derive(Debug, Default)]
struct DeletionInner {
    /// Delete locks held, per transaction.
    locks_by_txn: HashMap<TransactionId, HashSet<Invid>>,
    /// Transactions holding a delete lock, per object.
    locks_by_invid: HashMap<Invid, HashSet<TransactionId>>,
    /// Objects in deleting status, with the deleting transaction.
    deleting: HashMap<Invid, TransactionId>,
}

/// Store-wide deletion coordination.
#[derive(Debug, Default)]
pub(crate) struct DeletionManager {
    inner: Mutex<DeletionInner>,
}

impl DeletionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a delete lock on `invid` for `txn`, protecting it from
    /// deletion by other transactions. Fails if the object is already in
    /// deleting status elsewhere.
    pub fn delete_lock(&self, txn: TransactionId, invid: Invid) -> bool {
        let inner = &mut *self.inner.lock();
        if inner
            .deleting
            .get(&invid)
            .is_some_and(|holder| *holder != txn)
        {
            return false;
        }
        inner.locks_by_txn.entry(txn).or_default().insert(invid);
        inner.locks_by_invid.entry(invid).or_default().insert(txn);
        trace!(%txn, %invid, "delete lock taken");
        true
    }

    /// Releases one delete lock.
    pub fn delete_unlock(&self, txn: TransactionId, invid: Invid) {
        let inner = &mut *self.inner.lock();
        if let Some(set) = inner.locks_by_txn.get_mut(&txn) {
            set.remove(&invid);
        }
        if let Some(set) = inner.locks_by_invid.get_mut(&invid) {
            set.remove(&txn);
            if set.is_empty() {
                inner.locks_by_invid.remove(&invid);
            }
        }
    }

    /// Moves `invid` to deleting status on behalf of `txn`. Fails if any
    /// other transaction holds a delete lock on it.
    pub fn set_delete_status(&self, txn: TransactionId, invid: Invid) -> bool {
        let inner = &mut *self.inner.lock();
        let anchored_elsewhere = inner
            .locks_by_invid
            .get(&invid)
            .is_some_and(|holders| holders.iter().any(|holder| *holder != txn));
        if anchored_elsewhere {
            return false;
        }
        inner.deleting.insert(invid, txn);
        trace!(%txn, %invid, "object entered deleting status");
        true
    }

    /// Clears `invid`'s deleting status if `txn` set it.
    pub fn clear_delete_status(&self, txn: TransactionId, invid: Invid) {
        let inner = &mut *self.inner.lock();
        if inner.deleting.get(&invid) == Some(&txn) {
            inner.deleting.remove(&invid);
        }
    }

    /// Snapshot of the delete locks `txn` currently holds, for
    /// checkpointing.
    pub fn session_locks(&self, txn: TransactionId) -> HashSet<Invid> {
        self.inner
            .lock()
            .locks_by_txn
            .get(&txn)
            .cloned()
            .unwrap_or_default()
    }

    /// Rewinds `txn`'s delete locks to a checkpointed snapshot.
    pub fn sync_locks(&self, txn: TransactionId, saved: &HashSet<Invid>) {
        let inner = &mut *self.inner.lock();
        let current = inner.locks_by_txn.remove(&txn).unwrap_or_default();
        for invid in current.difference(saved) {
            if let Some(set) = inner.locks_by_invid.get_mut(invid) {
                set.remove(&txn);
                if set.is_empty() {
                    inner.locks_by_invid.remove(invid);
                }
            }
        }
        for invid in saved {
            inner.locks_by_invid.entry(*invid).or_default().insert(txn);
        }
        if !saved.is_empty() {
            inner.locks_by_txn.insert(txn, saved.clone());
        }
    }

    /// Snapshot of the objects `txn` currently has in deleting status,
    /// for checkpointing.
    pub fn session_deleting(&self, txn: TransactionId) -> HashSet<Invid> {
        self.inner
            .lock()
            .deleting
            .iter()
            .filter(|(_, holder)| **holder == txn)
            .map(|(invid, _)| *invid)
            .collect()
    }

    /// Rewinds `txn`'s deleting set to a checkpointed snapshot.
    pub fn sync_deleting(&self, txn: TransactionId, saved: &HashSet<Invid>) {
        let inner = &mut *self.inner.lock();
        inner
            .deleting
            .retain(|invid, holder| *holder != txn || saved.contains(invid));
        for invid in saved {
            inner.deleting.entry(*invid).or_insert(txn);
        }
    }

    /// Drops every lock and deleting mark held by `txn`.
    pub fn release(&self, txn: TransactionId) {
        let inner = &mut *self.inner.lock();
        if let Some(locked) = inner.locks_by_txn.remove(&txn) {
            for invid in locked {
                if let Some(set) = inner.locks_by_invid.get_mut(&invid) {
                    set.remove(&txn);
                    if set.is_empty() {
                        inner.locks_by_invid.remove(&invid);
                    }
                }
            }
        }
        inner.deleting.retain(|_, holder| *holder != txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectTypeId;

    fn invid(num: u32) -> Invid {
        Invid::new(ObjectTypeId::new(1), num)
    }

    #[test]
    fn delete_lock_blocks_deletion_by_others() {
        let mgr = DeletionManager::new();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        assert!(mgr.delete_lock(a, invid(5)));
        assert!(!mgr.set_delete_status(b, invid(5)));

        mgr.release(a);
        assert!(mgr.set_delete_status(b, invid(5)));
    }

    #[test]
    fn deleting_status_blocks_new_locks_by_others() {
        let mgr = DeletionManager::new();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        assert!(mgr.set_delete_status(a, invid(5)));
        assert!(!mgr.delete_lock(b, invid(5)));
        // The deleting transaction itself may still take a lock.
        assert!(mgr.delete_lock(a, invid(5)));
    }

    #[test]
    fn own_lock_does_not_block_own_deletion() {
        let mgr = DeletionManager::new();
        let a = TransactionId::new(1);

        assert!(mgr.delete_lock(a, invid(5)));
        assert!(mgr.set_delete_status(a, invid(5)));
    }

    #[test]
    fn sync_deleting_rewinds_to_snapshot() {
        let mgr = DeletionManager::new();
        let a = TransactionId::new(1);

        assert!(mgr.set_delete_status(a, invid(1)));
        let saved = mgr.session_deleting(a);
        assert!(mgr.set_delete_status(a, invid(2)));

        mgr.sync_deleting(a, &saved);
        let now = mgr.session_deleting(a);
        assert!(now.contains(&invid(1)));
        assert!(!now.contains(&invid(2)));
    }

    #[test]
    fn release_clears_everything() {
        let mgr = DeletionManager::new();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        assert!(mgr.delete_lock(a, invid(1)));
        assert!(mgr.set_delete_status(a, invid(2)));
        mgr.release(a);

        assert!(mgr.set_delete_status(b, invid(1)));
        assert!(mgr.delete_lock(b, invid(2)));
    }
}
