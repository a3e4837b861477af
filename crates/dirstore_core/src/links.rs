//! Reverse-pointer tracking for asymmetric links.
//!
//! Forward references live in object fields; this tracker maintains the
//! inverse map (target to the set of objects pointing at it) so deletion
//! checks and back-pointer queries stay cheap. Each open transaction works
//! against a private overlay that replaces the committed source set for
//! every target it touches; the overlay merges in at commit and vanishes
//! on abort.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{Invid, TransactionId};

#[derive(Debug, Default)]
struct SessionLinks {
    /// Per-target replacement source sets. A present key fully shadows
    /// the committed set for that target.
    overlay: HashMap<Invid, HashSet<Invid>>,
    checkpoints: Vec<(String, HashMap<Invid, HashSet<Invid>>)>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    persisted: HashMap<Invid, HashSet<Invid>>,
    sessions: HashMap<TransactionId, SessionLinks>,
}

/// Store-wide asymmetric link registry.
#[derive(Debug, Default)]
pub struct LinkTracker {
    inner: Mutex<TrackerInner>,
}

impl LinkTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a committed link during store open.
    pub(crate) fn load_persistent(&self, source: Invid, target: Invid) {
        self.inner
            .lock()
            .persisted
            .entry(target)
            .or_default()
            .insert(source);
    }

    fn working_set(inner: &mut TrackerInner, txn: TransactionId, target: Invid) -> &mut HashSet<Invid> {
        let persisted = inner
            .persisted
            .get(&target)
            .cloned()
            .unwrap_or_default();
        inner
            .sessions
            .entry(txn)
            .or_default()
            .overlay
            .entry(target)
            .or_insert(persisted)
    }

    /// Records that `source` now points at `target` within `txn`.
    pub fn link(&self, txn: TransactionId, source: Invid, target: Invid) {
        let inner = &mut *self.inner.lock();
        Self::working_set(inner, txn, target).insert(source);
        trace!(%txn, %source, %target, "link recorded");
    }

    /// Records that `source` no longer points at `target` within `txn`.
    pub fn unlink(&self, txn: TransactionId, source: Invid, target: Invid) {
        let inner = &mut *self.inner.lock();
        Self::working_set(inner, txn, target).remove(&source);
    }

    /// Returns the objects pointing at `target`, as seen by `txn` (its
    /// uncommitted changes included).
    #[must_use]
    pub fn sources_of(&self, txn: TransactionId, target: Invid) -> HashSet<Invid> {
        let inner = self.inner.lock();
        if let Some(set) = inner
            .sessions
            .get(&txn)
            .and_then(|session| session.overlay.get(&target))
        {
            return set.clone();
        }
        inner.persisted.get(&target).cloned().unwrap_or_default()
    }

    /// Returns the committed objects pointing at `target`.
    #[must_use]
    pub fn persisted_sources_of(&self, target: Invid) -> HashSet<Invid> {
        self.inner
            .lock()
            .persisted
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshots `txn`'s overlay under `name`.
    pub fn checkpoint(&self, txn: TransactionId, name: &str) {
        let inner = &mut *self.inner.lock();
        let session = inner.sessions.entry(txn).or_default();
        let saved = session.overlay.clone();
        session.checkpoints.push((name.to_owned(), saved));
    }

    /// Discards the checkpoint `name` and anything stacked above it.
    pub fn pop_checkpoint(&self, txn: TransactionId, name: &str) -> bool {
        let inner = &mut *self.inner.lock();
        let Some(session) = inner.sessions.get_mut(&txn) else {
            return false;
        };
        match session.checkpoints.iter().rposition(|(n, _)| n == name) {
            Some(index) => {
                session.checkpoints.truncate(index);
                true
            }
            None => false,
        }
    }

    /// Rewinds `txn`'s overlay to the checkpoint `name`.
    pub fn rollback(&self, txn: TransactionId, name: &str) -> bool {
        let inner = &mut *self.inner.lock();
        let Some(session) = inner.sessions.get_mut(&txn) else {
            return false;
        };
        let Some(index) = session.checkpoints.iter().rposition(|(n, _)| n == name) else {
            return false;
        };
        session.checkpoints.truncate(index + 1);
        if let Some((_, saved)) = session.checkpoints.pop() {
            session.overlay = saved;
        }
        true
    }

    /// Merges `txn`'s overlay into the committed map.
    pub(crate) fn commit(&self, txn: TransactionId) {
        let inner = &mut *self.inner.lock();
        let Some(session) = inner.sessions.remove(&txn) else {
            return;
        };
        for (target, sources) in session.overlay {
            if sources.is_empty() {
                inner.persisted.remove(&target);
            } else {
                inner.persisted.insert(target, sources);
            }
        }
    }

    /// Discards `txn`'s overlay.
    pub(crate) fn abort(&self, txn: TransactionId) {
        self.inner.lock().sessions.remove(&txn);
    }
}
