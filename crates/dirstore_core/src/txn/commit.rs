//! The two-phase commit protocol.
//!
//! Commit proceeds in stages: claim the write lock over every touched
//! collection, verify namespace and required-field constraints, persist
//! the transaction run to the journal, finalize it, then publish the new
//! snapshots. Failures before the finalize marker leave either a retryable
//! transaction (constraint problems) or a cleanly released one (journal
//! failures); after the finalize marker the commit always completes.

use std::sync::Arc;

use dirstore_journal::{JournalOp, TransactionRecord};
use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::error::{CommitError, CoreError};
use crate::locking::WriteLock;
use crate::txn::state::TxnState;
use crate::txn::Transaction;
use crate::types::ObjectStatus;
use crate::value::encode_fields;

impl Transaction {
    /// Commits the transaction.
    ///
    /// On [`CommitError::Retryable`] the transaction is still open with
    /// all of its work intact; the caller may fix the reported problem
    /// and commit again. On [`CommitError::Fatal`] the transaction has
    /// been released.
    pub fn commit(self: &Arc<Self>) -> Result<(), CommitError> {
        let touched = {
            let mut state = self.state.lock();
            if state.finished {
                return Err(CommitError::Fatal(CoreError::TransactionFinished));
            }
            if state.must_abort {
                self.release_with_state(&mut state);
                return Err(CommitError::Fatal(CoreError::MustAbort));
            }
            state.lock_requested = true;
            state.touched_types()
        };

        let lock = Arc::new(WriteLock::new(
            Arc::clone(self.store.lock_sync()),
            self.id,
            touched.clone(),
        ));
        *self.wlock.lock() = Some(Arc::clone(&lock));

        if let Err(err) = lock.establish() {
            // A concurrent abort interrupted the wait; the aborting
            // thread performs the release.
            *self.wlock.lock() = None;
            return Err(CommitError::Fatal(err));
        }

        let mut state = self.state.lock();
        if state.finished {
            lock.release();
            *self.wlock.lock() = None;
            return Err(CommitError::Fatal(CoreError::TransactionFinished));
        }

        let result = self.commit_locked(&mut state, &touched);
        match &result {
            Ok(()) => {
                lock.release();
                *self.wlock.lock() = None;
            }
            Err(CommitError::Retryable(err)) => {
                debug!(txn = %self.id, %err, "commit failed, transaction still open");
                lock.release();
                *self.wlock.lock() = None;
                state.lock_requested = false;
            }
            Err(CommitError::Fatal(err)) => {
                error!(txn = %self.id, %err, "commit failed, releasing transaction");
                lock.release();
                self.release_with_state(&mut state);
            }
        }
        result
    }

    fn commit_locked(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, TxnState>,
        touched: &[crate::types::ObjectTypeId],
    ) -> Result<(), CommitError> {
        // Batch transactions may carry overlapping namespace claims while
        // loading; they must all have resolved by now.
        if !self.interactive {
            let mut conflicts: Vec<String> = Vec::new();
            for registry in self.store.namespaces() {
                conflicts.extend(registry.verify_conflicts(self.id));
            }
            if !conflicts.is_empty() {
                return Err(CommitError::Retryable(CoreError::NamespaceConflicts {
                    conflicts,
                }));
            }
        }

        // Phase one: every surviving object must carry its required fields.
        for (invid, shadow) in &state.shadows {
            if shadow.status.is_deletion() {
                continue;
            }
            let base = self
                .store
                .base(invid.type_id)
                .map_err(CommitError::Fatal)?;
            let missing: Vec<_> = base
                .type_def()
                .required_fields()
                .filter(|def| shadow.field(def.id).is_none())
                .map(|def| def.id)
                .collect();
            if !missing.is_empty() {
                return Err(CommitError::Retryable(CoreError::MissingFields {
                    invid: *invid,
                    fields: missing,
                }));
            }
        }

        // Build the journal run. Dropped objects (created then deleted in
        // this transaction) never touch the journal.
        let mut ops = Vec::new();
        let mut invids: Vec<_> = state.shadows.keys().copied().collect();
        invids.sort_unstable();
        for invid in &invids {
            let shadow = &state.shadows[invid];
            let op = match shadow.status {
                ObjectStatus::Creating => JournalOp::Create {
                    type_id: invid.type_id.as_u16(),
                    num: invid.num,
                    payload: encode_fields(&shadow.fields).map_err(CommitError::Fatal)?,
                },
                ObjectStatus::Editing => JournalOp::Edit {
                    type_id: invid.type_id.as_u16(),
                    num: invid.num,
                    payload: encode_fields(&shadow.fields).map_err(CommitError::Fatal)?,
                },
                ObjectStatus::Deleting => JournalOp::Delete {
                    type_id: invid.type_id.as_u16(),
                    num: invid.num,
                },
                ObjectStatus::Dropping => continue,
            };
            ops.push(op);
        }

        // Persist and finalize under the journal guard, the global commit
        // ordering point. A transaction with nothing durable to say skips
        // the journal entirely.
        if !ops.is_empty() {
            let record = TransactionRecord {
                txid: self.id.as_u64(),
                description: self.description.clone(),
                ops,
            };
            let journal = self.store.journal().lock();
            let handle = journal
                .write(&record)
                .map_err(|err| CommitError::Fatal(err.into()))?;
            if let Err(err) = journal.finalize(&handle) {
                if let Err(undo_err) = journal.undo(&handle) {
                    warn!(txn = %self.id, %undo_err, "could not back out unfinalized run");
                }
                return Err(CommitError::Fatal(err.into()));
            }
        }

        // Point of no return. Everything below must complete; failures
        // are logged, never surfaced.
        if let Err(err) = self.store.audit().deliver(self.id, &state.events) {
            warn!(txn = %self.id, %err, "audit delivery failed");
        }

        let shadows = std::mem::take(&mut state.shadows);
        for (invid, shadow) in shadows {
            let Ok(base) = self.store.base(invid.type_id) else {
                continue;
            };
            match shadow.status {
                ObjectStatus::Creating => {
                    base.put(shadow.materialize(), self.id);
                    base.note_creation_released();
                }
                ObjectStatus::Editing => {
                    base.put(shadow.materialize(), self.id);
                }
                ObjectStatus::Deleting => {
                    base.remove(invid.num, self.id);
                }
                ObjectStatus::Dropping => {
                    base.release_num(invid.num);
                    base.note_creation_released();
                }
            }
        }

        for registry in self.store.namespaces() {
            registry.commit(self.id);
        }
        self.store.links().commit(self.id);
        self.store.deletions().release(self.id);

        for type_id in touched {
            if let Ok(base) = self.store.base(*type_id) {
                base.update_timestamp();
            }
        }

        state.checkpoints.clear();
        state.events.clear();
        state.finished = true;
        state.lock_requested = false;

        info!(txn = %self.id, objects = invids.len(), "transaction committed");
        self.store
            .scheduler()
            .transaction_committed(self.id, touched);
        Ok(())
    }
}
