//! Transactions: checkout, editing, checkpoints, and lifecycle.

mod checkpoint;
mod commit;
mod state;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::error::{CoreError, CoreResult};
use crate::hooks::AuditEvent;
use crate::locking::WriteLock;
use crate::object::ObjectShadow;
use crate::store::ObjectStore;
use crate::txn::checkpoint::Checkpoint;
use crate::txn::state::TxnState;
use crate::types::{FieldId, FieldRef, Invid, ObjectStatus, ObjectTypeId, TransactionId};
use crate::value::FieldValue;

/// An open transaction against an [`ObjectStore`].
///
/// All methods take `&self`; internal state is mutex-guarded, so a
/// transaction handle may be shared across threads, though operations
/// within it serialize. A transaction ends by [`Transaction::commit`] or
/// [`Transaction::abort`]; afterwards every operation fails with
/// [`CoreError::TransactionFinished`].
///
/// There is no `Drop` cleanup: a handle that goes away without being
/// committed or aborted keeps its editor claims, namespace holds, and
/// deletion anchors until the process exits. Session layers owning
/// transactions must end each one explicitly.
pub struct Transaction {
    id: TransactionId,
    description: String,
    interactive: bool,
    store: Arc<ObjectStore>,
    state: Mutex<TxnState>,
    wlock: Mutex<Option<Arc<WriteLock>>>,
}

impl Transaction {
    pub(crate) fn new(
        store: Arc<ObjectStore>,
        id: TransactionId,
        description: String,
        interactive: bool,
    ) -> Self {
        Self {
            id,
            description,
            interactive,
            store,
            state: Mutex::new(TxnState::default()),
            wlock: Mutex::new(None),
        }
    }

    /// This transaction's id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The description given at [`ObjectStore::begin`].
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this transaction runs in interactive mode.
    #[must_use]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn locked_state(&self) -> MutexGuard<'_, TxnState> {
        self.state.lock()
    }

    fn ensure_open(state: &TxnState) -> CoreResult<()> {
        if state.finished {
            return Err(CoreError::TransactionFinished);
        }
        if state.lock_requested {
            return Err(CoreError::invalid_operation("commit in progress"));
        }
        Ok(())
    }

    /// Checks out an existing object for editing.
    ///
    /// Takes the exclusive editor claim on the object and a delete lock on
    /// every object its asymmetric link fields point at. Checking out an
    /// object already held by this transaction is a no-op.
    pub fn check_out(&self, invid: Invid) -> CoreResult<()> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;

        if state.shadows.contains_key(&invid) {
            return Ok(());
        }
        if !self.store.policy().may_edit(self.id, invid) {
            return Err(CoreError::PermissionDenied { invid });
        }

        let base = self.store.base(invid.type_id)?;
        let snapshot = base.try_set_editor(invid.num, self.id)?;

        // Anchor every asymmetric link target so it cannot be deleted
        // while we hold the source.
        let mut anchored: Vec<Invid> = Vec::new();
        for def in &base.type_def().fields {
            if !def.asymmetric_link {
                continue;
            }
            if let Some(target) = snapshot.field(def.id).and_then(FieldValue::as_reference) {
                if self.store.deletions().delete_lock(self.id, target) {
                    anchored.push(target);
                } else {
                    for taken in anchored {
                        self.store.deletions().delete_unlock(self.id, taken);
                    }
                    base.clear_editor(invid.num, self.id);
                    return Err(CoreError::DeletionBlocked { invid: target });
                }
            }
        }

        state
            .shadows
            .insert(invid, ObjectShadow::editing(snapshot));
        debug!(txn = %self.id, %invid, "object checked out");
        Ok(())
    }

    /// Creates a new object, returning its invid. The object exists only
    /// inside this transaction until commit.
    pub fn create(&self, type_id: ObjectTypeId) -> CoreResult<Invid> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;

        if !self.store.policy().may_create(self.id, type_id) {
            return Err(CoreError::PermissionDenied {
                invid: Invid::new(type_id, 0),
            });
        }

        let base = self.store.base(type_id)?;
        let num = base.allocate_num();
        base.note_creation();
        let invid = Invid::new(type_id, num);
        state.shadows.insert(invid, ObjectShadow::creating(invid));
        debug!(txn = %self.id, %invid, "object created");
        Ok(invid)
    }

    /// Marks a checked-out object for deletion.
    ///
    /// The object must already be checked out (or created) by this
    /// transaction. Its namespace-constrained values are released and its
    /// asymmetric links retracted; an object created within this
    /// transaction moves to dropping status and commits to nothing.
    pub fn mark_for_deletion(&self, invid: Invid) -> CoreResult<()> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;

        if !state.shadows.contains_key(&invid) {
            return Err(CoreError::invalid_operation(
                "object must be checked out before deletion",
            ));
        }
        if !self.store.policy().may_delete(self.id, invid) {
            return Err(CoreError::PermissionDenied { invid });
        }
        let status = match state.shadows.get(&invid).map(|s| s.status) {
            Some(status) if status.is_deletion() => return Ok(()),
            Some(status) => status,
            None => return Err(CoreError::ObjectNotFound { invid }),
        };

        if !self.store.deletions().set_delete_status(self.id, invid) {
            return Err(CoreError::DeletionBlocked { invid });
        }

        // Release constrained values and retract links before the shadow
        // empties out.
        let base = self.store.base(invid.type_id)?;
        let fields: Vec<(FieldId, FieldValue)> = state
            .shadows
            .get(&invid)
            .map(|s| s.fields.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default();
        for (field_id, value) in fields {
            let def = base.type_def().field(field_id)?;
            let field_ref = FieldRef::new(invid, field_id);
            if let Some(ns) = def.namespace {
                if !self
                    .store
                    .registry(ns)
                    .unmark(self.id, self.interactive, &value, field_ref)
                {
                    warn!(txn = %self.id, %field_ref, "constrained value did not release");
                }
            }
            if def.asymmetric_link {
                if let Some(target) = value.as_reference() {
                    self.store.links().unlink(self.id, invid, target);
                }
            }
        }

        if let Some(shadow) = state.shadows.get_mut(&invid) {
            shadow.fields.clear();
            shadow.status = if status == ObjectStatus::Creating {
                ObjectStatus::Dropping
            } else {
                ObjectStatus::Deleting
            };
        }
        debug!(txn = %self.id, %invid, "object marked for deletion");
        Ok(())
    }

    /// Sets a field on a checked-out object.
    ///
    /// Namespace-constrained fields claim the new value (and release the
    /// old one) in the field's registry; a refused claim fails with
    /// [`CoreError::ValueInUse`] and leaves the field unchanged.
    /// Asymmetric link fields anchor the new target against deletion and
    /// update the reverse-pointer tracker.
    pub fn set_field(&self, invid: Invid, field_id: FieldId, value: FieldValue) -> CoreResult<()> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;

        let shadow = state
            .shadows
            .get(&invid)
            .ok_or(CoreError::ObjectNotFound { invid })?;
        if shadow.status.is_deletion() {
            return Err(CoreError::invalid_operation(
                "cannot set fields on an object marked for deletion",
            ));
        }
        let old = shadow.field(field_id).cloned();

        let base = self.store.base(invid.type_id)?;
        let def = base.type_def().field(field_id)?;
        let field_ref = FieldRef::new(invid, field_id);

        let mut anchored_target = None;
        if def.asymmetric_link {
            if let Some(target) = value.as_reference() {
                if !self.store.deletions().delete_lock(self.id, target) {
                    return Err(CoreError::DeletionBlocked { invid: target });
                }
                anchored_target = Some(target);
            }
        }

        if let Some(ns) = def.namespace {
            let registry = self.store.registry(ns);
            if let Some(old_value) = &old {
                registry.unmark(self.id, self.interactive, old_value, field_ref);
            }
            if !registry.mark(self.id, self.interactive, &value, field_ref) {
                // Put the old claim back and surface the conflict.
                if let Some(old_value) = &old {
                    registry.mark(self.id, self.interactive, old_value, field_ref);
                }
                if let Some(target) = anchored_target {
                    self.store.deletions().delete_unlock(self.id, target);
                }
                return Err(CoreError::ValueInUse {
                    value: value.to_string(),
                    namespace: registry.name().to_owned(),
                });
            }
        }

        if def.asymmetric_link {
            if let Some(old_target) = old.as_ref().and_then(FieldValue::as_reference) {
                self.store.links().unlink(self.id, invid, old_target);
            }
            if let Some(target) = value.as_reference() {
                self.store.links().link(self.id, invid, target);
            }
        }

        if let Some(shadow) = state.shadows.get_mut(&invid) {
            shadow.set_field(field_id, value);
        }
        Ok(())
    }

    /// Clears a field on a checked-out object, returning the old value.
    pub fn clear_field(&self, invid: Invid, field_id: FieldId) -> CoreResult<Option<FieldValue>> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;

        let shadow = state
            .shadows
            .get(&invid)
            .ok_or(CoreError::ObjectNotFound { invid })?;
        if shadow.status.is_deletion() {
            return Err(CoreError::invalid_operation(
                "cannot clear fields on an object marked for deletion",
            ));
        }
        let old = shadow.field(field_id).cloned();
        let Some(old_value) = old else {
            return Ok(None);
        };

        let base = self.store.base(invid.type_id)?;
        let def = base.type_def().field(field_id)?;
        let field_ref = FieldRef::new(invid, field_id);

        if let Some(ns) = def.namespace {
            self.store
                .registry(ns)
                .unmark(self.id, self.interactive, &old_value, field_ref);
        }
        if def.asymmetric_link {
            if let Some(target) = old_value.as_reference() {
                self.store.links().unlink(self.id, invid, target);
            }
        }

        if let Some(shadow) = state.shadows.get_mut(&invid) {
            shadow.clear_field(field_id);
        }
        Ok(Some(old_value))
    }

    /// Reads a field as this transaction sees it: from the private shadow
    /// if the object is checked out, otherwise from the committed
    /// snapshot.
    pub fn field(&self, invid: Invid, field_id: FieldId) -> CoreResult<Option<FieldValue>> {
        let state = self.locked_state();
        if let Some(shadow) = state.shadows.get(&invid) {
            return Ok(shadow.field(field_id).cloned());
        }
        drop(state);
        let base = self.store.base(invid.type_id)?;
        Ok(base
            .view(invid.num)
            .and_then(|snapshot| snapshot.field(field_id).cloned()))
    }

    /// Appends an event to the transaction's audit trail.
    pub fn log_event(&self, event: AuditEvent) -> CoreResult<()> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;
        state.events.push(event);
        Ok(())
    }

    /// Establishes a named checkpoint covering all transaction state.
    ///
    /// Batch transactions skip checkpointing entirely; their rollback
    /// path is to abort and reload.
    pub fn checkpoint(&self, name: &str) -> CoreResult<()> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;
        if !self.interactive {
            return Ok(());
        }

        let objects = state
            .shadows
            .iter()
            .map(|(invid, shadow)| (*invid, (shadow.fields.clone(), shadow.status)))
            .collect();
        let checkpoint = Checkpoint {
            events: state.events.clone(),
            objects,
            delete_locks: self.store.deletions().session_locks(self.id),
            deleting: self.store.deletions().session_deleting(self.id),
        };
        state.checkpoints.push(name, checkpoint);

        for registry in self.store.namespaces() {
            registry.checkpoint(self.id, name);
        }
        self.store.links().checkpoint(self.id, name);
        debug!(txn = %self.id, name, "checkpoint established");
        Ok(())
    }

    /// Discards the checkpoint `name` (and any stacked above it) without
    /// rewinding anything. Returns false if no such checkpoint exists;
    /// batch transactions never hold checkpoints, so the answer there is
    /// always false.
    pub fn pop_checkpoint(&self, name: &str) -> CoreResult<bool> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;
        if !self.interactive {
            return Ok(false);
        }

        let found = state.checkpoints.pop(name).is_some();
        if found {
            for registry in self.store.namespaces() {
                registry.pop_checkpoint(self.id, name);
            }
            self.store.links().pop_checkpoint(self.id, name);
        }
        Ok(found)
    }

    /// Rewinds the transaction to the checkpoint `name`, discarding any
    /// checkpoints stacked above it.
    ///
    /// Returns `Ok(false)` if the checkpoint does not exist, in which case
    /// nothing changes. A batch transaction cannot rewind; calling this on
    /// one poisons it so that only abort remains.
    pub fn rollback(&self, name: &str) -> CoreResult<bool> {
        let mut state = self.locked_state();
        Self::ensure_open(&state)?;

        if !self.interactive {
            error!(txn = %self.id, name, "rollback attempted in batch mode");
            state.must_abort = true;
            return Ok(false);
        }

        let Some(checkpoint) = state.checkpoints.pop(name) else {
            error!(txn = %self.id, name, "rollback to unknown checkpoint");
            return Ok(false);
        };

        state.events = checkpoint.events;

        // Drop shadows acquired after the checkpoint, releasing their
        // claims; rewind the rest to their checkpointed contents.
        let dropped: Vec<Invid> = state
            .shadows
            .keys()
            .filter(|invid| !checkpoint.objects.contains_key(invid))
            .copied()
            .collect();
        for invid in dropped {
            if let Some(shadow) = state.shadows.remove(&invid) {
                self.release_shadow(&shadow);
            }
        }
        for (invid, (fields, status)) in checkpoint.objects {
            match state.shadows.get_mut(&invid) {
                Some(shadow) => shadow.restore(fields, status),
                None => error!(txn = %self.id, %invid, "checkpointed shadow missing"),
            }
        }

        let mut ok = true;
        for registry in self.store.namespaces() {
            ok &= registry.rollback(self.id, name);
        }
        ok &= self.store.links().rollback(self.id, name);

        self.store
            .deletions()
            .sync_locks(self.id, &checkpoint.delete_locks);
        self.store
            .deletions()
            .sync_deleting(self.id, &checkpoint.deleting);

        if !ok {
            error!(txn = %self.id, name, "registry rollback incomplete");
            state.must_abort = true;
            return Ok(false);
        }
        debug!(txn = %self.id, name, "rolled back to checkpoint");
        Ok(true)
    }

    /// Returns every invid this transaction would delete at commit.
    #[must_use]
    pub fn pending_deletions(&self) -> HashSet<Invid> {
        self.locked_state()
            .shadows
            .iter()
            .filter(|(_, shadow)| shadow.status.is_deletion())
            .map(|(invid, _)| *invid)
            .collect()
    }

    /// Aborts the transaction, discarding all of its work.
    ///
    /// Returns `Ok(false)` if a commit already holds the established write
    /// lock; the commit then runs to completion and cannot be stopped.
    /// Aborting a commit still waiting for its lock interrupts the wait.
    pub fn abort(&self) -> CoreResult<bool> {
        let pending_lock = self.wlock.lock().clone();
        if let Some(lock) = pending_lock {
            if !lock.abort() {
                return Ok(false);
            }
        }

        let mut state = self.locked_state();
        if state.finished {
            return Err(CoreError::TransactionFinished);
        }
        self.release_with_state(&mut state);
        debug!(txn = %self.id, "transaction aborted");
        Ok(true)
    }

    /// Drops one shadow's claims on shared structures.
    fn release_shadow(&self, shadow: &ObjectShadow) {
        let invid = shadow.invid;
        let Ok(base) = self.store.base(invid.type_id) else {
            return;
        };
        match shadow.status {
            ObjectStatus::Creating | ObjectStatus::Dropping => {
                base.release_num(invid.num);
                base.note_creation_released();
            }
            ObjectStatus::Editing | ObjectStatus::Deleting => {
                base.clear_editor(invid.num, self.id);
            }
        }
    }

    /// Releases every claim the transaction holds and marks it finished.
    pub(crate) fn release_with_state(&self, state: &mut TxnState) {
        let shadows = std::mem::take(&mut state.shadows);
        for shadow in shadows.values() {
            self.release_shadow(shadow);
        }
        for registry in self.store.namespaces() {
            registry.abort(self.id);
        }
        self.store.links().abort(self.id);
        self.store.deletions().release(self.id);
        state.checkpoints.clear();
        state.events.clear();
        state.finished = true;
        state.lock_requested = false;
        *self.wlock.lock() = None;
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}
