//! Mutable per-transaction state.

use std::collections::HashMap;

use crate::hooks::AuditEvent;
use crate::object::ObjectShadow;
use crate::txn::checkpoint::CheckpointStack;
use crate::types::Invid;

/// Everything a transaction owns privately, guarded by one mutex so that
/// checkpoint, rollback, and commit each see a consistent view.
#[derive(Debug, Default)]
pub(crate) struct TxnState {
    /// Shadow copies of every object this transaction has touched.
    pub shadows: HashMap<Invid, ObjectShadow>,
    /// Audit trail, delivered after commit's point of no return.
    pub events: Vec<AuditEvent>,
    /// Named checkpoint stack.
    pub checkpoints: CheckpointStack,
    /// Set when a failed batch rollback left state inconsistent; the
    /// transaction can then only abort.
    pub must_abort: bool,
    /// Set once the transaction has committed or aborted.
    pub finished: bool,
    /// Set while commit is establishing or holding the write lock; other
    /// operations are refused meanwhile.
    pub lock_requested: bool,
}

impl TxnState {
    /// Object types touched by this transaction, sorted and deduplicated.
    pub fn touched_types(&self) -> Vec<crate::types::ObjectTypeId> {
        let mut types: Vec<_> = self.shadows.keys().map(|invid| invid.type_id).collect();
        types.sort_unstable();
        types.dedup();
        types
    }
}
