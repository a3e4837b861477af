//! Per-type object collections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{CoreError, CoreResult};
use crate::object::snapshot::ObjectSnapshot;
use crate::schema::TypeDef;
use crate::types::{Invid, TransactionId};

struct Slot {
    snapshot: Arc<ObjectSnapshot>,
    editor: Option<TransactionId>,
}

struct BaseInner {
    slots: HashMap<u32, Slot>,
    next_num: u32,
    free_nums: Vec<u32>,
    checked_out: usize,
    modified_at: Option<SystemTime>,
}

/// All committed objects of one type, plus the editor bookkeeping that
/// enforces the at-most-one-editor rule.
pub struct ObjectBase {
    def: TypeDef,
    inner: RwLock<BaseInner>,
}

impl ObjectBase {
    /// Creates an empty base for `def`.
    #[must_use]
    pub fn new(def: TypeDef) -> Self {
        Self {
            def,
            inner: RwLock::new(BaseInner {
                slots: HashMap::new(),
                next_num: 0,
                free_nums: Vec::new(),
                checked_out: 0,
                modified_at: None,
            }),
        }
    }

    /// The schema for this base's objects.
    #[must_use]
    pub fn type_def(&self) -> &TypeDef {
        &self.def
    }

    /// Returns the committed snapshot of object `num`, if it exists.
    #[must_use]
    pub fn view(&self, num: u32) -> Option<Arc<ObjectSnapshot>> {
        self.inner
            .read()
            .slots
            .get(&num)
            .map(|slot| Arc::clone(&slot.snapshot))
    }

    /// Lists the numbers of all committed objects.
    #[must_use]
    pub fn object_nums(&self) -> Vec<u32> {
        self.inner.read().slots.keys().copied().collect()
    }

    /// When the base last changed, if ever.
    #[must_use]
    pub fn modified_at(&self) -> Option<SystemTime> {
        self.inner.read().modified_at
    }

    /// Claims object `num` for editing by `txid`.
    ///
    /// Returns the committed snapshot on success. Fails if the object does
    /// not exist or another transaction holds it. Re-claiming by the same
    /// transaction succeeds.
    pub(crate) fn try_set_editor(
        &self,
        num: u32,
        txid: TransactionId,
    ) -> CoreResult<Arc<ObjectSnapshot>> {
        let mut inner = self.inner.write();
        let invid = Invid::new(self.def.id, num);
        let slot = inner
            .slots
            .get_mut(&num)
            .ok_or(CoreError::ObjectNotFound { invid })?;
        match slot.editor {
            Some(holder) if holder != txid => Err(CoreError::ObjectBusy { invid }),
            Some(_) => Ok(Arc::clone(&slot.snapshot)),
            None => {
                slot.editor = Some(txid);
                let snapshot = Arc::clone(&slot.snapshot);
                inner.checked_out += 1;
                trace!(%invid, %txid, "object checked out");
                Ok(snapshot)
            }
        }
    }

    /// Releases an editor claim without committing anything.
    pub(crate) fn clear_editor(&self, num: u32, txid: TransactionId) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.get_mut(&num) {
            if slot.editor == Some(txid) {
                slot.editor = None;
                inner.checked_out = inner.checked_out.saturating_sub(1);
            }
        }
    }

    /// Allocates a fresh object number, preferring released numbers.
    pub(crate) fn allocate_num(&self) -> u32 {
        let mut inner = self.inner.write();
        if let Some(num) = inner.free_nums.pop() {
            num
        } else {
            let num = inner.next_num;
            inner.next_num += 1;
            num
        }
    }

    /// Returns an allocated-but-uncommitted number to the free list.
    pub(crate) fn release_num(&self, num: u32) {
        let mut inner = self.inner.write();
        if !inner.slots.contains_key(&num) && !inner.free_nums.contains(&num) {
            inner.free_nums.push(num);
        }
    }

    /// Marks uncommitted object state as checked out, pairing the counter
    /// kept by [`Self::try_set_editor`] for created objects.
    pub(crate) fn note_creation(&self) {
        self.inner.write().checked_out += 1;
    }

    /// Drops the checked-out count for a released created object.
    pub(crate) fn note_creation_released(&self) {
        let mut inner = self.inner.write();
        inner.checked_out = inner.checked_out.saturating_sub(1);
    }

    /// Number of objects currently checked out or pending creation.
    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.inner.read().checked_out
    }

    /// Installs a committed snapshot, replacing any previous version and
    /// clearing any editor claim.
    pub(crate) fn put(&self, snapshot: Arc<ObjectSnapshot>, txid: TransactionId) {
        let mut inner = self.inner.write();
        let num = snapshot.invid().num;
        let was_held = inner
            .slots
            .get(&num)
            .is_some_and(|slot| slot.editor == Some(txid));
        inner.slots.insert(
            num,
            Slot {
                snapshot,
                editor: None,
            },
        );
        if was_held {
            inner.checked_out = inner.checked_out.saturating_sub(1);
        }
    }

    /// Removes a committed object.
    pub(crate) fn remove(&self, num: u32, txid: TransactionId) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.remove(&num) {
            if slot.editor == Some(txid) {
                inner.checked_out = inner.checked_out.saturating_sub(1);
            }
            inner.free_nums.push(num);
        }
    }

    /// Records that a commit changed this base.
    pub(crate) fn update_timestamp(&self) {
        self.inner.write().modified_at = Some(SystemTime::now());
    }

    /// Ensures `num` is past the allocation watermark, for journal replay.
    pub(crate) fn ensure_num_allocated(&self, num: u32) {
        let mut inner = self.inner.write();
        if num >= inner.next_num {
            inner.next_num = num + 1;
        }
        inner.free_nums.retain(|&n| n != num);
    }
}

impl std::fmt::Debug for ObjectBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBase")
            .field("type", &self.def.name)
            .finish_non_exhaustive()
    }
}
