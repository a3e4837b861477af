//! Namespace registries: store-wide unique value constraints.
//!
//! A registry maps each constrained value to a handle recording who owns
//! it. Committed values carry the field that persists them; values claimed
//! by an open transaction carry the claiming transaction plus up to two
//! speculative bindings, a primary claim and (batch mode only) a secondary
//! claim that must be resolved before commit.
//!
//! All claim state is transient. Registries are rebuilt from committed
//! objects at store open; only the persisted bindings survive a restart.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::{CoreError, CoreResult};
use crate::schema::NamespaceDef;
use crate::types::{FieldRef, TransactionId};
use crate::value::FieldValue;

/// Ownership record for one constrained value.
#[derive(Debug, Clone)]
struct Handle {
    /// Transaction holding a speculative claim, if any.
    editor: Option<TransactionId>,
    /// The committed field binding this value, if any.
    persisted: Option<FieldRef>,
    /// The claiming transaction's main binding.
    primary: Option<FieldRef>,
    /// Batch-mode overlap binding; must be gone by commit.
    secondary: Option<FieldRef>,
    /// True when held via `reserve` rather than a field write.
    reserved: bool,
    /// Pre-claim state of a checked-out persisted handle, restored on
    /// abort or rollback.
    original: Option<Box<Handle>>,
}

impl Handle {
    fn claimed(txn: TransactionId, reserved: bool, primary: Option<FieldRef>) -> Self {
        Self {
            editor: Some(txn),
            persisted: None,
            primary,
            secondary: None,
            reserved,
            original: None,
        }
    }

    fn persisted(field: FieldRef) -> Self {
        Self {
            editor: None,
            persisted: Some(field),
            primary: None,
            secondary: None,
            reserved: false,
            original: None,
        }
    }
}

#[derive(Debug, Default)]
struct TxnRecord {
    /// Every value this transaction holds a handle on.
    touched: HashSet<FieldValue>,
    /// Named checkpoint stack; each entry snapshots the handles of all
    /// values touched at checkpoint time.
    checkpoints: Vec<(String, HashMap<FieldValue, Handle>)>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    values: HashMap<FieldValue, Handle>,
    transactions: HashMap<TransactionId, TxnRecord>,
}

/// One namespace's value-ownership table.
pub struct NamespaceRegistry {
    name: String,
    case_insensitive: bool,
    inner: Mutex<RegistryInner>,
}

impl NamespaceRegistry {
    /// Creates an empty registry for `def`.
    #[must_use]
    pub fn new(def: &NamespaceDef) -> Self {
        Self {
            name: def.name.clone(),
            case_insensitive: def.case_insensitive,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// The namespace's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn normalize(&self, value: &FieldValue) -> FieldValue {
        value.normalized(self.case_insensitive)
    }

    /// Loads a committed binding during store open.
    ///
    /// Fails if two committed objects bind the same value, which means the
    /// journal replayed state that violates the constraint.
    pub(crate) fn load_persistent(&self, value: &FieldValue, field: FieldRef) -> CoreResult<()> {
        let key = self.normalize(value);
        let inner = &mut *self.inner.lock();
        if inner.values.contains_key(&key) {
            return Err(CoreError::ValueInUse {
                value: key.to_string(),
                namespace: self.name.clone(),
            });
        }
        inner.values.insert(key, Handle::persisted(field));
        Ok(())
    }

    /// Returns the committed binding of `value`, if any.
    #[must_use]
    pub fn lookup_persistent(&self, value: &FieldValue) -> Option<FieldRef> {
        let key = self.normalize(value);
        self.inner
            .lock()
            .values
            .get(&key)
            .and_then(|handle| match handle.editor {
                None => handle.persisted,
                Some(_) => None,
            })
    }

    /// Claims `value` for `txn` without binding it to a field.
    ///
    /// With `only_if_unused` set, the call fails if the transaction has
    /// already bound the value to a field.
    pub fn reserve(&self, txn: TransactionId, value: &FieldValue, only_if_unused: bool) -> bool {
        let key = self.normalize(value);
        let inner = &mut *self.inner.lock();

        match inner.values.get(&key) {
            None => {
                inner
                    .values
                    .insert(key.clone(), Handle::claimed(txn, true, None));
                inner.transactions.entry(txn).or_default().touched.insert(key);
                true
            }
            Some(handle) => match handle.editor {
                None => false,
                Some(holder) if holder != txn => false,
                Some(_) => !(only_if_unused && handle.primary.is_some()),
            },
        }
    }

    /// Tests whether a [`Self::mark`] call would succeed, without claiming
    /// anything.
    #[must_use]
    pub fn test_mark(&self, txn: TransactionId, interactive: bool, value: &FieldValue) -> bool {
        let key = self.normalize(value);
        let inner = self.inner.lock();
        match inner.values.get(&key) {
            None => true,
            Some(handle) => match handle.editor {
                Some(holder) if holder == txn => {
                    handle.primary.is_none() || (!interactive && handle.secondary.is_none())
                }
                _ => false,
            },
        }
    }

    /// Binds `value` to `field` on behalf of `txn`.
    ///
    /// Interactive transactions get strict at-most-one semantics: a value
    /// already bound anywhere is refused. Batch transactions may take a
    /// second, overlapping claim on a value whose committed user has not
    /// yet released it; the overlap is tracked as a secondary claim and
    /// must resolve to a single binding before commit.
    pub fn mark(
        &self,
        txn: TransactionId,
        interactive: bool,
        value: &FieldValue,
        field: FieldRef,
    ) -> bool {
        let key = self.normalize(value);
        let inner = &mut *self.inner.lock();

        let Some(handle) = inner.values.get_mut(&key) else {
            inner
                .values
                .insert(key.clone(), Handle::claimed(txn, false, Some(field)));
            inner.transactions.entry(txn).or_default().touched.insert(key);
            trace!(namespace = %self.name, %txn, %field, "value marked (fresh)");
            return true;
        };

        match handle.editor {
            Some(holder) if holder != txn => false,

            // Persisted, unclaimed value. Interactively that means the
            // committed user still holds it; batch loads may claim it
            // speculatively, carrying the old binding as primary.
            None => {
                if interactive {
                    return false;
                }
                let prior = handle.clone();
                handle.original = Some(Box::new(prior));
                handle.editor = Some(txn);
                handle.primary = handle.persisted;
                handle.secondary = Some(field);
                inner.transactions.entry(txn).or_default().touched.insert(key);
                trace!(namespace = %self.name, %txn, %field, "secondary claim over committed value");
                true
            }

            Some(_) => {
                if handle.primary.is_none() {
                    handle.primary = Some(field);
                    return true;
                }
                if handle.primary == Some(field) {
                    return true;
                }
                if interactive {
                    return false;
                }
                if handle.secondary.is_none() || handle.secondary == Some(field) {
                    handle.secondary = Some(field);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Releases the binding of `value` to `old_field`.
    ///
    /// Clearing a secondary claim drops it. Clearing a primary claim while
    /// a batch secondary claim stands promotes the secondary to primary,
    /// resolving the overlap. Clearing a committed binding checks the
    /// handle out so the value stays unavailable to other transactions
    /// until this one resolves.
    pub fn unmark(
        &self,
        txn: TransactionId,
        interactive: bool,
        value: &FieldValue,
        old_field: FieldRef,
    ) -> bool {
        let key = self.normalize(value);
        let inner = &mut *self.inner.lock();

        let Some(handle) = inner.values.get_mut(&key) else {
            return false;
        };

        match handle.editor {
            Some(holder) if holder != txn => false,

            None => {
                if handle.persisted != Some(old_field) {
                    return false;
                }
                let prior = handle.clone();
                handle.original = Some(Box::new(prior));
                handle.editor = Some(txn);
                handle.primary = None;
                handle.secondary = None;
                inner.transactions.entry(txn).or_default().touched.insert(key);
                trace!(namespace = %self.name, %txn, "committed value released, held for transaction");
                true
            }

            Some(_) => {
                if handle.secondary == Some(old_field) {
                    handle.secondary = None;
                    return true;
                }
                if handle.primary == Some(old_field) {
                    if !interactive && handle.secondary.is_some() {
                        handle.primary = handle.secondary.take();
                    } else {
                        handle.primary = None;
                    }
                    return true;
                }
                false
            }
        }
    }

    /// Snapshots `txn`'s claim state under `name`.
    pub fn checkpoint(&self, txn: TransactionId, name: &str) {
        let inner = &mut *self.inner.lock();
        let saved: HashMap<FieldValue, Handle> = inner
            .transactions
            .get(&txn)
            .map(|record| {
                record
                    .touched
                    .iter()
                    .filter_map(|value| {
                        inner.values.get(value).map(|h| (value.clone(), h.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        inner
            .transactions
            .entry(txn)
            .or_default()
            .checkpoints
            .push((name.to_owned(), saved));
    }

    /// Discards the checkpoint `name` and any checkpoints stacked above it.
    pub fn pop_checkpoint(&self, txn: TransactionId, name: &str) -> bool {
        let inner = &mut *self.inner.lock();
        let Some(record) = inner.transactions.get_mut(&txn) else {
            return false;
        };
        match Self::find_checkpoint(&record.checkpoints, name) {
            Some(index) => {
                record.checkpoints.truncate(index);
                true
            }
            None => false,
        }
    }

    /// Rewinds `txn`'s claims to the checkpoint `name`, discarding any
    /// checkpoints stacked above it.
    pub fn rollback(&self, txn: TransactionId, name: &str) -> bool {
        let inner = &mut *self.inner.lock();
        let Some(record) = inner.transactions.get_mut(&txn) else {
            return false;
        };
        let Some(index) = Self::find_checkpoint(&record.checkpoints, name) else {
            error!(namespace = %self.name, %txn, name, "rollback to unknown checkpoint");
            return false;
        };
        record.checkpoints.truncate(index + 1);
        let (_, saved) = record
            .checkpoints
            .pop()
            .unwrap_or_else(|| (name.to_owned(), HashMap::new()));

        let touched: Vec<FieldValue> = record.touched.iter().cloned().collect();
        let mut still_touched = HashSet::new();

        for value in touched {
            match saved.get(&value) {
                Some(saved_handle) => {
                    inner.values.insert(value.clone(), saved_handle.clone());
                    still_touched.insert(value);
                }
                // Claimed after the checkpoint: restore the pre-claim
                // state or drop the handle entirely.
                None => match inner.values.get(&value).and_then(|h| h.original.clone()) {
                    Some(original) => {
                        inner.values.insert(value, *original);
                    }
                    None => {
                        inner.values.remove(&value);
                    }
                },
            }
        }

        if let Some(record) = inner.transactions.get_mut(&txn) {
            record.touched = still_touched;
        }
        true
    }

    fn find_checkpoint(
        checkpoints: &[(String, HashMap<FieldValue, Handle>)],
        name: &str,
    ) -> Option<usize> {
        checkpoints.iter().rposition(|(n, _)| n == name)
    }

    /// Returns the display forms of values where `txn` still holds an
    /// unresolved secondary claim. Commit refuses to proceed while this
    /// is non-empty.
    #[must_use]
    pub fn verify_conflicts(&self, txn: TransactionId) -> Vec<String> {
        let inner = self.inner.lock();
        let Some(record) = inner.transactions.get(&txn) else {
            return Vec::new();
        };
        record
            .touched
            .iter()
            .filter(|value| {
                inner
                    .values
                    .get(value)
                    .is_some_and(|h| h.editor == Some(txn) && h.secondary.is_some())
            })
            .map(ToString::to_string)
            .collect()
    }

    /// Makes `txn`'s surviving claims permanent and releases the rest.
    pub(crate) fn commit(&self, txn: TransactionId) {
        let inner = &mut *self.inner.lock();
        let Some(record) = inner.transactions.remove(&txn) else {
            return;
        };
        for value in record.touched {
            let Some(handle) = inner.values.get(&value) else {
                continue;
            };
            if handle.editor != Some(txn) {
                continue;
            }
            if handle.secondary.is_some() {
                error!(
                    namespace = %self.name, %txn, value = %value,
                    "secondary claim survived to commit"
                );
            }
            match handle.primary {
                Some(field) => {
                    inner.values.insert(value, Handle::persisted(field));
                }
                None => {
                    inner.values.remove(&value);
                }
            }
        }
    }

    /// Discards all of `txn`'s claims, restoring checked-out committed
    /// values.
    pub(crate) fn abort(&self, txn: TransactionId) {
        let inner = &mut *self.inner.lock();
        let Some(record) = inner.transactions.remove(&txn) else {
            return;
        };
        for value in record.touched {
            let Some(handle) = inner.values.get(&value) else {
                continue;
            };
            if handle.editor != Some(txn) {
                continue;
            }
            match handle.original.clone() {
                Some(original) => {
                    inner.values.insert(value, *original);
                }
                None => {
                    inner.values.remove(&value);
                }
            }
        }
    }
}

impl std::fmt::Debug for NamespaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRegistry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldId, Invid, ObjectTypeId};

    fn registry() -> NamespaceRegistry {
        NamespaceRegistry::new(&NamespaceDef::new("usernames", true))
    }

    fn field(num: u32) -> FieldRef {
        FieldRef::new(Invid::new(ObjectTypeId::new(1), num), FieldId::new(1))
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.into())
    }

    #[test]
    fn mark_is_exclusive_between_transactions() {
        let reg = registry();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        assert!(reg.mark(a, true, &text("ada"), field(1)));
        assert!(!reg.mark(b, true, &text("ada"), field(2)));
        assert!(!reg.test_mark(b, true, &text("ada")));

        reg.abort(a);
        assert!(reg.mark(b, true, &text("ada"), field(2)));
    }

    #[test]
    fn case_insensitive_values_collide() {
        let reg = registry();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        assert!(reg.mark(a, true, &text("Ada"), field(1)));
        assert!(!reg.mark(b, true, &text("ada"), field(2)));
    }

    #[test]
    fn interactive_mark_refuses_second_binding() {
        let reg = registry();
        let a = TransactionId::new(1);

        assert!(reg.mark(a, true, &text("ada"), field(1)));
        assert!(!reg.mark(a, true, &text("ada"), field(2)));
        // Same binding again is a no-op success.
        assert!(reg.mark(a, true, &text("ada"), field(1)));
    }

    #[test]
    fn unmark_releases_for_reuse_within_transaction() {
        let reg = registry();
        let a = TransactionId::new(1);

        assert!(reg.mark(a, true, &text("ada"), field(1)));
        assert!(reg.unmark(a, true, &text("ada"), field(1)));
        assert!(reg.mark(a, true, &text("ada"), field(2)));
    }

    #[test]
    fn committed_value_stays_held_after_unmark() {
        let reg = registry();
        reg.load_persistent(&text("ada"), field(1)).unwrap();

        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        // a releases the committed binding; b still cannot take the value.
        assert!(reg.unmark(a, true, &text("ada"), field(1)));
        assert!(!reg.mark(b, true, &text("ada"), field(2)));

        // a aborts; the committed binding is restored.
        reg.abort(a);
        assert_eq!(reg.lookup_persistent(&text("ada")), Some(field(1)));
    }

    #[test]
    fn commit_persists_primary_claims() {
        let reg = registry();
        let a = TransactionId::new(1);

        assert!(reg.mark(a, true, &text("ada"), field(1)));
        reg.commit(a);
        assert_eq!(reg.lookup_persistent(&text("ada")), Some(field(1)));

        // Released values vanish at commit.
        let b = TransactionId::new(2);
        assert!(reg.unmark(b, true, &text("ada"), field(1)));
        reg.commit(b);
        assert_eq!(reg.lookup_persistent(&text("ada")), None);
    }

    #[test]
    fn batch_secondary_claim_and_promotion() {
        let reg = registry();
        reg.load_persistent(&text("ada"), field(1)).unwrap();
        let a = TransactionId::new(1);

        // Batch load claims a value still committed elsewhere.
        assert!(reg.mark(a, false, &text("ada"), field(2)));
        assert_eq!(reg.verify_conflicts(a), vec!["ada".to_owned()]);

        // The old binding is released; the secondary claim promotes.
        assert!(reg.unmark(a, false, &text("ada"), field(1)));
        assert!(reg.verify_conflicts(a).is_empty());

        reg.commit(a);
        assert_eq!(reg.lookup_persistent(&text("ada")), Some(field(2)));
    }

    #[test]
    fn interactive_cannot_overlap_committed_value() {
        let reg = registry();
        reg.load_persistent(&text("ada"), field(1)).unwrap();
        assert!(!reg.mark(TransactionId::new(1), true, &text("ada"), field(2)));
    }

    #[test]
    fn reserve_blocks_other_transactions() {
        let reg = registry();
        let a = TransactionId::new(1);
        let b = TransactionId::new(2);

        assert!(reg.reserve(a, &text("ada"), false));
        assert!(!reg.reserve(b, &text("ada"), false));
        assert!(!reg.mark(b, true, &text("ada"), field(2)));

        // The reserving transaction may bind the value.
        assert!(reg.mark(a, true, &text("ada"), field(1)));
        // only_if_unused now fails, plain reserve still succeeds.
        assert!(!reg.reserve(a, &text("ada"), true));
        assert!(reg.reserve(a, &text("ada"), false));
    }

    #[test]
    fn rollback_rewinds_claims() {
        let reg = registry();
        let a = TransactionId::new(1);

        assert!(reg.mark(a, true, &text("ada"), field(1)));
        reg.checkpoint(a, "step");
        assert!(reg.mark(a, true, &text("grace"), field(2)));
        assert!(reg.unmark(a, true, &text("ada"), field(1)));

        assert!(reg.rollback(a, "step"));

        // ada is bound again, grace is free.
        assert!(!reg.mark(TransactionId::new(2), true, &text("ada"), field(9)));
        assert!(reg.mark(TransactionId::new(2), true, &text("grace"), field(9)));
    }

    #[test]
    fn rollback_restores_checked_out_committed_values() {
        let reg = registry();
        reg.load_persistent(&text("ada"), field(1)).unwrap();
        let a = TransactionId::new(1);

        reg.checkpoint(a, "step");
        assert!(reg.unmark(a, true, &text("ada"), field(1)));
        assert!(reg.rollback(a, "step"));

        assert_eq!(reg.lookup_persistent(&text("ada")), Some(field(1)));
    }

    #[test]
    fn rollback_to_unknown_checkpoint_fails() {
        let reg = registry();
        let a = TransactionId::new(1);
        reg.checkpoint(a, "step");
        assert!(!reg.rollback(a, "other"));
    }

    #[test]
    fn nested_checkpoints_unwind_in_order() {
        let reg = registry();
        let a = TransactionId::new(1);

        reg.checkpoint(a, "outer");
        assert!(reg.mark(a, true, &text("ada"), field(1)));
        reg.checkpoint(a, "inner");
        assert!(reg.mark(a, true, &text("grace"), field(2)));

        // Rolling back to outer discards inner too.
        assert!(reg.rollback(a, "outer"));
        assert!(!reg.rollback(a, "inner"));
        assert!(reg.mark(TransactionId::new(2), true, &text("ada"), field(9)));
    }
}
