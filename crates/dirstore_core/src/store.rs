//! The object store: owning container for bases, registries, and shared
//! coordination structures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dirstore_journal::{MemoryJournal, TransactionLog};
use parking_lot::Mutex;
use tracing::info;

use crate::deletion::DeletionManager;
use crate::error::{CoreError, CoreResult};
use crate::hooks::{AccessPolicy, AuditSink, BuildScheduler, DiscardAudit, NullScheduler, PermitAll};
use crate::links::LinkTracker;
use crate::locking::LockSync;
use crate::namespace::NamespaceRegistry;
use crate::object::{ObjectBase, ObjectSnapshot};
use crate::recovery;
use crate::schema::StoreConfig;
use crate::txn::Transaction;
use crate::types::{FieldRef, Invid, ObjectTypeId, TransactionId};
use crate::value::FieldValue;

/// How a transaction interacts with namespace constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Strict at-most-one namespace semantics; supports checkpoints.
    Interactive,
    /// Bulk-load mode: overlapping namespace claims are tolerated until
    /// commit, checkpoints are skipped.
    Batch,
}

/// Pluggable store collaborators. The defaults give an ephemeral store
/// that audits nothing and permits everything.
pub struct Collaborators {
    /// Durable transaction log.
    pub journal: Box<dyn TransactionLog>,
    /// Audit trail receiver.
    pub audit: Box<dyn AuditSink>,
    /// Post-commit build scheduler.
    pub scheduler: Box<dyn BuildScheduler>,
    /// Access control decisions.
    pub policy: Box<dyn AccessPolicy>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            journal: Box::new(MemoryJournal::new()),
            audit: Box::new(DiscardAudit),
            scheduler: Box::new(NullScheduler),
            policy: Box::new(PermitAll),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// A transactional object store.
pub struct ObjectStore {
    bases: HashMap<ObjectTypeId, ObjectBase>,
    namespaces: Vec<NamespaceRegistry>,
    links: LinkTracker,
    deletions: DeletionManager,
    lock_sync: Arc<LockSync>,
    journal: Mutex<Box<dyn TransactionLog>>,
    audit: Box<dyn AuditSink>,
    scheduler: Box<dyn BuildScheduler>,
    policy: Box<dyn AccessPolicy>,
    next_txid: AtomicU64,
}

impl ObjectStore {
    /// Opens a store: validates the configuration, replays the journal,
    /// and rebuilds namespace registries and link tracking from the
    /// recovered objects.
    pub fn open(config: StoreConfig, collaborators: Collaborators) -> CoreResult<Arc<Self>> {
        config.validate()?;

        let bases: HashMap<ObjectTypeId, ObjectBase> = config
            .types
            .iter()
            .map(|def| (def.id, ObjectBase::new(def.clone())))
            .collect();

        let replayed = recovery::replay(collaborators.journal.as_ref(), &bases)?;

        let store = Self {
            bases,
            namespaces: config
                .namespaces
                .iter()
                .map(NamespaceRegistry::new)
                .collect(),
            links: LinkTracker::new(),
            deletions: DeletionManager::new(),
            lock_sync: Arc::new(LockSync::new()),
            journal: Mutex::new(collaborators.journal),
            audit: collaborators.audit,
            scheduler: collaborators.scheduler,
            policy: collaborators.policy,
            next_txid: AtomicU64::new(1),
        };
        store.seed_registries()?;

        info!(
            types = store.bases.len(),
            namespaces = store.namespaces.len(),
            transactions_replayed = replayed,
            "object store opened"
        );
        Ok(Arc::new(store))
    }

    /// Rebuilds namespace and link state from committed objects.
    fn seed_registries(&self) -> CoreResult<()> {
        for base in self.bases.values() {
            for num in base.object_nums() {
                let Some(snapshot) = base.view(num) else {
                    continue;
                };
                let invid = snapshot.invid();
                for def in &base.type_def().fields {
                    let Some(value) = snapshot.field(def.id) else {
                        continue;
                    };
                    let field_ref = FieldRef::new(invid, def.id);
                    if let Some(ns) = def.namespace {
                        self.namespaces[ns].load_persistent(value, field_ref)?;
                    }
                    if def.asymmetric_link {
                        if let Some(target) = value.as_reference() {
                            self.links.load_persistent(invid, target);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Begins a new transaction.
    pub fn begin(
        self: &Arc<Self>,
        description: impl Into<String>,
        mode: TransactionMode,
    ) -> Arc<Transaction> {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::Relaxed));
        Arc::new(Transaction::new(
            Arc::clone(self),
            id,
            description.into(),
            mode == TransactionMode::Interactive,
        ))
    }

    /// Returns the committed snapshot of an object, if it exists.
    #[must_use]
    pub fn view(&self, invid: Invid) -> Option<Arc<ObjectSnapshot>> {
        self.bases.get(&invid.type_id)?.view(invid.num)
    }

    /// Returns the base for an object type.
    pub fn base(&self, type_id: ObjectTypeId) -> CoreResult<&ObjectBase> {
        self.bases
            .get(&type_id)
            .ok_or(CoreError::UnknownType { type_id })
    }

    /// Returns the committed binding of a namespace value, if any.
    #[must_use]
    pub fn lookup_namespace(&self, index: usize, value: &FieldValue) -> Option<FieldRef> {
        self.namespaces.get(index)?.lookup_persistent(value)
    }

    /// Returns the committed objects whose asymmetric links point at
    /// `target`.
    #[must_use]
    pub fn referrers(&self, target: Invid) -> std::collections::HashSet<Invid> {
        self.links.persisted_sources_of(target)
    }

    pub(crate) fn namespaces(&self) -> &[NamespaceRegistry] {
        &self.namespaces
    }

    pub(crate) fn registry(&self, index: usize) -> &NamespaceRegistry {
        &self.namespaces[index]
    }

    pub(crate) fn links(&self) -> &LinkTracker {
        &self.links
    }

    pub(crate) fn deletions(&self) -> &DeletionManager {
        &self.deletions
    }

    pub(crate) fn lock_sync(&self) -> &Arc<LockSync> {
        &self.lock_sync
    }

    pub(crate) fn journal(&self) -> &Mutex<Box<dyn TransactionLog>> {
        &self.journal
    }

    pub(crate) fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    pub(crate) fn scheduler(&self) -> &dyn BuildScheduler {
        self.scheduler.as_ref()
    }

    pub(crate) fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("types", &self.bases.len())
            .field("namespaces", &self.namespaces.len())
            .finish_non_exhaustive()
    }
}
