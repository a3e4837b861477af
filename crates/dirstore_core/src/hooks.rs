//! Pluggable collaborators: audit, build scheduling, and access policy.
//!
//! The store calls these at well-defined points; the defaults do nothing
//! and permit everything.

use crate::types::{Invid, ObjectTypeId, TransactionId};

/// The kind of change an audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    /// An object was created.
    ObjectCreated,
    /// An object was edited.
    ObjectEdited,
    /// An object was deleted.
    ObjectDeleted,
    /// Free-form event logged by the application.
    Note,
}

/// One entry in a transaction's audit trail.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// What kind of change happened.
    pub kind: AuditKind,
    /// Human-readable summary.
    pub text: String,
    /// The objects involved.
    pub invids: Vec<Invid>,
}

impl AuditEvent {
    /// Creates an audit event.
    #[must_use]
    pub fn new(kind: AuditKind, text: impl Into<String>, invids: Vec<Invid>) -> Self {
        Self {
            kind,
            text: text.into(),
            invids,
        }
    }
}

/// Receives a transaction's audit trail after its point of no return.
///
/// Delivery failures are logged and otherwise ignored; they cannot undo
/// the commit.
pub trait AuditSink: Send + Sync {
    /// Delivers the events of one committed transaction.
    fn deliver(
        &self,
        txid: TransactionId,
        events: &[AuditEvent],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Audit sink that drops everything.
#[derive(Debug, Default)]
pub struct DiscardAudit;

impl AuditSink for DiscardAudit {
    fn deliver(
        &self,
        _txid: TransactionId,
        _events: &[AuditEvent],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Notified when a transaction commits, with the object types it touched.
/// Used to kick off downstream rebuild work.
pub trait BuildScheduler: Send + Sync {
    /// Called once per committed transaction, after objects are visible.
    fn transaction_committed(&self, txid: TransactionId, touched: &[ObjectTypeId]);
}

/// Build scheduler that ignores all notifications.
#[derive(Debug, Default)]
pub struct NullScheduler;

impl BuildScheduler for NullScheduler {
    fn transaction_committed(&self, _txid: TransactionId, _touched: &[ObjectTypeId]) {}
}

/// Decides whether a transaction may touch an object.
pub trait AccessPolicy: Send + Sync {
    /// May the transaction check out `invid` for editing?
    fn may_edit(&self, txid: TransactionId, invid: Invid) -> bool {
        let _ = (txid, invid);
        true
    }

    /// May the transaction create objects of `type_id`?
    fn may_create(&self, txid: TransactionId, type_id: ObjectTypeId) -> bool {
        let _ = (txid, type_id);
        true
    }

    /// May the transaction delete `invid`?
    fn may_delete(&self, txid: TransactionId, invid: Invid) -> bool {
        let _ = (txid, invid);
        true
    }
}

/// Access policy that permits everything.
#[derive(Debug, Default)]
pub struct PermitAll;

impl AccessPolicy for PermitAll {}
