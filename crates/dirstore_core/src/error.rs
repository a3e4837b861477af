//! Error types for the object store.

use thiserror::Error;

use crate::types::{FieldId, Invid, ObjectTypeId};

/// Result alias using [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by store and transaction operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A journal operation failed.
    #[error("journal error: {0}")]
    Journal(#[from] dirstore_journal::JournalError),

    /// The object is already checked out by another transaction.
    #[error("object {invid} is checked out by another transaction")]
    ObjectBusy {
        /// The contested object.
        invid: Invid,
    },

    /// No such object exists.
    #[error("object {invid} not found")]
    ObjectNotFound {
        /// The missing object.
        invid: Invid,
    },

    /// No such object type is configured.
    #[error("unknown object type {type_id}")]
    UnknownType {
        /// The unconfigured type.
        type_id: ObjectTypeId,
    },

    /// The field is not part of the object type's schema.
    #[error("unknown field {field} on {type_id}")]
    UnknownField {
        /// The owning type.
        type_id: ObjectTypeId,
        /// The unconfigured field.
        field: FieldId,
    },

    /// A namespace-constrained value is already claimed or in use.
    #[error("value {value:?} is already in use in namespace {namespace:?}")]
    ValueInUse {
        /// The contested value, in display form.
        value: String,
        /// The namespace it collided in.
        namespace: String,
    },

    /// Batch-mode commit found unresolved overlapping namespace claims.
    #[error("unresolved namespace conflicts: {conflicts:?}")]
    NamespaceConflicts {
        /// Display forms of the conflicting values.
        conflicts: Vec<String>,
    },

    /// Phase one of commit found required fields without values.
    #[error("object {invid} is missing required fields {fields:?}")]
    MissingFields {
        /// The incomplete object.
        invid: Invid,
        /// The required fields left unset.
        fields: Vec<FieldId>,
    },

    /// The commit-time write lock could not be established.
    #[error("write lock refused")]
    LockRefused,

    /// The target object is being deleted by another transaction.
    #[error("object {invid} is being deleted by another transaction")]
    DeletionBlocked {
        /// The object being deleted.
        invid: Invid,
    },

    /// The access policy refused the operation.
    #[error("permission denied for object {invid}")]
    PermissionDenied {
        /// The refused object.
        invid: Invid,
    },

    /// The transaction has already committed or aborted.
    #[error("transaction is already finished")]
    TransactionFinished,

    /// The transaction can no longer commit and must be aborted.
    #[error("transaction must be aborted")]
    MustAbort,

    /// The operation is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// What went wrong.
        message: String,
    },

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Commit failure, split by whether the transaction survives.
///
/// A retryable failure leaves the transaction open with all of its work
/// intact; the caller may resolve the problem and commit again. A fatal
/// failure has already released the transaction.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The transaction is still open and may be committed again.
    #[error("commit failed (transaction still open): {0}")]
    Retryable(#[source] CoreError),

    /// The transaction has been released and cannot be retried.
    #[error("commit failed (transaction released): {0}")]
    Fatal(#[source] CoreError),
}

impl CommitError {
    /// Returns the underlying error.
    #[must_use]
    pub fn inner(&self) -> &CoreError {
        match self {
            Self::Retryable(err) | Self::Fatal(err) => err,
        }
    }
}
