//! # dirstore core
//!
//! Transactional object store for the dirstore directory server.
//!
//! This crate provides:
//! - Transactions with named checkpoints and two-phase journaled commit
//! - Namespace registries enforcing value uniqueness across objects
//! - Versioned object lifecycle: immutable snapshots, per-transaction shadows
//! - An in-core write lock over object collections
//! - Link tracking for reverse-pointer queries
//! - A deletion manager serializing delete/anchor races
//!
//! The entry point is [`ObjectStore`]: open one with a [`StoreConfig`]
//! describing the object types and namespaces, then run transactions
//! through [`ObjectStore::begin`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod deletion;
mod error;
mod hooks;
mod links;
mod locking;
mod namespace;
mod object;
mod recovery;
mod schema;
mod store;
mod txn;
mod types;
mod value;

pub use error::{CommitError, CoreError, CoreResult};
pub use hooks::{
    AccessPolicy, AuditEvent, AuditKind, AuditSink, BuildScheduler, DiscardAudit, NullScheduler,
    PermitAll,
};
pub use links::LinkTracker;
pub use namespace::NamespaceRegistry;
pub use object::{ObjectBase, ObjectSnapshot};
pub use schema::{FieldDef, NamespaceDef, StoreConfig, TypeDef};
pub use store::{Collaborators, ObjectStore, TransactionMode};
pub use txn::Transaction;
pub use types::{FieldId, FieldRef, Invid, ObjectStatus, ObjectTypeId, TransactionId};
pub use value::{FieldMap, FieldValue};
