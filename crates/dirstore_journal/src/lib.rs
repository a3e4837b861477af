//! # dirstore journal
//!
//! Durable transaction journal for the dirstore directory server.
//!
//! Every committed transaction is persisted here before its changes become
//! visible in the object store. A transaction occupies a contiguous run of
//! records: a begin marker, one record per object mutation, an end marker,
//! and finally a separate finalize marker written once the server is past
//! the point of no return. On restart, a recovery scan replays runs that
//! carry the finalize marker and discards a trailing run that does not.
//!
//! Two implementations of [`TransactionLog`] are provided:
//!
//! - [`FileJournal`] - append-only file with an advisory exclusive lock
//! - [`MemoryJournal`] - in-memory log for tests and ephemeral stores

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod log;
mod record;

pub use error::{JournalError, JournalResult};
pub use log::{FileJournal, JournalHandle, MemoryJournal, RecoveredTransaction, TransactionLog};
pub use record::{JournalOp, JournalRecord, TransactionRecord};
