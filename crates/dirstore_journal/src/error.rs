//! Error types for journal operations.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur while writing or recovering the journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The journal file is held by another process.
    #[error("journal locked: another process has exclusive access")]
    Locked,

    /// The journal contains a malformed record.
    #[error("journal corruption at offset {offset}: {message}")]
    Corruption {
        /// Byte offset of the bad record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A finalize or undo call referenced a transaction the journal does
    /// not consider outstanding.
    #[error("unknown journal handle for transaction {txid}")]
    UnknownHandle {
        /// Transaction id carried by the stale handle.
        txid: u64,
    },

    /// A record payload exceeded the 4-byte length field.
    #[error("record payload too large: {len} bytes")]
    PayloadTooLarge {
        /// The offending payload length.
        len: usize,
    },
}

impl JournalError {
    /// Creates a corruption error.
    pub fn corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            message: message.into(),
        }
    }
}
