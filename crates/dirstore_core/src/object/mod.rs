//! Versioned object storage.
//!
//! Committed objects live as immutable [`ObjectSnapshot`]s inside a
//! per-type [`ObjectBase`]. Transactions never mutate a snapshot; they
//! check out a private [`ObjectShadow`], edit that, and swap a new
//! snapshot in at commit.

mod base;
mod shadow;
mod snapshot;

pub use base::ObjectBase;
pub(crate) use shadow::ObjectShadow;
pub use snapshot::ObjectSnapshot;
