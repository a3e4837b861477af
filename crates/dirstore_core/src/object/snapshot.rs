//! Immutable committed object versions.

use std::sync::Arc;

use crate::types::{FieldId, Invid};
use crate::value::{FieldMap, FieldValue};

/// One committed version of an object.
///
/// Snapshots are immutable and shared behind [`Arc`]: readers holding one
/// see a stable view no matter what later transactions commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSnapshot {
    invid: Invid,
    fields: FieldMap,
}

impl ObjectSnapshot {
    /// Creates a snapshot from a finished field map.
    #[must_use]
    pub fn new(invid: Invid, fields: FieldMap) -> Arc<Self> {
        Arc::new(Self { invid, fields })
    }

    /// The object's identifier.
    #[must_use]
    pub fn invid(&self) -> Invid {
        self.invid
    }

    /// Reads one field.
    #[must_use]
    pub fn field(&self, id: FieldId) -> Option<&FieldValue> {
        self.fields.get(&id)
    }

    /// The full field map.
    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }
}
