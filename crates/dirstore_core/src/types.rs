//! Core type definitions for the object store.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused for the
/// life of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier for an object type (a collection of objects sharing a
/// field schema).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectTypeId(pub u16);

impl ObjectTypeId {
    /// Creates a new object type ID.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ObjectTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type:{}", self.0)
    }
}

/// Identifier for a field within an object type's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u16);

impl FieldId {
    /// Creates a new field ID.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field:{}", self.0)
    }
}

/// Invariant object identifier: an object type paired with an object
/// number that is never reassigned while the object exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Invid {
    /// The object's type.
    pub type_id: ObjectTypeId,
    /// The object's number within its type.
    pub num: u32,
}

impl Invid {
    /// Creates an invid from its parts.
    #[must_use]
    pub const fn new(type_id: ObjectTypeId, num: u32) -> Self {
        Self { type_id, num }
    }
}

impl fmt::Display for Invid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv:{}:{}", self.type_id.as_u16(), self.num)
    }
}

/// A field within a specific object, used to record which field holds a
/// namespace value or a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// The owning object.
    pub invid: Invid,
    /// The field within that object.
    pub field: FieldId,
}

impl FieldRef {
    /// Creates a field reference from its parts.
    #[must_use]
    pub const fn new(invid: Invid, field: FieldId) -> Self {
        Self { invid, field }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.invid, self.field.as_u16())
    }
}

/// Lifecycle status of a shadow object within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    /// Created by this transaction; did not exist before.
    Creating,
    /// A pre-existing object checked out for edit.
    Editing,
    /// A pre-existing object marked for deletion.
    Deleting,
    /// Created by this transaction and then deleted; commits to nothing.
    Dropping,
}

impl ObjectStatus {
    /// True for the statuses that remove the object at commit.
    #[must_use]
    pub fn is_deletion(self) -> bool {
        matches!(self, Self::Deleting | Self::Dropping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invid_display() {
        let invid = Invid::new(ObjectTypeId::new(3), 271);
        assert_eq!(invid.to_string(), "inv:3:271");
    }

    #[test]
    fn deletion_statuses() {
        assert!(ObjectStatus::Deleting.is_deletion());
        assert!(ObjectStatus::Dropping.is_deletion());
        assert!(!ObjectStatus::Creating.is_deletion());
        assert!(!ObjectStatus::Editing.is_deletion());
    }
}
