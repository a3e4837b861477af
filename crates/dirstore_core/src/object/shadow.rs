//! Per-transaction editable object copies.

use std::sync::Arc;

use crate::object::snapshot::ObjectSnapshot;
use crate::types::{FieldId, Invid, ObjectStatus};
use crate::value::{FieldMap, FieldValue};

/// A transaction's private, mutable copy of an object.
///
/// Shadows exist only inside transaction state and are never shared.
/// `original` holds the committed snapshot the shadow was taken from, so
/// an abort can verify nothing replaced it and commit can diff against it.
#[derive(Debug, Clone)]
pub(crate) struct ObjectShadow {
    pub invid: Invid,
    pub status: ObjectStatus,
    pub fields: FieldMap,
    pub original: Option<Arc<ObjectSnapshot>>,
}

impl ObjectShadow {
    /// Creates a shadow for a brand-new object.
    pub fn creating(invid: Invid) -> Self {
        Self {
            invid,
            status: ObjectStatus::Creating,
            fields: FieldMap::new(),
            original: None,
        }
    }

    /// Creates a shadow over an existing committed snapshot.
    pub fn editing(original: Arc<ObjectSnapshot>) -> Self {
        Self {
            invid: original.invid(),
            status: ObjectStatus::Editing,
            fields: original.fields().clone(),
            original: Some(original),
        }
    }

    /// Reads one field.
    pub fn field(&self, id: FieldId) -> Option<&FieldValue> {
        self.fields.get(&id)
    }

    /// Sets one field, returning the previous value.
    pub fn set_field(&mut self, id: FieldId, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(id, value)
    }

    /// Clears one field, returning the previous value.
    pub fn clear_field(&mut self, id: FieldId) -> Option<FieldValue> {
        self.fields.remove(&id)
    }

    /// Restores the shadow to a checkpointed field map and status.
    pub fn restore(&mut self, fields: FieldMap, status: ObjectStatus) {
        self.fields = fields;
        self.status = status;
    }

    /// Freezes the shadow's fields into a new committed snapshot.
    pub fn materialize(&self) -> Arc<ObjectSnapshot> {
        ObjectSnapshot::new(self.invid, self.fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectTypeId;

    fn invid() -> Invid {
        Invid::new(ObjectTypeId::new(1), 5)
    }

    #[test]
    fn editing_copies_original_fields() {
        let mut fields = FieldMap::new();
        fields.insert(FieldId::new(1), FieldValue::Text("ada".into()));
        let snapshot = ObjectSnapshot::new(invid(), fields.clone());

        let mut shadow = ObjectShadow::editing(Arc::clone(&snapshot));
        assert_eq!(shadow.status, ObjectStatus::Editing);
        shadow.set_field(FieldId::new(1), FieldValue::Text("grace".into()));

        // The committed snapshot is untouched.
        assert_eq!(
            snapshot.field(FieldId::new(1)),
            Some(&FieldValue::Text("ada".into()))
        );
        assert_eq!(
            shadow.field(FieldId::new(1)),
            Some(&FieldValue::Text("grace".into()))
        );
    }

    #[test]
    fn restore_rewinds_fields_and_status() {
        let mut shadow = ObjectShadow::creating(invid());
        let saved = shadow.fields.clone();
        shadow.set_field(FieldId::new(2), FieldValue::Number(9));
        shadow.status = ObjectStatus::Dropping;

        shadow.restore(saved, ObjectStatus::Creating);
        assert_eq!(shadow.status, ObjectStatus::Creating);
        assert!(shadow.field(FieldId::new(2)).is_none());
    }
}
