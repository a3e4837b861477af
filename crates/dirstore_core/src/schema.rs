//! Schema description: object types, fields, and namespaces.
//!
//! The schema is fixed at store open time. Fields may be marked required,
//! bound to a namespace, or flagged as asymmetric links; those flags drive
//! commit-time verification, uniqueness enforcement, and deletion locking.

use crate::error::{CoreError, CoreResult};
use crate::types::{FieldId, ObjectTypeId};

/// Definition of one field within an object type.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field id, unique within the type.
    pub id: FieldId,
    /// Field name, for diagnostics.
    pub name: String,
    /// Whether commit requires this field to hold a value.
    pub required: bool,
    /// Index into [`StoreConfig::namespaces`] if values of this field must
    /// be unique across the store.
    pub namespace: Option<usize>,
    /// Whether reference values in this field anchor their target: the
    /// target cannot be deleted while the reference stands.
    pub asymmetric_link: bool,
}

impl FieldDef {
    /// Creates a plain optional field.
    #[must_use]
    pub fn new(id: FieldId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            required: false,
            namespace: None,
            asymmetric_link: false,
        }
    }

    /// Marks the field required at commit.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Binds the field's values to the namespace at `index`.
    #[must_use]
    pub fn in_namespace(mut self, index: usize) -> Self {
        self.namespace = Some(index);
        self
    }

    /// Marks the field as an asymmetric link.
    #[must_use]
    pub fn asymmetric(mut self) -> Self {
        self.asymmetric_link = true;
        self
    }
}

/// Definition of one object type.
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Type id, unique within the store.
    pub id: ObjectTypeId,
    /// Type name, for diagnostics.
    pub name: String,
    /// The type's fields.
    pub fields: Vec<FieldDef>,
}

impl TypeDef {
    /// Creates a type definition.
    #[must_use]
    pub fn new(id: ObjectTypeId, name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            id,
            name: name.into(),
            fields,
        }
    }

    /// Looks up a field definition by id.
    pub fn field(&self, id: FieldId) -> CoreResult<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.id == id)
            .ok_or(CoreError::UnknownField {
                type_id: self.id,
                field: id,
            })
    }

    /// Iterates the fields that must hold values at commit.
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.required)
    }
}

/// Definition of one namespace.
#[derive(Debug, Clone)]
pub struct NamespaceDef {
    /// Namespace name, for diagnostics.
    pub name: String,
    /// Whether text values are compared case-insensitively.
    pub case_insensitive: bool,
}

impl NamespaceDef {
    /// Creates a namespace definition.
    #[must_use]
    pub fn new(name: impl Into<String>, case_insensitive: bool) -> Self {
        Self {
            name: name.into(),
            case_insensitive,
        }
    }
}

/// Full store configuration, fixed at open time.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// The object types hosted by the store.
    pub types: Vec<TypeDef>,
    /// The namespaces referenced by field definitions.
    pub namespaces: Vec<NamespaceDef>,
}

impl StoreConfig {
    /// Validates internal consistency: unique type ids, unique field ids
    /// per type, and namespace indices in range.
    pub fn validate(&self) -> CoreResult<()> {
        for (i, def) in self.types.iter().enumerate() {
            if self.types[..i].iter().any(|other| other.id == def.id) {
                return Err(CoreError::invalid_operation(format!(
                    "duplicate object type id {}",
                    def.id
                )));
            }
            for (j, field) in def.fields.iter().enumerate() {
                if def.fields[..j].iter().any(|other| other.id == field.id) {
                    return Err(CoreError::invalid_operation(format!(
                        "duplicate field id {} in type {}",
                        field.id, def.name
                    )));
                }
                if let Some(ns) = field.namespace {
                    if ns >= self.namespaces.len() {
                        return Err(CoreError::invalid_operation(format!(
                            "field {} in type {} names namespace index {ns}, but only {} defined",
                            field.name,
                            def.name,
                            self.namespaces.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
