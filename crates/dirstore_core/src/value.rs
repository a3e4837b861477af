//! Field values and the on-journal field map encoding.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::types::{FieldId, Invid, ObjectTypeId};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldValue {
    /// A text value.
    Text(String),
    /// A signed integer value.
    Number(i64),
    /// A reference to another object.
    Reference(Invid),
}

impl FieldValue {
    /// Returns the key form of this value for a namespace registry.
    ///
    /// Case-insensitive namespaces fold text to lowercase so that `Ada`
    /// and `ada` collide; other value kinds are unchanged.
    #[must_use]
    pub fn normalized(&self, case_insensitive: bool) -> FieldValue {
        match self {
            Self::Text(s) if case_insensitive => Self::Text(s.to_lowercase()),
            other => other.clone(),
        }
    }

    /// Returns the referenced object, if this is a reference value.
    #[must_use]
    pub fn as_reference(&self) -> Option<Invid> {
        match self {
            Self::Reference(invid) => Some(*invid),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Reference(invid) => write!(f, "{invid}"),
        }
    }
}

/// An object's fields, keyed by field id. Ordered so the journal encoding
/// is deterministic.
pub type FieldMap = BTreeMap<FieldId, FieldValue>;

const TAG_TEXT: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_REFERENCE: u8 = 3;

/// Encodes a field map into the journal payload format.
///
/// Layout: field count (u32), then per field the id (u16), a value tag
/// byte, and the tag-specific body. All integers little-endian.
pub fn encode_fields(fields: &FieldMap) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    let count = u32::try_from(fields.len())
        .map_err(|_| CoreError::internal("field map too large to encode"))?;
    buf.extend_from_slice(&count.to_le_bytes());

    for (id, value) in fields {
        buf.extend_from_slice(&id.as_u16().to_le_bytes());
        match value {
            FieldValue::Text(s) => {
                buf.push(TAG_TEXT);
                let bytes = s.as_bytes();
                let len = u32::try_from(bytes.len())
                    .map_err(|_| CoreError::internal("text value too large to encode"))?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            FieldValue::Number(n) => {
                buf.push(TAG_NUMBER);
                buf.extend_from_slice(&n.to_le_bytes());
            }
            FieldValue::Reference(invid) => {
                buf.push(TAG_REFERENCE);
                buf.extend_from_slice(&invid.type_id.as_u16().to_le_bytes());
                buf.extend_from_slice(&invid.num.to_le_bytes());
            }
        }
    }

    Ok(buf)
}

/// Decodes a field map from the journal payload format.
pub fn decode_fields(buf: &[u8]) -> CoreResult<FieldMap> {
    let mut cursor = 0usize;

    fn take<'a>(buf: &'a [u8], cursor: &mut usize, n: usize) -> CoreResult<&'a [u8]> {
        let end = *cursor + n;
        if end > buf.len() {
            return Err(CoreError::internal("truncated field map payload"));
        }
        let slice = &buf[*cursor..end];
        *cursor = end;
        Ok(slice)
    }

    fn take_u16(buf: &[u8], cursor: &mut usize) -> CoreResult<u16> {
        let bytes = take(buf, cursor, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(buf: &[u8], cursor: &mut usize) -> CoreResult<u32> {
        let bytes = take(buf, cursor, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    let count = take_u32(buf, &mut cursor)?;
    let mut fields = FieldMap::new();

    for _ in 0..count {
        let id = FieldId::new(take_u16(buf, &mut cursor)?);
        let tag = take(buf, &mut cursor, 1)?[0];
        let value = match tag {
            TAG_TEXT => {
                let len = take_u32(buf, &mut cursor)? as usize;
                let bytes = take(buf, &mut cursor, len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| CoreError::internal("field text not UTF-8"))?;
                FieldValue::Text(text.to_owned())
            }
            TAG_NUMBER => {
                let bytes = take(buf, &mut cursor, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                FieldValue::Number(i64::from_le_bytes(raw))
            }
            TAG_REFERENCE => {
                let type_id = ObjectTypeId::new(take_u16(buf, &mut cursor)?);
                let num = take_u32(buf, &mut cursor)?;
                FieldValue::Reference(Invid::new(type_id, num))
            }
            other => {
                return Err(CoreError::internal(format!("unknown value tag {other}")));
            }
        };
        fields.insert(id, value);
    }

    if cursor != buf.len() {
        return Err(CoreError::internal("trailing bytes in field map payload"));
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalization_folds_text_case() {
        let value = FieldValue::Text("Ada.Lovelace".into());
        assert_eq!(
            value.normalized(true),
            FieldValue::Text("ada.lovelace".into())
        );
        assert_eq!(value.normalized(false), value);
    }

    #[test]
    fn field_map_roundtrip() {
        let mut fields = FieldMap::new();
        fields.insert(FieldId::new(1), FieldValue::Text("ada".into()));
        fields.insert(FieldId::new(2), FieldValue::Number(-42));
        fields.insert(
            FieldId::new(3),
            FieldValue::Reference(Invid::new(ObjectTypeId::new(7), 19)),
        );

        let encoded = encode_fields(&fields).unwrap();
        let decoded = decode_fields(&encoded).unwrap();
        assert_eq!(fields, decoded);
    }

    #[test]
    fn empty_map_roundtrip() {
        let fields = FieldMap::new();
        let encoded = encode_fields(&fields).unwrap();
        assert_eq!(decode_fields(&encoded).unwrap(), fields);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut encoded = encode_fields(&FieldMap::new()).unwrap();
        encoded.push(7);
        assert!(decode_fields(&encoded).is_err());
    }

    fn value_strategy() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            "[a-z0-9 .@-]{0,40}".prop_map(FieldValue::Text),
            any::<i64>().prop_map(FieldValue::Number),
            (any::<u16>(), any::<u32>()).prop_map(|(t, n)| {
                FieldValue::Reference(Invid::new(ObjectTypeId::new(t), n))
            }),
        ]
    }

    proptest! {
        #[test]
        fn arbitrary_maps_roundtrip(entries in prop::collection::btree_map(
            any::<u16>().prop_map(FieldId::new), value_strategy(), 0..16)) {
            let encoded = encode_fields(&entries).unwrap();
            prop_assert_eq!(decode_fields(&encoded).unwrap(), entries);
        }
    }
}
