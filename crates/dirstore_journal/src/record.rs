//! Journal record types and serialization.

use crate::error::{JournalError, JournalResult};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"DJNL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// One object mutation carried by a transaction.
///
/// Payloads are opaque to the journal; the core encodes an object's field
/// map into `payload` and decodes it again during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    /// A new object was created.
    Create {
        /// Object type (collection) id.
        type_id: u16,
        /// Object number within the collection.
        num: u32,
        /// Encoded field map of the new object.
        payload: Vec<u8>,
    },
    /// An existing object was replaced with an edited version.
    Edit {
        /// Object type (collection) id.
        type_id: u16,
        /// Object number within the collection.
        num: u32,
        /// Encoded field map of the edited object.
        payload: Vec<u8>,
    },
    /// An existing object was deleted.
    Delete {
        /// Object type (collection) id.
        type_id: u16,
        /// Object number within the collection.
        num: u32,
    },
}

/// The full description of one transaction, as handed to the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction id, unique for the life of the server process.
    pub txid: u64,
    /// Human-readable transaction description.
    pub description: String,
    /// Object mutations, in no particular order.
    pub ops: Vec<JournalOp>,
}

/// Type of an on-disk journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// Start of a transaction run.
    Begin = 1,
    /// Object creation.
    Create = 2,
    /// Object edit.
    Edit = 3,
    /// Object deletion.
    Delete = 4,
    /// End of a transaction run.
    End = 5,
    /// Finalize marker, written after the point of no return.
    Finalize = 6,
}

impl JournalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Create),
            3 => Some(Self::Edit),
            4 => Some(Self::Delete),
            5 => Some(Self::End),
            6 => Some(Self::Finalize),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single on-disk journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// Start of a transaction run.
    Begin {
        /// Transaction id.
        txid: u64,
        /// Transaction description.
        description: String,
    },
    /// One object mutation belonging to the transaction.
    Op {
        /// Transaction id.
        txid: u64,
        /// The mutation.
        op: JournalOp,
    },
    /// End of a transaction run. The run is durable but not yet final.
    End {
        /// Transaction id.
        txid: u64,
    },
    /// Finalize marker. A run followed by this marker must be replayed.
    Finalize {
        /// Transaction id.
        txid: u64,
    },
}

impl JournalRecord {
    /// Returns the on-disk record type.
    #[must_use]
    pub fn record_type(&self) -> JournalRecordType {
        match self {
            Self::Begin { .. } => JournalRecordType::Begin,
            Self::Op {
                op: JournalOp::Create { .. },
                ..
            } => JournalRecordType::Create,
            Self::Op {
                op: JournalOp::Edit { .. },
                ..
            } => JournalRecordType::Edit,
            Self::Op {
                op: JournalOp::Delete { .. },
                ..
            } => JournalRecordType::Delete,
            Self::End { .. } => JournalRecordType::End,
            Self::Finalize { .. } => JournalRecordType::Finalize,
        }
    }

    /// Returns the transaction id this record belongs to.
    #[must_use]
    pub fn txid(&self) -> u64 {
        match self {
            Self::Begin { txid, .. }
            | Self::Op { txid, .. }
            | Self::End { txid }
            | Self::Finalize { txid } => *txid,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> JournalResult<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            Self::Begin { txid, description } => {
                buf.extend_from_slice(&txid.to_le_bytes());
                let bytes = description.as_bytes();
                let len = u32::try_from(bytes.len())
                    .map_err(|_| JournalError::PayloadTooLarge { len: bytes.len() })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(bytes);
            }

            Self::Op { txid, op } => {
                buf.extend_from_slice(&txid.to_le_bytes());
                match op {
                    JournalOp::Create {
                        type_id,
                        num,
                        payload,
                    }
                    | JournalOp::Edit {
                        type_id,
                        num,
                        payload,
                    } => {
                        buf.extend_from_slice(&type_id.to_le_bytes());
                        buf.extend_from_slice(&num.to_le_bytes());
                        let len = u32::try_from(payload.len())
                            .map_err(|_| JournalError::PayloadTooLarge { len: payload.len() })?;
                        buf.extend_from_slice(&len.to_le_bytes());
                        buf.extend_from_slice(payload);
                    }
                    JournalOp::Delete { type_id, num } => {
                        buf.extend_from_slice(&type_id.to_le_bytes());
                        buf.extend_from_slice(&num.to_le_bytes());
                    }
                }
            }

            Self::End { txid } | Self::Finalize { txid } => {
                buf.extend_from_slice(&txid.to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// `offset` is only used for error reporting.
    pub fn decode_payload(
        record_type: JournalRecordType,
        payload: &[u8],
        offset: u64,
    ) -> JournalResult<Self> {
        let mut cursor = 0;

        let read_u64 = |cursor: &mut usize| -> JournalResult<u64> {
            let end = *cursor + 8;
            if end > payload.len() {
                return Err(JournalError::corruption(offset, "unexpected end of payload"));
            }
            let bytes: [u8; 8] = payload[*cursor..end]
                .try_into()
                .map_err(|_| JournalError::corruption(offset, "invalid u64"))?;
            *cursor = end;
            Ok(u64::from_le_bytes(bytes))
        };

        let read_u32 = |cursor: &mut usize| -> JournalResult<u32> {
            let end = *cursor + 4;
            if end > payload.len() {
                return Err(JournalError::corruption(offset, "unexpected end of payload"));
            }
            let bytes: [u8; 4] = payload[*cursor..end]
                .try_into()
                .map_err(|_| JournalError::corruption(offset, "invalid u32"))?;
            *cursor = end;
            Ok(u32::from_le_bytes(bytes))
        };

        let read_u16 = |cursor: &mut usize| -> JournalResult<u16> {
            let end = *cursor + 2;
            if end > payload.len() {
                return Err(JournalError::corruption(offset, "unexpected end of payload"));
            }
            let bytes: [u8; 2] = payload[*cursor..end]
                .try_into()
                .map_err(|_| JournalError::corruption(offset, "invalid u16"))?;
            *cursor = end;
            Ok(u16::from_le_bytes(bytes))
        };

        let read_bytes = |cursor: &mut usize, len: usize| -> JournalResult<Vec<u8>> {
            let end = *cursor + len;
            if end > payload.len() {
                return Err(JournalError::corruption(offset, "unexpected end of payload"));
            }
            let out = payload[*cursor..end].to_vec();
            *cursor = end;
            Ok(out)
        };

        let record = match record_type {
            JournalRecordType::Begin => {
                let txid = read_u64(&mut cursor)?;
                let len = read_u32(&mut cursor)? as usize;
                let bytes = read_bytes(&mut cursor, len)?;
                let description = String::from_utf8(bytes)
                    .map_err(|_| JournalError::corruption(offset, "description not UTF-8"))?;
                Self::Begin { txid, description }
            }

            JournalRecordType::Create | JournalRecordType::Edit => {
                let txid = read_u64(&mut cursor)?;
                let type_id = read_u16(&mut cursor)?;
                let num = read_u32(&mut cursor)?;
                let len = read_u32(&mut cursor)? as usize;
                let data = read_bytes(&mut cursor, len)?;
                let op = if record_type == JournalRecordType::Create {
                    JournalOp::Create {
                        type_id,
                        num,
                        payload: data,
                    }
                } else {
                    JournalOp::Edit {
                        type_id,
                        num,
                        payload: data,
                    }
                };
                Self::Op { txid, op }
            }

            JournalRecordType::Delete => {
                let txid = read_u64(&mut cursor)?;
                let type_id = read_u16(&mut cursor)?;
                let num = read_u32(&mut cursor)?;
                Self::Op {
                    txid,
                    op: JournalOp::Delete { type_id, num },
                }
            }

            JournalRecordType::End => Self::End {
                txid: read_u64(&mut cursor)?,
            },

            JournalRecordType::Finalize => Self::Finalize {
                txid: read_u64(&mut cursor)?,
            },
        };

        if cursor != payload.len() {
            return Err(JournalError::corruption(
                offset,
                format!(
                    "trailing bytes in {:?} record: expected {} bytes, got {}",
                    record_type,
                    cursor,
                    payload.len()
                ),
            ));
        }

        Ok(record)
    }
}

/// Computes the CRC32 (IEEE polynomial) of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn record_type_roundtrip() {
        for t in [
            JournalRecordType::Begin,
            JournalRecordType::Create,
            JournalRecordType::Edit,
            JournalRecordType::Delete,
            JournalRecordType::End,
            JournalRecordType::Finalize,
        ] {
            assert_eq!(JournalRecordType::from_byte(t.as_byte()), Some(t));
        }
    }

    #[test]
    fn begin_record_roundtrip() {
        let record = JournalRecord::Begin {
            txid: 42,
            description: "nightly batch load".into(),
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            JournalRecord::decode_payload(JournalRecordType::Begin, &payload, 0).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn create_record_roundtrip() {
        let record = JournalRecord::Op {
            txid: 7,
            op: JournalOp::Create {
                type_id: 3,
                num: 101,
                payload: vec![0xCA, 0xFE, 0xBA, 0xBE],
            },
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            JournalRecord::decode_payload(JournalRecordType::Create, &payload, 0).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn delete_record_roundtrip() {
        let record = JournalRecord::Op {
            txid: 9,
            op: JournalOp::Delete {
                type_id: 1,
                num: 55,
            },
        };
        let payload = record.encode_payload().unwrap();
        let decoded =
            JournalRecord::decode_payload(JournalRecordType::Delete, &payload, 0).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn finalize_record_roundtrip() {
        let record = JournalRecord::Finalize { txid: 8 };
        let payload = record.encode_payload().unwrap();
        let decoded =
            JournalRecord::decode_payload(JournalRecordType::Finalize, &payload, 0).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let record = JournalRecord::End { txid: 1 };
        let mut payload = record.encode_payload().unwrap();
        payload.push(0);
        let err = JournalRecord::decode_payload(JournalRecordType::End, &payload, 0);
        assert!(err.is_err());
    }

    #[test]
    fn crc32_known_value() {
        // Known test vector: "123456789" should give 0xCBF43926
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    proptest! {
        #[test]
        fn edit_record_roundtrip(txid in any::<u64>(), type_id in any::<u16>(),
                                 num in any::<u32>(), data in prop::collection::vec(any::<u8>(), 0..512)) {
            let record = JournalRecord::Op {
                txid,
                op: JournalOp::Edit { type_id, num, payload: data },
            };
            let payload = record.encode_payload().unwrap();
            let decoded = JournalRecord::decode_payload(JournalRecordType::Edit, &payload, 0).unwrap();
            prop_assert_eq!(record, decoded);
        }
    }
}
