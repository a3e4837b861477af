//! Journal replay at store open.

use std::collections::HashMap;

use dirstore_journal::{JournalOp, TransactionLog};
use tracing::{debug, warn};

use crate::error::CoreResult;
use crate::object::{ObjectBase, ObjectSnapshot};
use crate::types::{Invid, ObjectTypeId, TransactionId};
use crate::value::decode_fields;

/// Replays finalized journal runs into the bases, in write order.
///
/// Runs without their finalize marker belong to commits that never
/// completed; the journal's own recovery scan has already discarded them.
/// Ops naming an unconfigured type are skipped with a warning so a store
/// whose schema dropped a type can still open.
///
/// Returns the number of transactions replayed.
pub(crate) fn replay(
    journal: &dyn TransactionLog,
    bases: &HashMap<ObjectTypeId, ObjectBase>,
) -> CoreResult<usize> {
    let runs = journal.recover()?;
    let mut replayed = 0;

    for run in runs {
        if !run.finalized {
            debug!(txid = run.txid, "skipping unfinalized journal run");
            continue;
        }
        let txid = TransactionId::new(run.txid);
        for op in &run.ops {
            match op {
                JournalOp::Create { type_id, num, payload }
                | JournalOp::Edit { type_id, num, payload } => {
                    let type_id = ObjectTypeId::new(*type_id);
                    let Some(base) = bases.get(&type_id) else {
                        warn!(%type_id, num, "journal names unconfigured type, skipping");
                        continue;
                    };
                    let fields = decode_fields(payload)?;
                    let invid = Invid::new(type_id, *num);
                    base.ensure_num_allocated(*num);
                    base.put(ObjectSnapshot::new(invid, fields), txid);
                }
                JournalOp::Delete { type_id, num } => {
                    let type_id = ObjectTypeId::new(*type_id);
                    let Some(base) = bases.get(&type_id) else {
                        warn!(%type_id, num, "journal names unconfigured type, skipping");
                        continue;
                    };
                    base.remove(*num, txid);
                }
            }
        }
        replayed += 1;
    }

    if replayed > 0 {
        debug!(transactions = replayed, "journal replay complete");
    }
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirstore_journal::{MemoryJournal, TransactionRecord};
    use crate::schema::TypeDef;
    use crate::value::{encode_fields, FieldMap, FieldValue};
    use crate::types::FieldId;

    fn bases() -> HashMap<ObjectTypeId, ObjectBase> {
        let def = TypeDef::new(ObjectTypeId::new(1), "user", vec![]);
        HashMap::from([(def.id, ObjectBase::new(def))])
    }

    fn payload(name: &str) -> Vec<u8> {
        let mut fields = FieldMap::new();
        fields.insert(FieldId::new(1), FieldValue::Text(name.into()));
        encode_fields(&fields).unwrap()
    }

    #[test]
    fn finalized_runs_replay_in_order() {
        let journal = MemoryJournal::new();
        let h = journal
            .write(&TransactionRecord {
                txid: 1,
                description: "create".into(),
                ops: vec![JournalOp::Create {
                    type_id: 1,
                    num: 0,
                    payload: payload("ada"),
                }],
            })
            .unwrap();
        journal.finalize(&h).unwrap();
        let h = journal
            .write(&TransactionRecord {
                txid: 2,
                description: "edit".into(),
                ops: vec![JournalOp::Edit {
                    type_id: 1,
                    num: 0,
                    payload: payload("grace"),
                }],
            })
            .unwrap();
        journal.finalize(&h).unwrap();

        let bases = bases();
        assert_eq!(replay(&journal, &bases).unwrap(), 2);

        let snapshot = bases[&ObjectTypeId::new(1)].view(0).unwrap();
        assert_eq!(
            snapshot.field(FieldId::new(1)),
            Some(&FieldValue::Text("grace".into()))
        );
        // The replayed number is past the allocation watermark.
        assert_eq!(bases[&ObjectTypeId::new(1)].allocate_num(), 1);
    }

    #[test]
    fn unfinalized_run_is_skipped() {
        let journal = MemoryJournal::new();
        journal
            .write(&TransactionRecord {
                txid: 1,
                description: "create".into(),
                ops: vec![JournalOp::Create {
                    type_id: 1,
                    num: 0,
                    payload: payload("ada"),
                }],
            })
            .unwrap();

        let bases = bases();
        assert_eq!(replay(&journal, &bases).unwrap(), 0);
        assert!(bases[&ObjectTypeId::new(1)].view(0).is_none());
    }

    #[test]
    fn delete_removes_replayed_object() {
        let journal = MemoryJournal::new();
        let h = journal
            .write(&TransactionRecord {
                txid: 1,
                description: "create".into(),
                ops: vec![JournalOp::Create {
                    type_id: 1,
                    num: 3,
                    payload: payload("ada"),
                }],
            })
            .unwrap();
        journal.finalize(&h).unwrap();
        let h = journal
            .write(&TransactionRecord {
                txid: 2,
                description: "delete".into(),
                ops: vec![JournalOp::Delete { type_id: 1, num: 3 }],
            })
            .unwrap();
        journal.finalize(&h).unwrap();

        let bases = bases();
        replay(&journal, &bases).unwrap();
        assert!(bases[&ObjectTypeId::new(1)].view(3).is_none());
    }
}
