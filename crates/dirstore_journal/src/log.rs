//! Transaction log backends.
//!
//! A committed transaction is written as a run of records: a `Begin` marker,
//! one record per object mutation, and an `End` marker. Once the commit has
//! passed its point of no return a `Finalize` marker is appended. Recovery
//! replays finalized runs only; a run without its `Finalize` marker was
//! written by a commit that never completed and is discarded.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{JournalError, JournalResult};
use crate::record::{
    compute_crc32, JournalOp, JournalRecord, JournalRecordType, JOURNAL_MAGIC, JOURNAL_VERSION,
};
use crate::TransactionRecord;

/// Envelope header size: magic (4) + version (2) + type (1) + length (4).
const HEADER_SIZE: usize = 11;

/// Opaque handle to a written but not yet finalized transaction run.
#[derive(Debug, Clone, Copy)]
pub struct JournalHandle {
    txid: u64,
    start_offset: u64,
}

impl JournalHandle {
    /// Transaction id this handle refers to.
    #[must_use]
    pub fn txid(&self) -> u64 {
        self.txid
    }

    /// Byte offset at which the run starts.
    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }
}

/// A transaction run found in the journal during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredTransaction {
    /// Transaction id.
    pub txid: u64,
    /// Transaction description, as recorded at commit time.
    pub description: String,
    /// Object mutations, in the order they were journaled.
    pub ops: Vec<JournalOp>,
    /// Whether the run carries its finalize marker. Only finalized
    /// runs are safe to replay.
    pub finalized: bool,
}

/// Durable transaction log.
///
/// Implementations must serialize calls internally; the caller may share one
/// log between threads. `write` + `finalize` form the two-phase protocol:
/// a run that fails between the two can be backed out with `undo`.
pub trait TransactionLog: Send + Sync {
    /// Appends a full transaction run (begin marker, ops, end marker) and
    /// makes it durable. The run is not yet considered committed.
    fn write(&self, record: &TransactionRecord) -> JournalResult<JournalHandle>;

    /// Appends the finalize marker for a previously written run. After this
    /// returns the transaction will be replayed by recovery.
    fn finalize(&self, handle: &JournalHandle) -> JournalResult<()>;

    /// Removes a written but unfinalized run by truncating the log back to
    /// the run's start offset.
    fn undo(&self, handle: &JournalHandle) -> JournalResult<()>;

    /// Scans the log, returning every cleanly parsed run in write order
    /// and truncating everything past the last finalized run.
    fn recover(&self) -> JournalResult<Vec<RecoveredTransaction>>;
}

/// Frames a record with the envelope: magic, version, type byte, payload
/// length, payload, CRC32 of everything preceding the checksum.
fn encode_record(record: &JournalRecord) -> JournalResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| JournalError::PayloadTooLarge { len: payload.len() })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&JOURNAL_MAGIC);
    buf.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    buf.push(record.record_type().as_byte());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Encodes a transaction run: begin marker, one record per op, end marker.
fn encode_run(record: &TransactionRecord) -> JournalResult<Vec<u8>> {
    let mut buf = encode_record(&JournalRecord::Begin {
        txid: record.txid,
        description: record.description.clone(),
    })?;
    for op in &record.ops {
        buf.extend_from_slice(&encode_record(&JournalRecord::Op {
            txid: record.txid,
            op: op.clone(),
        })?);
    }
    buf.extend_from_slice(&encode_record(&JournalRecord::End { txid: record.txid })?);
    Ok(buf)
}

/// Decodes one record starting at `offset` within `buf`.
///
/// Returns the record and the offset just past it, or `None` if the buffer
/// ends cleanly at `offset`.
fn decode_record_at(buf: &[u8], offset: u64) -> JournalResult<Option<(JournalRecord, u64)>> {
    let start = offset as usize;
    if start == buf.len() {
        return Ok(None);
    }
    if start + HEADER_SIZE > buf.len() {
        return Err(JournalError::corruption(offset, "truncated record header"));
    }

    if buf[start..start + 4] != JOURNAL_MAGIC {
        return Err(JournalError::corruption(offset, "bad magic"));
    }
    let version = u16::from_le_bytes([buf[start + 4], buf[start + 5]]);
    if version != JOURNAL_VERSION {
        return Err(JournalError::corruption(
            offset,
            format!("unsupported journal version {version}"),
        ));
    }
    let record_type = JournalRecordType::from_byte(buf[start + 6]).ok_or_else(|| {
        JournalError::corruption(offset, format!("unknown record type {}", buf[start + 6]))
    })?;
    let len = u32::from_le_bytes([
        buf[start + 7],
        buf[start + 8],
        buf[start + 9],
        buf[start + 10],
    ]) as usize;

    let payload_start = start + HEADER_SIZE;
    let crc_start = payload_start + len;
    let end = crc_start + 4;
    if end > buf.len() {
        return Err(JournalError::corruption(offset, "truncated record body"));
    }

    let stored_crc = u32::from_le_bytes([
        buf[crc_start],
        buf[crc_start + 1],
        buf[crc_start + 2],
        buf[crc_start + 3],
    ]);
    let computed = compute_crc32(&buf[start..crc_start]);
    if stored_crc != computed {
        return Err(JournalError::corruption(offset, "checksum mismatch"));
    }

    let record =
        JournalRecord::decode_payload(record_type, &buf[payload_start..crc_start], offset)?;
    Ok(Some((record, end as u64)))
}

/// Scans `buf` into recovered transactions.
///
/// Returns the runs in write order and the byte length of the finalized
/// prefix. Anything past that prefix belongs to a commit that never
/// completed: a run missing its finalize or end marker, a partially
/// written record, or garbage. Such a run is still returned (flagged
/// unfinalized) when it parsed cleanly, but the caller truncates it.
fn scan_runs(buf: &[u8]) -> (Vec<RecoveredTransaction>, u64) {
    let mut runs: Vec<RecoveredTransaction> = Vec::new();
    let mut clean_len = 0u64;
    let mut offset = 0u64;

    // The run currently being assembled, with the offset of its Begin marker.
    let mut current: Option<(u64, RecoveredTransaction)> = None;

    loop {
        let (record, next) = match decode_record_at(buf, offset) {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(err) => {
                warn!(offset, %err, "journal tail unreadable, discarding");
                break;
            }
        };

        match record {
            JournalRecord::Begin { txid, description } => {
                if let Some((start, _)) = current.take() {
                    warn!(
                        offset = start,
                        "transaction run without end marker, discarding"
                    );
                }
                current = Some((
                    offset,
                    RecoveredTransaction {
                        txid,
                        description,
                        ops: Vec::new(),
                        finalized: false,
                    },
                ));
            }

            JournalRecord::Op { txid, op } => match &mut current {
                Some((_, run)) if run.txid == txid => run.ops.push(op),
                _ => {
                    warn!(offset, txid, "orphaned op record, discarding tail");
                    break;
                }
            },

            JournalRecord::End { txid } => match current.take() {
                Some((_, run)) if run.txid == txid => {
                    runs.push(run);
                }
                _ => {
                    warn!(offset, txid, "orphaned end marker, discarding tail");
                    break;
                }
            },

            JournalRecord::Finalize { txid } => {
                match runs.iter_mut().rev().find(|run| run.txid == txid) {
                    Some(run) if current.is_none() => {
                        run.finalized = true;
                        clean_len = next;
                    }
                    _ => {
                        warn!(offset, txid, "orphaned finalize marker, discarding tail");
                        break;
                    }
                }
            }
        }

        offset = next;
    }

    if let Some((start, run)) = current {
        debug!(
            offset = start,
            txid = run.txid,
            "incomplete transaction run at journal tail, discarding"
        );
    }

    (runs, clean_len)
}

/// In-memory transaction log, used for tests and ephemeral stores.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    buf: Mutex<Vec<u8>>,
}

impl MemoryJournal {
    /// Creates an empty in-memory journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionLog for MemoryJournal {
    fn write(&self, record: &TransactionRecord) -> JournalResult<JournalHandle> {
        let run = encode_run(record)?;
        let mut buf = self.buf.lock();
        let start_offset = buf.len() as u64;
        buf.extend_from_slice(&run);
        Ok(JournalHandle {
            txid: record.txid,
            start_offset,
        })
    }

    fn finalize(&self, handle: &JournalHandle) -> JournalResult<()> {
        let marker = encode_record(&JournalRecord::Finalize {
            txid: handle.txid,
        })?;
        let mut buf = self.buf.lock();
        if handle.start_offset > buf.len() as u64 {
            return Err(JournalError::UnknownHandle { txid: handle.txid });
        }
        buf.extend_from_slice(&marker);
        Ok(())
    }

    fn undo(&self, handle: &JournalHandle) -> JournalResult<()> {
        let mut buf = self.buf.lock();
        if handle.start_offset > buf.len() as u64 {
            return Err(JournalError::UnknownHandle { txid: handle.txid });
        }
        buf.truncate(handle.start_offset as usize);
        Ok(())
    }

    fn recover(&self) -> JournalResult<Vec<RecoveredTransaction>> {
        let mut buf = self.buf.lock();
        let (runs, clean_len) = scan_runs(&buf);
        buf.truncate(clean_len as usize);
        Ok(runs)
    }
}

struct FileState {
    file: File,
    len: u64,
}

/// File-backed transaction log with an exclusive advisory lock.
pub struct FileJournal {
    state: Mutex<FileState>,
}

impl FileJournal {
    /// Opens (creating if absent) the journal at `path`, taking an exclusive
    /// lock so only one process writes it at a time.
    pub fn open(path: impl AsRef<Path>) -> JournalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.try_lock_exclusive()
            .map_err(|_| JournalError::Locked)?;
        let len = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), len, "journal opened");
        Ok(Self {
            state: Mutex::new(FileState { file, len }),
        })
    }

    fn append(state: &mut FileState, bytes: &[u8]) -> JournalResult<()> {
        state.file.seek(SeekFrom::Start(state.len))?;
        state.file.write_all(bytes)?;
        state.file.sync_data()?;
        state.len += bytes.len() as u64;
        Ok(())
    }
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal").finish_non_exhaustive()
    }
}

impl TransactionLog for FileJournal {
    fn write(&self, record: &TransactionRecord) -> JournalResult<JournalHandle> {
        let run = encode_run(record)?;
        let mut state = self.state.lock();
        let start_offset = state.len;
        Self::append(&mut state, &run)?;
        debug!(
            txid = record.txid,
            ops = record.ops.len(),
            start_offset,
            "transaction run written"
        );
        Ok(JournalHandle {
            txid: record.txid,
            start_offset,
        })
    }

    fn finalize(&self, handle: &JournalHandle) -> JournalResult<()> {
        let marker = encode_record(&JournalRecord::Finalize {
            txid: handle.txid,
        })?;
        let mut state = self.state.lock();
        if handle.start_offset > state.len {
            return Err(JournalError::UnknownHandle { txid: handle.txid });
        }
        Self::append(&mut state, &marker)?;
        Ok(())
    }

    fn undo(&self, handle: &JournalHandle) -> JournalResult<()> {
        let mut state = self.state.lock();
        if handle.start_offset > state.len {
            return Err(JournalError::UnknownHandle { txid: handle.txid });
        }
        state.file.set_len(handle.start_offset)?;
        state.file.sync_data()?;
        state.len = handle.start_offset;
        debug!(txid = handle.txid, offset = handle.start_offset, "run undone");
        Ok(())
    }

    fn recover(&self) -> JournalResult<Vec<RecoveredTransaction>> {
        let mut state = self.state.lock();
        let mut buf = Vec::with_capacity(state.len as usize);
        state.file.seek(SeekFrom::Start(0))?;
        state.file.read_to_end(&mut buf)?;

        let (runs, clean_len) = scan_runs(&buf);
        if clean_len < buf.len() as u64 {
            warn!(
                discarded = buf.len() as u64 - clean_len,
                "truncating incomplete journal tail"
            );
            state.file.set_len(clean_len)?;
            state.file.sync_data()?;
        }
        state.len = clean_len;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(txid: u64) -> TransactionRecord {
        TransactionRecord {
            txid,
            description: format!("txn {txid}"),
            ops: vec![
                JournalOp::Create {
                    type_id: 1,
                    num: 10,
                    payload: vec![1, 2, 3],
                },
                JournalOp::Delete { type_id: 2, num: 4 },
            ],
        }
    }

    #[test]
    fn memory_write_finalize_recover() {
        let journal = MemoryJournal::new();
        let handle = journal.write(&sample_record(1)).unwrap();
        journal.finalize(&handle).unwrap();

        let runs = journal.recover().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].finalized);
        assert_eq!(runs[0].txid, 1);
        assert_eq!(runs[0].ops.len(), 2);
    }

    #[test]
    fn unfinalized_run_is_not_replayable() {
        let journal = MemoryJournal::new();
        journal.write(&sample_record(1)).unwrap();

        let runs = journal.recover().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].finalized);

        // The unfinalized tail was truncated; a second scan sees nothing.
        assert!(journal.recover().unwrap().is_empty());
    }

    #[test]
    fn undo_removes_run() {
        let journal = MemoryJournal::new();
        let first = journal.write(&sample_record(1)).unwrap();
        journal.finalize(&first).unwrap();
        let second = journal.write(&sample_record(2)).unwrap();
        journal.undo(&second).unwrap();

        let runs = journal.recover().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].txid, 1);
    }

    #[test]
    fn file_journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.journal");

        {
            let journal = FileJournal::open(&path).unwrap();
            let h1 = journal.write(&sample_record(1)).unwrap();
            journal.finalize(&h1).unwrap();
            let h2 = journal.write(&sample_record(2)).unwrap();
            journal.finalize(&h2).unwrap();
        }

        let journal = FileJournal::open(&path).unwrap();
        let runs = journal.recover().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.finalized));
        assert_eq!(runs[0].txid, 1);
        assert_eq!(runs[1].txid, 2);
    }

    #[test]
    fn file_journal_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.journal");

        {
            let journal = FileJournal::open(&path).unwrap();
            let h1 = journal.write(&sample_record(1)).unwrap();
            journal.finalize(&h1).unwrap();
            journal.write(&sample_record(2)).unwrap();
        }

        // Simulate a crash mid-write by chopping bytes off the tail.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let journal = FileJournal::open(&path).unwrap();
        let runs = journal.recover().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].txid, 1);

        // Recovery truncated the torn run; a fresh write lands cleanly.
        let h3 = journal.write(&sample_record(3)).unwrap();
        journal.finalize(&h3).unwrap();
        let runs = journal.recover().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].txid, 3);
    }

    #[test]
    fn exclusive_lock_refuses_second_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.journal");

        let _journal = FileJournal::open(&path).unwrap();
        let second = FileJournal::open(&path);
        assert!(matches!(second, Err(JournalError::Locked)));
    }
}
