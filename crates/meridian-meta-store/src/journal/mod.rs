//! Metadata journal
//!
//! The journal is the durable, totally ordered log of metadata changes.
//! Sequence ids are assigned by the single active writer, start at 1 and
//! have no gaps. Appends carry the writer's epoch; a store refuses appends
//! from an epoch older than the highest it has seen, which keeps a deposed
//! leader from writing after its successor started.

mod file;
mod memory;
pub mod record;
mod writer;

pub use file::FileJournal;
pub use memory::MemoryJournal;
pub use writer::{JournalWriter, WriterHandle};
pub(crate) use writer::WriterClient;

use crate::state::{OpCode, Operation};
use bytes::Bytes;
use meridian_common::{Epoch, Result, SequenceId};

/// One record of the journal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    /// Position in the journal
    pub sequence_id: SequenceId,
    /// Wire code of the operation
    pub op_code: u32,
    /// Leader wall-clock time when the entry was sequenced (unix ms)
    pub created_at: u64,
    /// Encoded operation body
    pub payload: Bytes,
}

impl JournalEntry {
    /// Encode `op` as the entry at `sequence_id`
    pub fn new(sequence_id: SequenceId, op: &Operation, created_at: u64) -> Result<Self> {
        Ok(Self {
            sequence_id,
            op_code: op.op_code().as_u32(),
            created_at,
            payload: Bytes::from(op.encode()?),
        })
    }

    /// Known operation code, if any
    #[must_use]
    pub fn code(&self) -> Option<OpCode> {
        OpCode::from_u32(self.op_code)
    }

    /// Decode the operation
    pub fn operation(&self) -> Result<Operation> {
        Operation::decode_entry(self.sequence_id, self.op_code, &self.payload)
    }
}

/// Durable, append-only storage for journal entries.
///
/// Implementations must make an append durable before returning `Ok`, and
/// must never expose a partially written entry. The methods are blocking;
/// async callers run them on the blocking pool.
pub trait JournalStore: Send + Sync {
    /// Append entries whose sequence ids continue the journal without gaps.
    ///
    /// `epoch` is the appender's fencing token. An epoch older than the
    /// store's fence fails with [`Error::Fenced`](meridian_common::Error::Fenced);
    /// a newer one raises the fence.
    fn append(&self, epoch: Epoch, entries: &[JournalEntry]) -> Result<()>;

    /// Stream entries in `[from, to]` in order. Stops at the first failing
    /// visit, corrupt record or gap. `to` is clamped to the last sequence.
    fn scan(
        &self,
        from: SequenceId,
        to: SequenceId,
        visit: &mut dyn FnMut(JournalEntry) -> Result<()>,
    ) -> Result<()>;

    /// Entries in `[from, to]`
    fn read(&self, from: SequenceId, to: SequenceId) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        self.scan(from, to, &mut |entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    /// Discard entries below `sequence`. Implementations may keep more than
    /// asked (e.g. a whole segment) but never less.
    fn truncate_before(&self, sequence: SequenceId) -> Result<()>;

    /// Drop every entry and continue the journal after `sequence`.
    /// Used when a checkpoint image replaces the local history.
    fn reset_to(&self, sequence: SequenceId) -> Result<()>;

    /// Lowest sequence id still available. Greater than
    /// [`last_sequence`](Self::last_sequence) when the journal is empty.
    fn first_sequence(&self) -> SequenceId;

    /// Highest durable sequence id, 0 if nothing was ever appended
    fn last_sequence(&self) -> SequenceId;

    /// Highest epoch that appended or was fenced in
    fn fence(&self) -> Epoch;

    /// Flush and fsync everything
    fn sync(&self) -> Result<()>;
}

/// Check that every payload fits a record
pub(crate) fn check_payload_limit(entries: &[JournalEntry]) -> Result<()> {
    match entries
        .iter()
        .find(|e| e.payload.len() > record::MAX_BODY_SIZE)
    {
        Some(entry) => Err(meridian_common::Error::invalid_operation(format!(
            "entry {} body of {} bytes exceeds the {} byte limit",
            entry.sequence_id,
            entry.payload.len(),
            record::MAX_BODY_SIZE
        ))),
        None => Ok(()),
    }
}

/// Check that `entries` continue a journal ending at `last`
pub(crate) fn check_contiguous(last: SequenceId, entries: &[JournalEntry]) -> Result<()> {
    use meridian_common::{ConsistencyKind, Error};

    let mut expected = last + 1;
    for entry in entries {
        if entry.sequence_id != expected {
            return Err(Error::consistency(
                entry.sequence_id,
                ConsistencyKind::SequenceGap {
                    expected,
                    found: entry.sequence_id,
                },
            ));
        }
        expected += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_operation() {
        let op = Operation::create_database("db");
        let entry = JournalEntry::new(4, &op, 99).unwrap();
        assert_eq!(entry.code(), Some(OpCode::CreateDatabase));
        assert_eq!(entry.operation().unwrap(), op);
    }

    #[test]
    fn test_check_contiguous() {
        let entries: Vec<_> = (5..8)
            .map(|seq| JournalEntry::new(seq, &Operation::Noop, 0).unwrap())
            .collect();
        assert!(check_contiguous(4, &entries).is_ok());
        assert!(check_contiguous(3, &entries).is_err());
        assert!(check_contiguous(4, &entries[1..]).is_err());
    }
}
