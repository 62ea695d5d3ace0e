//! In-memory journal
//!
//! Keeps encoded records so reads go through the same codec and checksum
//! verification as the file journal. Used by tests and by nodes that share
//! one journal in-process. Failures can be injected to exercise the
//! durability and corruption paths.

use super::record::{decode_record, encode_record};
use super::{JournalEntry, JournalStore, check_contiguous, check_payload_limit};
use meridian_common::{Epoch, Error, Result, SequenceId};
use parking_lot::RwLock;
use std::collections::VecDeque;

#[derive(Default)]
struct Inner {
    /// Sequence id of `records[0]`
    first: SequenceId,
    records: VecDeque<Vec<u8>>,
    fence: Epoch,
    fail_appends: Option<String>,
}

impl Inner {
    fn last(&self) -> SequenceId {
        self.first + self.records.len() as u64 - 1
    }
}

/// Journal held in memory
pub struct MemoryJournal {
    inner: RwLock<Inner>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                first: 1,
                ..Inner::default()
            }),
        }
    }

    /// Make every following append fail with a durability error
    pub fn fail_appends(&self, reason: impl Into<String>) {
        self.inner.write().fail_appends = Some(reason.into());
    }

    /// Let appends succeed again
    pub fn heal(&self) {
        self.inner.write().fail_appends = None;
    }

    /// Flip a payload byte of the record at `sequence`, so its checksum no
    /// longer matches. Returns false if the record is not held.
    pub fn corrupt(&self, sequence: SequenceId) -> bool {
        let mut inner = self.inner.write();
        let Some(index) = sequence.checked_sub(inner.first) else {
            return false;
        };
        match usize::try_from(index)
            .ok()
            .and_then(|i| inner.records.get_mut(i))
        {
            Some(record) if record.len() > 20 => {
                record[20] ^= 0xFF;
                true
            }
            _ => false,
        }
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalStore for MemoryJournal {
    fn append(&self, epoch: Epoch, entries: &[JournalEntry]) -> Result<()> {
        let mut inner = self.inner.write();
        if epoch < inner.fence {
            return Err(Error::Fenced {
                epoch,
                fence: inner.fence,
            });
        }
        if let Some(reason) = &inner.fail_appends {
            return Err(Error::durability(inner.last() + 1, reason));
        }
        check_payload_limit(entries)?;
        check_contiguous(inner.last(), entries)?;

        inner.fence = epoch;
        for entry in entries {
            let mut buf = Vec::new();
            encode_record(entry, &mut buf);
            inner.records.push_back(buf);
        }
        Ok(())
    }

    fn scan(
        &self,
        from: SequenceId,
        to: SequenceId,
        visit: &mut dyn FnMut(JournalEntry) -> Result<()>,
    ) -> Result<()> {
        // Decode under the lock, visit outside it
        let entries = {
            let inner = self.inner.read();
            if from < inner.first {
                return Err(Error::JournalTruncated {
                    first_available: inner.first,
                });
            }
            let to = to.min(inner.last());
            let mut entries = Vec::new();
            let mut failure = None;
            for sequence in from..=to {
                let Ok(index) = usize::try_from(sequence - inner.first) else {
                    break;
                };
                match decode_record(&inner.records[index]) {
                    Ok((entry, _)) => entries.push(entry),
                    Err(e) => {
                        failure = Some(e.into_error(sequence));
                        break;
                    }
                }
            }
            (entries, failure)
        };

        let (entries, failure) = entries;
        for entry in entries {
            visit(entry)?;
        }
        failure.map_or(Ok(()), Err)
    }

    fn truncate_before(&self, sequence: SequenceId) -> Result<()> {
        let mut inner = self.inner.write();
        while inner.first < sequence && !inner.records.is_empty() {
            inner.records.pop_front();
            inner.first += 1;
        }
        Ok(())
    }

    fn reset_to(&self, sequence: SequenceId) -> Result<()> {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.first = sequence + 1;
        Ok(())
    }

    fn first_sequence(&self) -> SequenceId {
        self.inner.read().first
    }

    fn last_sequence(&self) -> SequenceId {
        self.inner.read().last()
    }

    fn fence(&self) -> Epoch {
        self.inner.read().fence
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Operation;
    use meridian_common::ConsistencyKind;

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<JournalEntry> {
        range
            .map(|seq| JournalEntry::new(seq, &Operation::create_table(1, format!("t{seq}")), 0).unwrap())
            .collect()
    }

    #[test]
    fn test_append_read_truncate() {
        let journal = MemoryJournal::new();
        assert_eq!(journal.last_sequence(), 0);
        journal.append(1, &entries(1..=10)).unwrap();
        assert_eq!(journal.read(3, 5).unwrap(), entries(3..=5));

        journal.truncate_before(6).unwrap();
        assert_eq!(journal.first_sequence(), 6);
        assert!(matches!(
            journal.read(5, 6),
            Err(Error::JournalTruncated { first_available: 6 })
        ));
        assert_eq!(journal.read(6, 100).unwrap(), entries(6..=10));
    }

    #[test]
    fn test_fencing() {
        let journal = MemoryJournal::new();
        journal.append(2, &entries(1..=1)).unwrap();
        assert!(matches!(
            journal.append(1, &entries(2..=2)),
            Err(Error::Fenced { epoch: 1, fence: 2 })
        ));
        assert_eq!(journal.last_sequence(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let journal = MemoryJournal::new();
        journal.append(1, &entries(1..=3)).unwrap();

        journal.fail_appends("disk full");
        assert!(matches!(
            journal.append(1, &entries(4..=4)),
            Err(Error::Durability { sequence: 4, .. })
        ));
        journal.heal();
        journal.append(1, &entries(4..=4)).unwrap();

        assert!(journal.corrupt(2));
        let mut seen = Vec::new();
        let err = journal
            .scan(1, 4, &mut |e| {
                seen.push(e.sequence_id);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(seen, vec![1]);
        assert!(matches!(
            err,
            Error::Consistency {
                sequence: 2,
                kind: ConsistencyKind::ChecksumMismatch
            }
        ));
    }

    #[test]
    fn test_reset_to() {
        let journal = MemoryJournal::new();
        journal.append(1, &entries(1..=3)).unwrap();
        journal.reset_to(50).unwrap();
        assert_eq!(journal.first_sequence(), 51);
        assert_eq!(journal.last_sequence(), 50);
        journal.append(1, &entries(51..=51)).unwrap();
    }
}
