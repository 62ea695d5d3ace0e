//! Metadata store
//!
//! Holds the in-memory [`MetadataState`] and applies journal entries to it
//! strictly in sequence order. Readers take a shared lock and always see a
//! state that reflects exactly the entries up to some sequence id; apply
//! takes the exclusive lock for the duration of one entry.

mod entities;
mod keys;
mod model;
mod ops;

pub use entities::{
    Database, EntityKind, EntitySnapshot, Partition, Resource, Table, Transaction,
    TransactionStatus,
};
pub use keys::{EntityKey, Footprint};
pub use model::{MetadataState, StateStats};
pub use ops::*;

use crate::journal::JournalEntry;
use meridian_common::{ConsistencyKind, Error, Result, SequenceId};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

/// Result of applying one entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The entry changed the state
    Applied,
    /// The entry was at or below `last_applied` and was ignored
    Duplicate,
    /// The entry failed to apply and the replay policy skipped it
    Skipped,
}

/// The applied metadata state of this node
pub struct MetadataStore {
    state: RwLock<MetadataState>,
    /// Publishes `last_applied` after every change
    applied: watch::Sender<SequenceId>,
}

impl MetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::from_state(MetadataState::default())
    }

    /// Start from a recovered state
    #[must_use]
    pub fn from_state(state: MetadataState) -> Self {
        let (applied, _) = watch::channel(state.last_applied());
        Self {
            state: RwLock::new(state),
            applied,
        }
    }

    #[must_use]
    pub fn last_applied(&self) -> SequenceId {
        self.state.read().last_applied()
    }

    /// Watch `last_applied` advance
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SequenceId> {
        self.applied.subscribe()
    }

    fn check_order(state: &MetadataState, entry: &JournalEntry) -> Result<Option<ApplyOutcome>> {
        let expected = state.last_applied() + 1;
        if entry.sequence_id < expected {
            return Ok(Some(ApplyOutcome::Duplicate));
        }
        if entry.sequence_id > expected {
            return Err(Error::consistency(
                entry.sequence_id,
                ConsistencyKind::SequenceGap {
                    expected,
                    found: entry.sequence_id,
                },
            ));
        }
        Ok(None)
    }

    /// Apply one entry.
    ///
    /// Entries at or below `last_applied` are ignored, so redelivery is
    /// harmless. An entry beyond `last_applied + 1`, an undecodable entry
    /// or one that fails validation is a consistency violation and leaves
    /// the state untouched.
    pub fn apply(&self, entry: &JournalEntry) -> Result<ApplyOutcome> {
        let mut state = self.state.write();
        if let Some(outcome) = Self::check_order(&state, entry)? {
            return Ok(outcome);
        }

        let op = entry.operation()?;
        state
            .apply_operation(entry.sequence_id, entry.created_at, &op)
            .map_err(|reason| {
                Error::consistency(
                    entry.sequence_id,
                    ConsistencyKind::ApplyFailed {
                        op_code: entry.op_code,
                        reason,
                    },
                )
            })?;
        state.set_last_applied(entry.sequence_id);
        drop(state);

        trace!(
            "Applied entry {} ({})",
            entry.sequence_id,
            op.op_code().name()
        );
        self.applied.send_replace(entry.sequence_id);
        Ok(ApplyOutcome::Applied)
    }

    /// Advance past an entry without applying it
    pub fn skip(&self, entry: &JournalEntry) -> Result<ApplyOutcome> {
        let mut state = self.state.write();
        if let Some(outcome) = Self::check_order(&state, entry)? {
            return Ok(outcome);
        }
        state.set_last_applied(entry.sequence_id);
        drop(state);

        self.applied.send_replace(entry.sequence_id);
        Ok(ApplyOutcome::Skipped)
    }

    /// Check an operation against the current state
    pub fn validate(&self, op: &Operation) -> Result<()> {
        self.state.read().check(op).map_err(Error::InvalidOperation)
    }

    /// Keys `op` would read and write against the current state
    #[must_use]
    pub fn footprint(&self, op: &Operation) -> Footprint {
        Footprint::of(op, &self.state.read())
    }

    /// Owned copy of one entity as of the latest applied entry
    #[must_use]
    pub fn read_current(&self, kind: EntityKind, id: u64) -> Option<EntitySnapshot> {
        self.state.read().snapshot(kind, id)
    }

    /// Run a read-only closure against a consistent view of the state
    pub fn view<R>(&self, f: impl FnOnce(&MetadataState) -> R) -> R {
        f(&self.state.read())
    }

    /// Clone the whole state
    #[must_use]
    pub fn snapshot(&self) -> MetadataState {
        self.state.read().clone()
    }

    /// Replace the state wholesale, e.g. after installing a checkpoint image
    pub fn replace(&self, state: MetadataState) {
        let sequence = state.last_applied();
        *self.state.write() = state;
        self.applied.send_replace(sequence);
    }

    #[must_use]
    pub fn stats(&self) -> StateStats {
        self.state.read().stats()
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}
