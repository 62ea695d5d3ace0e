//! Journal replay
//!
//! Brings the metadata store up to date with a journal: the local one at
//! startup (recovery), or the leader's while following (catch-up). Entries
//! are applied strictly in sequence order. The first entry that cannot be
//! read or applied stops replay; the node must not serve state past a hole.
//!
//! Operators can list operation codes whose apply failures are tolerated.
//! Such entries are skipped but still advance the applied position, so
//! every replica skips the same entries.

use crate::checkpoint::CheckpointManager;
use crate::journal::{JournalEntry, JournalStore, check_contiguous};
use crate::metric_definitions::{
    REPLAY_ENTRIES, REPLAY_SKIPPED, REPLICATION_IMAGES_INSTALLED, REPLICATION_PULL_ERRORS,
    REPLICATION_PULLS,
};
use crate::role::NodeEvent;
use crate::state::{ApplyOutcome, MetadataStore, OpCode};
use crate::task::cancelled;
use crate::transport::ReplicationSource;
use meridian_common::config::{ReplayConfig, ReplicationConfig};
use meridian_common::{ConsistencyKind, Epoch, Error, LeaderInfo, Result, SequenceId};
use metrics::counter;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Which apply failures replay tolerates
#[derive(Clone, Debug, Default)]
pub struct ReplayPolicy {
    skip_op_codes: BTreeSet<u32>,
}

impl ReplayPolicy {
    /// Tolerate nothing
    #[must_use]
    pub fn strict() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            skip_op_codes: config.skip_op_codes.iter().copied().collect(),
        }
    }

    /// Also tolerate failures of `code`
    #[must_use]
    pub fn skipping(mut self, code: OpCode) -> Self {
        self.skip_op_codes.insert(code.as_u32());
        self
    }

    #[must_use]
    pub fn skips(&self, op_code: u32) -> bool {
        self.skip_op_codes.contains(&op_code)
    }
}

/// Counts from one replay run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: u64,
    pub skipped: u64,
    pub duplicates: u64,
    /// Store position when the run ended
    pub last_applied: SequenceId,
}

impl ReplayStats {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Skipped => self.skipped += 1,
            ApplyOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

/// Applies journal entries to the store
pub struct Replayer {
    journal: Arc<dyn JournalStore>,
    store: Arc<MetadataStore>,
    policy: ReplayPolicy,
}

impl Replayer {
    #[must_use]
    pub fn new(
        journal: Arc<dyn JournalStore>,
        store: Arc<MetadataStore>,
        policy: ReplayPolicy,
    ) -> Self {
        Self {
            journal,
            store,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &ReplayPolicy {
        &self.policy
    }

    /// Apply one entry, skipping it if the policy tolerates its failure.
    /// Gaps are never tolerated.
    pub fn apply_entry(&self, entry: &JournalEntry) -> Result<ApplyOutcome> {
        match self.store.apply(entry) {
            Err(Error::Consistency { sequence, kind })
                if self.policy.skips(entry.op_code)
                    && !matches!(kind, ConsistencyKind::SequenceGap { .. }) =>
            {
                warn!("Skipping entry {} by replay policy: {}", sequence, kind);
                counter!(REPLAY_SKIPPED).increment(1);
                self.store.skip(entry)
            }
            other => other,
        }
    }

    /// Apply the local journal in `[from, to]`
    pub fn replay(&self, from: SequenceId, to: SequenceId) -> Result<ReplayStats> {
        let started = std::time::Instant::now();
        let mut stats = ReplayStats::default();
        let result = self.journal.scan(from, to, &mut |entry| {
            let outcome = self.apply_entry(&entry)?;
            stats.record(outcome);
            Ok(())
        });
        stats.last_applied = self.store.last_applied();
        counter!(REPLAY_ENTRIES).increment(stats.applied + stats.skipped);

        match result {
            Ok(()) => {
                info!(
                    "Replayed {} entries ({} skipped) up to {} in {:?}",
                    stats.applied,
                    stats.skipped,
                    stats.last_applied,
                    started.elapsed()
                );
                Ok(stats)
            }
            Err(e) => {
                error!(
                    "Replay stopped after sequence {}: {}",
                    stats.last_applied, e
                );
                Err(e)
            }
        }
    }

    /// Apply every local entry past the store's position
    pub fn recover(&self) -> Result<ReplayStats> {
        let from = self.store.last_applied() + 1;
        let to = self.journal.last_sequence();
        if to < from {
            return Ok(ReplayStats {
                last_applied: self.store.last_applied(),
                ..ReplayStats::default()
            });
        }
        self.replay(from, to)
    }

    /// Persist entries pulled from the leader and apply them.
    ///
    /// Pulled entries that the local journal also holds must match the local
    /// copy exactly; a mismatch means this replica wrote history the leader
    /// never had, and nothing is applied. Entries the store already has are
    /// then dropped and the rest must continue the store without gaps.
    /// Entries already in the local journal (appended before a crash but not
    /// applied) are not appended twice.
    pub fn ingest(&self, epoch: Epoch, entries: Vec<JournalEntry>) -> Result<ReplayStats> {
        self.check_matches_local(&entries)?;
        let applied = self.store.last_applied();
        let entries: Vec<JournalEntry> = entries
            .into_iter()
            .filter(|e| e.sequence_id > applied)
            .collect();
        let mut stats = ReplayStats {
            last_applied: applied,
            ..ReplayStats::default()
        };
        if entries.is_empty() {
            return Ok(stats);
        }
        check_contiguous(applied, &entries)?;

        let local_last = self.journal.last_sequence();
        let new_from = entries.partition_point(|e| e.sequence_id <= local_last);
        if new_from < entries.len() {
            self.journal.append(epoch, &entries[new_from..])?;
        }

        for entry in &entries {
            let outcome = self.apply_entry(entry)?;
            stats.record(outcome);
        }
        stats.last_applied = self.store.last_applied();
        counter!(REPLAY_ENTRIES).increment(stats.applied + stats.skipped);
        debug!(
            "Ingested {} entries up to {}",
            entries.len(),
            stats.last_applied
        );
        Ok(stats)
    }

    fn check_matches_local(&self, entries: &[JournalEntry]) -> Result<()> {
        let held = self.journal.first_sequence()..=self.journal.last_sequence();
        let overlap: Vec<&JournalEntry> = entries
            .iter()
            .filter(|e| held.contains(&e.sequence_id))
            .collect();
        let (Some(low), Some(high)) = (overlap.first(), overlap.last()) else {
            return Ok(());
        };
        let local = self.journal.read(low.sequence_id, high.sequence_id)?;
        for &theirs in &overlap {
            let ours = usize::try_from(theirs.sequence_id - low.sequence_id)
                .ok()
                .and_then(|i| local.get(i))
                .filter(|e| e.sequence_id == theirs.sequence_id);
            if ours != Some(theirs) {
                error!(
                    "Local entry {} differs from the leader's copy",
                    theirs.sequence_id
                );
                return Err(Error::consistency(
                    theirs.sequence_id,
                    ConsistencyKind::Diverged,
                ));
            }
        }
        Ok(())
    }

    /// Replace local history with a leader's checkpoint image
    pub fn install_image(&self, checkpoints: &CheckpointManager, bytes: &[u8]) -> Result<SequenceId> {
        let (header, state) = checkpoints.install(bytes)?;
        let up_to = header.up_to_sequence;
        if up_to <= self.store.last_applied() {
            return Ok(self.store.last_applied());
        }
        self.journal.reset_to(up_to)?;
        self.store.replace(state);
        counter!(REPLICATION_IMAGES_INSTALLED).increment(1);
        info!("Installed leader image up to {}", up_to);
        Ok(up_to)
    }
}

/// Ingest a pulled batch on the blocking pool
async fn ingest(replayer: &Arc<Replayer>, epoch: Epoch, entries: Vec<JournalEntry>) -> Result<ReplayStats> {
    let replayer = Arc::clone(replayer);
    tokio::task::spawn_blocking(move || replayer.ingest(epoch, entries))
        .await
        .map_err(|e| Error::internal(format!("ingest task failed: {e}")))?
}

/// Pull everything `source` has until it returns an empty batch or
/// `timeout` passes. Used by a new leader to collect its predecessor's
/// durable tail before it starts writing.
pub(crate) async fn drain(
    replayer: &Arc<Replayer>,
    source: &dyn ReplicationSource,
    epoch: Epoch,
    max_entries: usize,
    timeout: Duration,
) -> Result<u64> {
    let deadline = Instant::now() + timeout;
    let mut drained = 0;
    let mut tip_checked = false;
    loop {
        let applied = replayer.store.last_applied();
        let from = pull_from(applied, tip_checked);
        let pulled = tokio::time::timeout_at(
            deadline,
            source.pull_entries(from, max_entries, Duration::ZERO),
        )
        .await;
        let entries = match pulled {
            Ok(Ok(entries)) => entries,
            Ok(Err(Error::JournalTruncated { first_available }))
                if !tip_checked && first_available == applied + 1 =>
            {
                tip_checked = true;
                continue;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Draining the previous leader timed out after {} entries", drained);
                return Ok(drained);
            }
        };
        if entries.is_empty() {
            return Ok(drained);
        }
        drained += ingest(replayer, epoch, entries).await?.applied;
        tip_checked = true;
    }
}

/// Where the next pull starts. Until the source has confirmed the entry at
/// `applied`, pulls start there so [`Replayer::ingest`] can compare it with
/// the local copy.
const fn pull_from(applied: SequenceId, tip_checked: bool) -> SequenceId {
    if tip_checked || applied == 0 {
        applied + 1
    } else {
        applied
    }
}

/// Follower loop pulling from the leader
pub(crate) struct CatchUp {
    pub replayer: Arc<Replayer>,
    pub checkpoints: Arc<CheckpointManager>,
    pub source: Arc<dyn ReplicationSource>,
    pub leader: LeaderInfo,
    pub config: ReplicationConfig,
    pub events: mpsc::UnboundedSender<NodeEvent>,
}

impl CatchUp {
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let initial = Duration::from_millis(self.config.retry_initial_ms.max(1));
        let max_backoff = Duration::from_millis(self.config.retry_max_ms).max(initial);
        let mut backoff = initial;
        let mut tip_checked = false;
        info!(
            "Following {} in epoch {} from {}",
            self.leader.node,
            self.leader.epoch,
            self.replayer.store.last_applied() + 1
        );

        loop {
            let applied = self.replayer.store.last_applied();
            let from = pull_from(applied, tip_checked);
            let pulled = tokio::select! {
                () = cancelled(&mut shutdown) => break,
                r = self.source.pull_entries(from, self.config.max_batch_entries, self.config.poll_wait()) => r,
            };
            counter!(REPLICATION_PULLS).increment(1);

            // Once pulled, a batch is always ingested completely
            let result = match pulled {
                Ok(entries) if entries.is_empty() => Ok(()),
                Ok(entries) => match ingest(&self.replayer, self.leader.epoch, entries).await {
                    Ok(_) => {
                        tip_checked = true;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                // The leader no longer holds our tip; its history continues
                // right after it
                Err(Error::JournalTruncated { first_available })
                    if !tip_checked && first_available == applied + 1 =>
                {
                    tip_checked = true;
                    Ok(())
                }
                Err(Error::JournalTruncated { first_available }) => {
                    info!(
                        "Leader retains entries from {} only, installing its image",
                        first_available
                    );
                    self.install_image().await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => backoff = initial,
                Err(e) if e.is_fatal() => {
                    error!("Replication from {} halted: {}", self.leader.node, e);
                    let _ = self.events.send(NodeEvent::Halt { error: e });
                    return;
                }
                Err(e) => {
                    counter!(REPLICATION_PULL_ERRORS).increment(1);
                    warn!(
                        "Pull from {} failed, retrying in {:?}: {}",
                        self.leader.node, backoff, e
                    );
                    tokio::select! {
                        () = cancelled(&mut shutdown) => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
        debug!("Stopped following {}", self.leader.node);
    }

    async fn install_image(&self) -> Result<()> {
        let bytes = self
            .source
            .fetch_image()
            .await?
            .ok_or_else(|| Error::Unavailable("leader has no image to serve".into()))?;
        let replayer = Arc::clone(&self.replayer);
        let checkpoints = Arc::clone(&self.checkpoints);
        tokio::task::spawn_blocking(move || replayer.install_image(&checkpoints, &bytes))
            .await
            .map_err(|e| Error::internal(format!("image install task failed: {e}")))?
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::state::Operation;
    use crate::transport::JournalSource;
    use meridian_common::config::CheckpointConfig;
    use meridian_common::{NodeEndpoint, NodeId};
    use tempfile::tempdir;

    fn leader_journal(ops: &[Operation]) -> Arc<MemoryJournal> {
        let journal = Arc::new(MemoryJournal::new());
        for (seq, op) in (1..).zip(ops) {
            journal
                .append(1, &[JournalEntry::new(seq, op, seq * 10).unwrap()])
                .unwrap();
        }
        journal
    }

    fn replayer(journal: Arc<MemoryJournal>, policy: ReplayPolicy) -> (Arc<MetadataStore>, Replayer) {
        let store = Arc::new(MetadataStore::new());
        let replayer = Replayer::new(journal, store.clone(), policy);
        (store, replayer)
    }

    #[test]
    fn test_recover_applies_everything() {
        let journal = leader_journal(&[
            Operation::create_database("db"),
            Operation::create_table(1, "t1"),
            Operation::add_partition(2, "p1"),
        ]);
        let (store, replayer) = replayer(journal, ReplayPolicy::strict());
        let stats = replayer.recover().unwrap();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.last_applied, 3);
        assert_eq!(store.stats().partitions, 1);

        // nothing left to do
        assert_eq!(replayer.recover().unwrap().applied, 0);
    }

    #[test]
    fn test_corrupt_entry_halts_replay() {
        let journal = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("b"),
            Operation::create_database("c"),
        ]);
        assert!(journal.corrupt(2));
        let (store, replayer) = replayer(journal, ReplayPolicy::strict());
        let err = replayer.recover().unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency {
                sequence: 2,
                kind: ConsistencyKind::ChecksumMismatch
            }
        ));
        assert_eq!(store.last_applied(), 1);
    }

    #[test]
    fn test_skip_policy() {
        // the second create fails: the name is taken
        let ops = [
            Operation::create_database("a"),
            Operation::create_database("a"),
            Operation::create_database("b"),
        ];
        let (_, strict) = replayer(leader_journal(&ops), ReplayPolicy::strict());
        assert!(matches!(
            strict.recover(),
            Err(Error::Consistency { sequence: 2, .. })
        ));

        let policy = ReplayPolicy::strict().skipping(OpCode::CreateDatabase);
        let (store, lenient) = replayer(leader_journal(&ops), policy);
        let stats = lenient.recover().unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(store.last_applied(), 3);
        assert_eq!(store.stats().databases, 2);
    }

    #[test]
    fn test_ingest_appends_then_applies() {
        let leader = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("b"),
            Operation::create_database("c"),
        ]);
        let local = Arc::new(MemoryJournal::new());
        let (store, replayer) = replayer(local.clone(), ReplayPolicy::strict());

        let stats = replayer.ingest(1, leader.read(1, 2).unwrap()).unwrap();
        assert_eq!(stats.applied, 2);
        // overlapping batch: only the new entry counts
        let stats = replayer.ingest(1, leader.read(1, 3).unwrap()).unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(local.last_sequence(), 3);
        assert_eq!(store.last_applied(), 3);

        // a gap is refused
        let gap = vec![JournalEntry::new(5, &Operation::Noop, 0).unwrap()];
        assert!(matches!(
            replayer.ingest(1, gap),
            Err(Error::Consistency { .. })
        ));
    }

    #[test]
    fn test_ingest_refuses_diverging_history() {
        // recovered a third entry the leader never had
        let local = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("b"),
            Operation::create_database("x"),
        ]);
        let (store, replayer) = replayer(local.clone(), ReplayPolicy::strict());
        replayer.recover().unwrap();

        let leader = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("b"),
            Operation::create_database("y"),
            Operation::create_database("z"),
        ]);
        let err = replayer.ingest(2, leader.read(1, 4).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency {
                sequence: 3,
                kind: ConsistencyKind::Diverged
            }
        ));
        assert!(err.is_fatal());

        // nothing from the leader was kept
        assert_eq!(local.last_sequence(), 3);
        assert_eq!(store.last_applied(), 3);
        store.view(|state| {
            assert!(state.database_by_name("x").is_some());
            assert!(state.database_by_name("y").is_none());
            assert!(state.database_by_name("z").is_none());
        });

        // a matching batch is fine
        let same = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("b"),
            Operation::create_database("x"),
            Operation::create_database("w"),
        ]);
        let stats = replayer.ingest(2, same.read(2, 4).unwrap()).unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(store.last_applied(), 4);
    }

    #[tokio::test]
    async fn test_catch_up_halts_on_diverged_tip() {
        let dir = tempdir().unwrap();
        let local = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("x"),
        ]);
        let store = Arc::new(MetadataStore::new());
        let replayer = Arc::new(Replayer::new(local.clone(), store.clone(), ReplayPolicy::strict()));
        replayer.recover().unwrap();
        let checkpoints = Arc::new(
            CheckpointManager::new(
                dir.path().to_path_buf(),
                CheckpointConfig::default(),
                store.clone(),
                local.clone(),
            )
            .unwrap(),
        );

        // the leader holds nothing past our tip, only a different entry at it
        let leader = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("y"),
        ]);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let catch_up = CatchUp {
            replayer,
            checkpoints,
            source: Arc::new(JournalSource::new(leader)),
            leader: LeaderInfo {
                node: NodeEndpoint::new(NodeId(1), "mem://1"),
                epoch: 2,
            },
            config: ReplicationConfig {
                poll_wait_ms: 10,
                ..ReplicationConfig::default()
            },
            events,
        };
        let (_stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(catch_up.run(stop_rx));

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            NodeEvent::Halt {
                error: Error::Consistency {
                    sequence: 2,
                    kind: ConsistencyKind::Diverged
                }
            }
        ));
        task.await.unwrap();
        assert_eq!(store.last_applied(), 2);
        assert_eq!(local.last_sequence(), 2);
    }

    #[tokio::test]
    async fn test_catch_up_installs_image_when_behind() {
        let dir = tempdir().unwrap();
        let ops: Vec<_> = (0..10)
            .map(|i| Operation::create_database(format!("db{i}")))
            .collect();
        let leader_log = leader_journal(&ops);
        let leader_store = Arc::new(MetadataStore::new());
        Replayer::new(leader_log.clone(), leader_store.clone(), ReplayPolicy::strict())
            .recover()
            .unwrap();
        let leader_images = Arc::new(
            CheckpointManager::new(
                dir.path().join("leader"),
                CheckpointConfig {
                    journal_retain_entries: 2,
                    ..CheckpointConfig::default()
                },
                leader_store.clone(),
                leader_log.clone(),
            )
            .unwrap(),
        );
        leader_images.create_checkpoint().unwrap();
        assert!(leader_log.first_sequence() > 1);

        let local = Arc::new(MemoryJournal::new());
        let store = Arc::new(MetadataStore::new());
        let replayer = Arc::new(Replayer::new(local.clone(), store.clone(), ReplayPolicy::strict()));
        let checkpoints = Arc::new(
            CheckpointManager::new(
                dir.path().join("follower"),
                CheckpointConfig::default(),
                store.clone(),
                local.clone(),
            )
            .unwrap(),
        );
        let (events, _events_rx) = mpsc::unbounded_channel();
        let catch_up = CatchUp {
            replayer,
            checkpoints,
            source: Arc::new(JournalSource::new(leader_log).with_images(leader_images)),
            leader: LeaderInfo {
                node: NodeEndpoint::new(NodeId(1), "mem://1"),
                epoch: 1,
            },
            config: ReplicationConfig {
                poll_wait_ms: 10,
                ..ReplicationConfig::default()
            },
            events,
        };
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(catch_up.run(stop_rx));

        let mut applied = store.subscribe();
        tokio::time::timeout(Duration::from_secs(5), applied.wait_for(|seq| *seq >= 10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.snapshot(), leader_store.snapshot());
        assert_eq!(local.first_sequence(), 11);

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_collects_tail() {
        let leader = leader_journal(&[
            Operation::create_database("a"),
            Operation::create_database("b"),
        ]);
        let (store, replayer) = replayer(Arc::new(MemoryJournal::new()), ReplayPolicy::strict());
        let replayer = Arc::new(replayer);
        let source = JournalSource::new(leader);
        let drained = drain(&replayer, &source, 2, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(drained, 2);
        assert_eq!(store.last_applied(), 2);
    }
}
