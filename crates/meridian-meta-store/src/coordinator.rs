//! State coordinator
//!
//! The single entry point to a node's metadata state. One instance is
//! built per process with [`StateCoordinator::open`] and handed to every
//! consumer; clones share the same node.
//!
//! Writes go through the leader's journal writer under region locks;
//! reads are served from the local store. Role transitions are serialized
//! and either come from the election driver or are called directly.

use crate::checkpoint::{CheckpointInfo, CheckpointManager, checkpoint_loop};
use crate::context::RequestContext;
use crate::election::LeaderElection;
use crate::journal::{JournalEntry, JournalStore, JournalWriter, WriterClient, WriterHandle};
use crate::locks::RegionLocks;
use crate::metric_definitions::{LEADER_STEP_DOWNS, REQUESTS_FAILED, REQUESTS_SUBMITTED};
use crate::replay::{self, CatchUp, ReplayPolicy, Replayer};
use crate::role::{NodeEvent, RoleCoordinator, RoleState};
use crate::state::{
    EntityKind, EntitySnapshot, LeaderEpochOp, MetadataState, MetadataStore, Operation,
    StateStats,
};
use crate::task::{BackgroundTask, cancelled};
use crate::transport::{ReplicationSource, SourceConnector};
use bytes::Bytes;
use meridian_common::{
    ClusterRole, ConsistencyKind, Config, Epoch, Error, LeaderInfo, NodeEndpoint, Result,
    SequenceId,
};
use metrics::counter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Acknowledgement of a committed operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub sequence_id: SequenceId,
    pub request_id: String,
}

/// Snapshot of a node's condition
#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub node: NodeEndpoint,
    pub role: ClusterRole,
    pub leader: Option<LeaderInfo>,
    pub epoch: Epoch,
    pub last_applied: SequenceId,
    pub journal_first: SequenceId,
    pub journal_last: SequenceId,
    pub journal_fence: Epoch,
    pub last_image: SequenceId,
    pub halted: Option<String>,
    pub entities: StateStats,
}

struct Following {
    task: BackgroundTask,
    source: Arc<dyn ReplicationSource>,
    leader: LeaderInfo,
}

#[derive(Default)]
struct Active {
    writer: Option<WriterHandle>,
    following: Option<Following>,
    scheduler: Option<BackgroundTask>,
}

struct Inner {
    config: Config,
    journal: Arc<dyn JournalStore>,
    store: Arc<MetadataStore>,
    replayer: Arc<Replayer>,
    checkpoints: Arc<CheckpointManager>,
    role: RoleCoordinator,
    locks: RegionLocks,
    election: Arc<dyn LeaderElection>,
    connector: Arc<dyn SourceConnector>,
    /// Submission side of the writer while leading
    writer: parking_lot::RwLock<Option<WriterClient>>,
    /// Transitions hold this for their whole duration
    active: Mutex<Active>,
    events: mpsc::UnboundedSender<NodeEvent>,
    halted: watch::Sender<Option<String>>,
    tasks: parking_lot::Mutex<Vec<BackgroundTask>>,
}

/// Handle on a node's metadata state
#[derive(Clone)]
pub struct StateCoordinator {
    inner: Arc<Inner>,
}

impl StateCoordinator {
    /// Recover local state and start in `Init`.
    ///
    /// Loads the newest usable image, then replays the local journal past
    /// it. Fails if the journal cannot be replayed; such a node must not
    /// serve.
    pub async fn open(
        config: Config,
        journal: Arc<dyn JournalStore>,
        election: Arc<dyn LeaderElection>,
        connector: Arc<dyn SourceConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let node = config.local_endpoint();
        let store = Arc::new(MetadataStore::new());
        let checkpoints = Arc::new(CheckpointManager::new(
            config.node.image_dir(),
            config.checkpoint.clone(),
            Arc::clone(&store),
            Arc::clone(&journal),
        )?);
        let replayer = Arc::new(Replayer::new(
            Arc::clone(&journal),
            Arc::clone(&store),
            ReplayPolicy::from_config(&config.replay),
        ));

        info!("Recovering metadata state for {}", node);
        {
            let journal = Arc::clone(&journal);
            let store = Arc::clone(&store);
            let checkpoints = Arc::clone(&checkpoints);
            let replayer = Arc::clone(&replayer);
            tokio::task::spawn_blocking(move || recover(&journal, &store, &checkpoints, &replayer))
                .await
                .map_err(|e| Error::internal(format!("recovery task failed: {e}")))??;
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let (halted, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            role: RoleCoordinator::new(node, config.node.observer),
            config,
            journal,
            store,
            replayer,
            checkpoints,
            locks: RegionLocks::new(),
            election,
            connector,
            writer: parking_lot::RwLock::new(None),
            active: Mutex::new(Active::default()),
            events,
            halted,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let event_loop = BackgroundTask::spawn("events", move |shutdown| {
            handle_events(weak, events_rx, shutdown)
        });
        inner.tasks.lock().push(event_loop);

        let coordinator = Self { inner };
        info!(
            "{} recovered up to sequence {}",
            coordinator.node(),
            coordinator.last_applied()
        );
        Ok(coordinator)
    }

    // ---- accessors ----

    #[must_use]
    pub fn node(&self) -> &NodeEndpoint {
        self.inner.role.node()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn role(&self) -> &RoleCoordinator {
        &self.inner.role
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<dyn JournalStore> {
        &self.inner.journal
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.inner.checkpoints
    }

    #[must_use]
    pub fn election(&self) -> &Arc<dyn LeaderElection> {
        &self.inner.election
    }

    #[must_use]
    pub fn last_applied(&self) -> SequenceId {
        self.inner.store.last_applied()
    }

    /// Why the node halted, if it did
    #[must_use]
    pub fn halted(&self) -> Option<String> {
        self.inner.halted.borrow().clone()
    }

    /// Resolves with the reason once the node halts
    pub async fn wait_halted(&self) -> String {
        let mut rx = self.inner.halted.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "coordinator dropped".to_string();
            }
        }
    }

    fn not_leader(&self) -> Error {
        self.inner.role.not_leader(self.last_applied())
    }

    fn check_running(&self) -> Result<()> {
        match self.halted() {
            Some(reason) => Err(Error::Halted(reason)),
            None => Ok(()),
        }
    }

    // ---- submission ----

    /// Commit one operation. Resolves once the entry is durable and
    /// applied locally.
    ///
    /// A [`Error::Timeout`] does not mean the operation was rejected: an
    /// entry already appended stays committed.
    pub async fn submit(&self, op: Operation, ctx: RequestContext) -> Result<SubmitReceipt> {
        self.with_deadline(&ctx, async {
            let client = self.leader_client()?;
            reject_internal(&op)?;
            self.inner.store.validate(&op)?;

            let keys = self.inner.store.footprint(&op).keys();
            let _regions = self.inner.locks.acquire(keys, ctx.lock_timeout).await?;
            debug!(
                "Request {} proposing {}",
                ctx.request_id,
                op.op_code()
            );
            let sequence_id = self.propose(&client, op, &ctx.request_id).await?;
            Ok(SubmitReceipt {
                sequence_id,
                request_id: ctx.request_id.clone(),
            })
        })
        .await
    }

    /// Commit an operation given as wire code and encoded body
    pub async fn submit_encoded(
        &self,
        op_code: u32,
        body: &[u8],
        ctx: RequestContext,
    ) -> Result<SubmitReceipt> {
        let op = Operation::decode_request(op_code, body)?;
        self.submit(op, ctx).await
    }

    /// Commit several operations in order while holding the locks of all
    /// of them.
    ///
    /// Each operation commits on its own: when one fails the ones before it
    /// stay committed and the rest are not attempted.
    pub async fn submit_all(
        &self,
        ops: Vec<Operation>,
        ctx: RequestContext,
    ) -> Result<Vec<SubmitReceipt>> {
        self.with_deadline(&ctx, async {
            let client = self.leader_client()?;
            let mut keys = BTreeSet::new();
            for op in &ops {
                reject_internal(op)?;
                keys.extend(self.inner.store.footprint(op).keys());
            }
            let _regions = self.inner.locks.acquire(keys, ctx.lock_timeout).await?;

            let mut receipts = Vec::with_capacity(ops.len());
            for (i, op) in ops.into_iter().enumerate() {
                let request_id = format!("{}/{}", ctx.request_id, i);
                let sequence_id = self.propose(&client, op, &request_id).await?;
                receipts.push(SubmitReceipt {
                    sequence_id,
                    request_id,
                });
            }
            Ok(receipts)
        })
        .await
    }

    /// Wait until everything submitted so far is durable and applied
    pub async fn flush(&self) -> Result<SequenceId> {
        let client = self.leader_client()?;
        client.flush().await.map_err(|_| self.not_leader())
    }

    fn leader_client(&self) -> Result<WriterClient> {
        self.check_running()?;
        if !self.inner.role.is_leader() {
            return Err(self.not_leader());
        }
        self.inner
            .writer
            .read()
            .clone()
            .ok_or_else(|| self.not_leader())
    }

    async fn propose(
        &self,
        client: &WriterClient,
        op: Operation,
        request_id: &str,
    ) -> Result<SequenceId> {
        client
            .propose(op, request_id.to_string())
            .await
            .map_err(|e| match e {
                Error::Unavailable(_) | Error::NotLeader { .. } => self.not_leader(),
                e => e,
            })
    }

    async fn with_deadline<T>(
        &self,
        ctx: &RequestContext,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        counter!(REQUESTS_SUBMITTED).increment(1);
        let started = Instant::now();
        let result = match tokio::time::timeout(ctx.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                request_id: ctx.request_id.clone(),
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                role: self.inner.role.role(),
                last_applied: self.last_applied(),
            }),
        };
        if let Err(e) = &result {
            counter!(REQUESTS_FAILED).increment(1);
            debug!(
                "Request {} from {} failed: {}",
                ctx.request_id,
                ctx.origin.as_deref().unwrap_or("local"),
                e
            );
        }
        result
    }

    // ---- queries ----

    /// Current snapshot of an entity from local state
    #[must_use]
    pub fn read_current(&self, kind: EntityKind, id: u64) -> Option<EntitySnapshot> {
        self.inner.store.read_current(kind, id)
    }

    /// Run a read-only closure against local state
    pub fn view<R>(&self, f: impl FnOnce(&MetadataState) -> R) -> R {
        self.inner.store.view(f)
    }

    #[must_use]
    pub fn status(&self) -> NodeStatus {
        let role = self.inner.role.current();
        let journal = &self.inner.journal;
        NodeStatus {
            node: self.node().clone(),
            role: role.role,
            leader: role.leader,
            epoch: role.epoch,
            last_applied: self.last_applied(),
            journal_first: journal.first_sequence(),
            journal_last: journal.last_sequence(),
            journal_fence: journal.fence(),
            last_image: self.inner.checkpoints.last_image_sequence(),
            halted: self.halted(),
            entities: self.inner.store.stats(),
        }
    }

    // ---- replication (serving side) ----

    /// Durable entries from `from` on, waiting up to `wait` for the first
    /// one to be applied
    pub async fn pull_entries(
        &self,
        from: SequenceId,
        max_entries: usize,
        wait: Duration,
    ) -> Result<Vec<JournalEntry>> {
        self.check_running()?;
        let first = self.inner.journal.first_sequence();
        if from < first {
            return Err(Error::JournalTruncated {
                first_available: first,
            });
        }

        if self.last_applied() < from && !wait.is_zero() {
            let mut applied = self.inner.store.subscribe();
            let _ = tokio::time::timeout(wait, async move {
                applied.wait_for(|seq| *seq >= from).await.is_ok()
            })
            .await;
        }

        let last = self.inner.journal.last_sequence();
        let to = last.min(from.saturating_add(max_entries.max(1) as u64 - 1));
        if to < from {
            return Ok(Vec::new());
        }
        let journal = Arc::clone(&self.inner.journal);
        tokio::task::spawn_blocking(move || journal.read(from, to))
            .await
            .map_err(|e| Error::internal(format!("journal read task failed: {e}")))?
    }

    /// Newest local image
    pub async fn latest_image(&self) -> Result<Option<Bytes>> {
        let checkpoints = Arc::clone(&self.inner.checkpoints);
        let image = tokio::task::spawn_blocking(move || checkpoints.latest_image())
            .await
            .map_err(|e| Error::internal(format!("image read task failed: {e}")))??;
        Ok(image.map(Bytes::from))
    }

    /// Take an image now
    pub async fn create_checkpoint(&self) -> Result<CheckpointInfo> {
        let checkpoints = Arc::clone(&self.inner.checkpoints);
        tokio::task::spawn_blocking(move || checkpoints.create_checkpoint())
            .await
            .map_err(|e| Error::internal(format!("checkpoint task failed: {e}")))?
    }

    // ---- role transitions ----

    /// Take leadership in `epoch`.
    ///
    /// Drains the previous leader's source while it answers, applies every
    /// local entry, then opens the writer and marks the epoch in the journal.
    /// Writes are accepted only after all of that succeeded.
    pub async fn become_leader(&self, epoch: Epoch) -> Result<()> {
        let mut active = self.inner.active.lock().await;
        self.check_running()?;
        let role = &self.inner.role;
        if role.is_observer() {
            return Err(Error::InvalidTransition {
                from: role.role(),
                to: ClusterRole::Leader,
            });
        }
        if let Some(writer) = &active.writer {
            if writer.epoch() >= epoch {
                return Ok(());
            }
            info!("Re-appointed in epoch {}, restarting the writer", epoch);
            self.stop_leading(&mut active).await;
            role.transition(ClusterRole::Follower, None)?;
        }
        let fence = self.inner.journal.fence();
        if epoch < fence {
            return Err(Error::Fenced { epoch, fence });
        }
        if role.role() == ClusterRole::Unknown {
            // Unknown rejoins as a replica before it can lead
            role.transition(ClusterRole::Follower, None)?;
        }
        role.check(ClusterRole::Leader)?;

        self.stop_scheduler(&mut active).await;
        if let Some((source, previous)) = self.stop_following(&mut active).await {
            let drained = replay::drain(
                &self.inner.replayer,
                source.as_ref(),
                previous.epoch,
                self.inner.config.replication.max_batch_entries,
                self.inner.config.replication.leader_drain_timeout(),
            )
            .await;
            match drained {
                Ok(n) => info!("Drained {} entries from {}", n, previous.node),
                Err(e) if e.is_fatal() => {
                    self.halt_locked(&mut active, &e).await;
                    return Err(e);
                }
                Err(e) => warn!(
                    "Previous leader {} could not be drained: {}",
                    previous.node, e
                ),
            }
        }

        let replayer = Arc::clone(&self.inner.replayer);
        let recovered = tokio::task::spawn_blocking(move || replayer.recover())
            .await
            .map_err(|e| Error::internal(format!("recovery task failed: {e}")))
            .and_then(|r| r);
        if let Err(e) = recovered {
            if e.is_fatal() {
                self.halt_locked(&mut active, &e).await;
            }
            return Err(e);
        }

        let writer = JournalWriter::spawn(
            Arc::clone(&self.inner.journal),
            Arc::clone(&self.inner.store),
            self.inner.config.journal.clone(),
            epoch,
            self.inner.events.clone(),
        );
        let client = writer.client();
        // Taking over existing history starts the term with a marker entry,
        // which also raises the journal fence before any client write
        if self.inner.journal.last_sequence() > 0 {
            let marker = Operation::LeaderEpoch(LeaderEpochOp {
                epoch,
                node_id: self.node().node_id.get(),
            });
            if let Err(e) = client.propose(marker, format!("epoch-{epoch}")).await {
                error!("Could not open epoch {}: {}", epoch, e);
                writer.close().await;
                counter!(LEADER_STEP_DOWNS).increment(1);
                self.inner.election.resign(self.node().node_id);
                return Err(e);
            }
        }

        let leading = role.transition(
            ClusterRole::Leader,
            Some(LeaderInfo {
                node: self.node().clone(),
                epoch,
            }),
        );
        if let Err(e) = leading {
            writer.close().await;
            return Err(e);
        }
        *self.inner.writer.write() = Some(client);
        active.writer = Some(writer);
        active.scheduler = Some(self.spawn_scheduler());
        info!(
            "{} leading in epoch {} at sequence {}",
            self.node(),
            epoch,
            self.last_applied()
        );
        Ok(())
    }

    /// Replicate from `leader` as a follower
    pub async fn become_follower(&self, leader: LeaderInfo) -> Result<()> {
        self.become_replica(ClusterRole::Follower, leader).await
    }

    /// Replicate from `leader` as an observer
    pub async fn become_observer(&self, leader: LeaderInfo) -> Result<()> {
        self.become_replica(ClusterRole::Observer, leader).await
    }

    async fn become_replica(&self, to: ClusterRole, leader: LeaderInfo) -> Result<()> {
        let mut active = self.inner.active.lock().await;
        self.check_running()?;
        let role = &self.inner.role;
        if role.is_self(&leader) {
            return Err(Error::InvalidTransition {
                from: role.role(),
                to,
            });
        }
        if role.role() == to
            && active
                .following
                .as_ref()
                .is_some_and(|f| f.leader == leader)
        {
            return Ok(());
        }
        role.check(to)?;

        self.stop_leading(&mut active).await;
        self.stop_following(&mut active).await;
        role.transition(to, Some(leader.clone()))?;

        let source = self.inner.connector.connect(&leader)?;
        let catch_up = CatchUp {
            replayer: Arc::clone(&self.inner.replayer),
            checkpoints: Arc::clone(&self.inner.checkpoints),
            source: Arc::clone(&source),
            leader: leader.clone(),
            config: self.inner.config.replication.clone(),
            events: self.inner.events.clone(),
        };
        active.following = Some(Following {
            task: BackgroundTask::spawn("catch-up", move |shutdown| catch_up.run(shutdown)),
            source,
            leader,
        });
        if self.inner.config.checkpoint.on_followers {
            active.scheduler = Some(self.spawn_scheduler());
        }
        Ok(())
    }

    /// Lose contact with the cluster: stop writing and replicating
    pub async fn enter_unknown(&self) -> Result<()> {
        let mut active = self.inner.active.lock().await;
        self.stop_leading(&mut active).await;
        self.stop_following(&mut active).await;
        self.inner.role.transition(ClusterRole::Unknown, None)?;
        Ok(())
    }

    /// The writer of `epoch` failed to append
    async fn step_down(&self, epoch: Epoch, error: Error) {
        let mut active = self.inner.active.lock().await;
        if active.writer.as_ref().map(WriterHandle::epoch) != Some(epoch) {
            debug!("Ignoring step-down for epoch {}", epoch);
            return;
        }
        error!(
            "{} stepping down from epoch {}: {}",
            self.node(),
            epoch,
            error
        );
        counter!(LEADER_STEP_DOWNS).increment(1);
        self.stop_leading(&mut active).await;
        if let Err(e) = self.inner.role.transition(ClusterRole::Unknown, None) {
            warn!("Step-down transition failed: {}", e);
        }
        self.inner.election.resign(self.node().node_id);
    }

    async fn halt(&self, error: &Error) {
        let mut active = self.inner.active.lock().await;
        self.halt_locked(&mut active, error).await;
    }

    /// Stop serving: local state diverged or cannot be advanced safely
    async fn halt_locked(&self, active: &mut Active, error: &Error) {
        error!("{} halting: {}", self.node(), error);
        self.inner.halted.send_replace(Some(error.to_string()));
        let was_leader = active.writer.is_some();
        self.stop_leading(active).await;
        self.stop_following(active).await;
        let _ = self.inner.role.transition(ClusterRole::Unknown, None);
        if was_leader {
            self.inner.election.resign(self.node().node_id);
        }
    }

    async fn stop_leading(&self, active: &mut Active) {
        self.inner.writer.write().take();
        self.stop_scheduler(active).await;
        if let Some(writer) = active.writer.take() {
            writer.close().await;
        }
    }

    /// Returns the source and leader that were followed
    async fn stop_following(
        &self,
        active: &mut Active,
    ) -> Option<(Arc<dyn ReplicationSource>, LeaderInfo)> {
        self.stop_scheduler(active).await;
        let Following {
            task,
            source,
            leader,
        } = active.following.take()?;
        task.stop().await;
        Some((source, leader))
    }

    async fn stop_scheduler(&self, active: &mut Active) {
        if let Some(scheduler) = active.scheduler.take() {
            scheduler.stop().await;
        }
    }

    fn spawn_scheduler(&self) -> BackgroundTask {
        let checkpoints = Arc::clone(&self.inner.checkpoints);
        let interval = self.inner.config.checkpoint.interval();
        BackgroundTask::spawn("checkpoint", move |shutdown| {
            checkpoint_loop(checkpoints, interval, shutdown)
        })
    }

    /// Follow the election collaborator's announcements until shutdown
    pub fn spawn_election_driver(&self) {
        let weak = Arc::downgrade(&self.inner);
        let announcements = self.inner.election.subscribe();
        let driver = BackgroundTask::spawn("election", move |shutdown| {
            drive_election(weak, announcements, shutdown)
        });
        self.inner.tasks.lock().push(driver);
    }

    async fn follow_announcement(&self, leader: Option<LeaderInfo>) {
        if self.halted().is_some() {
            return;
        }
        let role = &self.inner.role;
        let result = match leader {
            Some(l) if role.is_self(&l) => self.become_leader(l.epoch).await,
            Some(l) => self.become_replica(role.replica_role(), l).await,
            None => self.enter_unknown().await,
        };
        if let Err(e) = result {
            warn!("{} could not follow election: {}", self.node(), e);
        }
    }

    /// Stop background work, close the write path and sync the journal
    pub async fn shutdown(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.stop().await;
        }

        let mut active = self.inner.active.lock().await;
        let was_leader = active.writer.is_some();
        self.stop_leading(&mut active).await;
        self.stop_following(&mut active).await;
        if was_leader {
            self.inner.election.resign(self.node().node_id);
        }
        drop(active);

        let journal = Arc::clone(&self.inner.journal);
        tokio::task::spawn_blocking(move || journal.sync())
            .await
            .map_err(|e| Error::internal(format!("journal sync task failed: {e}")))??;
        info!("{} shut down at sequence {}", self.node(), self.last_applied());
        Ok(())
    }

    /// Subscribe to role changes
    #[must_use]
    pub fn subscribe_role(&self) -> watch::Receiver<RoleState> {
        self.inner.role.subscribe()
    }
}

fn reject_internal(op: &Operation) -> Result<()> {
    if op.is_internal() {
        return Err(Error::invalid_operation(format!(
            "{} is reserved for internal use",
            op.op_code()
        )));
    }
    Ok(())
}

/// Load the newest image and replay the local journal past it
fn recover(
    journal: &Arc<dyn JournalStore>,
    store: &MetadataStore,
    checkpoints: &CheckpointManager,
    replayer: &Replayer,
) -> Result<()> {
    if let Some((_, state)) = checkpoints.load_latest()? {
        store.replace(state);
    }
    let applied = store.last_applied();
    let first = journal.first_sequence();
    let last = journal.last_sequence();

    if last < applied {
        // An installed image outran the journal reset; restart after it
        warn!(
            "Journal ends at {} behind image at {}, restarting journal",
            last, applied
        );
        journal.reset_to(applied)?;
    } else if first > applied + 1 {
        return Err(Error::consistency(
            applied + 1,
            ConsistencyKind::SequenceGap {
                expected: applied + 1,
                found: first,
            },
        ));
    }
    replayer.recover().map(|_| ())
}

async fn handle_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            () = cancelled(&mut shutdown) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        let coordinator = StateCoordinator { inner };
        match event {
            NodeEvent::StepDown { epoch, error } => coordinator.step_down(epoch, error).await,
            NodeEvent::Halt { error } => coordinator.halt(&error).await,
        }
    }
}

async fn drive_election(
    inner: Weak<Inner>,
    mut announcements: watch::Receiver<Option<LeaderInfo>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let leader = announcements.borrow_and_update().clone();
        {
            let Some(inner) = inner.upgrade() else { break };
            StateCoordinator { inner }.follow_announcement(leader).await;
        }
        tokio::select! {
            () = cancelled(&mut shutdown) => break,
            changed = announcements.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::LocalElection;
    use crate::journal::MemoryJournal;
    use crate::state::{Properties, PutResourceOp};
    use crate::transport::{JournalSource, StaticConnector};
    use meridian_common::NodeId;
    use tempfile::TempDir;

    struct Node {
        _dir: TempDir,
        journal: Arc<MemoryJournal>,
        coordinator: StateCoordinator,
    }

    fn config(id: u64, dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.node.node_id = id;
        config.node.data_dir = dir.path().to_path_buf();
        config.node.advertise_addr = Some(format!("mem://{id}"));
        config.replication.poll_wait_ms = 10;
        config.replication.retry_initial_ms = 5;
        config
    }

    async fn open(id: u64, election: Arc<LocalElection>, connector: Arc<StaticConnector>) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let coordinator =
            StateCoordinator::open(config(id, &dir), journal.clone(), election, connector)
                .await
                .unwrap();
        Node {
            _dir: dir,
            journal,
            coordinator,
        }
    }

    fn endpoint(id: u64) -> NodeEndpoint {
        NodeEndpoint::new(NodeId(id), format!("mem://{id}"))
    }

    #[tokio::test]
    async fn test_leader_commits_and_serves() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election, Arc::new(StaticConnector::new())).await;
        let c = &node.coordinator;
        assert_eq!(c.role().role(), ClusterRole::Init);

        c.become_leader(1).await.unwrap();
        // an empty journal gets no epoch marker
        assert_eq!(c.last_applied(), 0);

        let receipt = c
            .submit(Operation::create_database("sales"), RequestContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.sequence_id, 1);
        assert!(matches!(
            c.read_current(EntityKind::Database, 1),
            Some(EntitySnapshot::Database(ref db)) if db.name == "sales"
        ));
        c.submit(Operation::create_table(1, "orders"), RequestContext::default())
            .await
            .unwrap();

        let entries = c.pull_entries(1, 10, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(c.flush().await.unwrap(), 2);

        let status = c.status();
        assert_eq!(status.role, ClusterRole::Leader);
        assert_eq!(status.journal_fence, 1);
        c.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_internal_operations_rejected() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election, Arc::new(StaticConnector::new())).await;
        node.coordinator.become_leader(1).await.unwrap();
        let err = node
            .coordinator
            .submit(Operation::Noop, RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(node.journal.last_sequence(), 0);
    }

    #[tokio::test]
    async fn test_oversize_operation_rejected() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election, Arc::new(StaticConnector::new())).await;
        let c = &node.coordinator;
        c.become_leader(1).await.unwrap();

        let mut op = PutResourceOp {
            name: "blob".into(),
            kind: "file".into(),
            properties: Properties::new(),
        };
        op.properties.insert(
            "data".into(),
            "x".repeat(crate::journal::record::MAX_BODY_SIZE),
        );
        let err = c
            .submit(Operation::PutResource(op), RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(node.journal.last_sequence(), 0);

        // no sequence id was spent on it
        let receipt = c
            .submit(Operation::create_database("db"), RequestContext::default())
            .await
            .unwrap();
        assert_eq!(receipt.sequence_id, 1);
    }

    #[tokio::test]
    async fn test_submit_all_in_order() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election, Arc::new(StaticConnector::new())).await;
        let c = &node.coordinator;
        c.become_leader(1).await.unwrap();

        let receipts = c
            .submit_all(
                vec![
                    Operation::create_database("db"),
                    Operation::create_table(1, "t1"),
                    Operation::add_partition(2, "p1"),
                ],
                RequestContext::default(),
            )
            .await
            .unwrap();
        let seqs: Vec<_> = receipts.iter().map(|r| r.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(c.view(|s| s.partitions_of(2).count()), 1);

        // the second operation fails; the first stays committed
        let err = c
            .submit_all(
                vec![
                    Operation::create_table(1, "t2"),
                    Operation::create_table(1, "t1"),
                ],
                RequestContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(c.view(|s| s.table_by_name(1, "t2").is_some()));
    }

    #[tokio::test]
    async fn test_follower_rejects_and_replicates() {
        let election = Arc::new(LocalElection::new(0));
        let connector = Arc::new(StaticConnector::new());
        let leader = open(1, election.clone(), connector.clone()).await;
        let follower = open(2, election.clone(), connector.clone()).await;
        connector.register(NodeId(1), Arc::new(JournalSource::new(leader.journal.clone())));

        leader.coordinator.spawn_election_driver();
        follower.coordinator.spawn_election_driver();
        election.appoint(endpoint(1));

        let mut role = leader.coordinator.subscribe_role();
        tokio::time::timeout(
            Duration::from_secs(5),
            role.wait_for(|r| r.role == ClusterRole::Leader),
        )
        .await
        .unwrap()
        .unwrap();

        let receipt = leader
            .coordinator
            .submit(Operation::create_table(9, "t1"), RequestContext::default())
            .await
            .unwrap();

        let mut applied = follower.coordinator.store().subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            applied.wait_for(|seq| *seq >= receipt.sequence_id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            follower.coordinator.view(MetadataState::clone),
            leader.coordinator.view(MetadataState::clone)
        );

        let before = follower.journal.last_sequence();
        let err = follower
            .coordinator
            .submit(Operation::create_table(9, "t2"), RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotLeader { leader: Some(ref l), .. } if l.node_id == NodeId(1)
        ));
        assert_eq!(follower.journal.last_sequence(), before);

        follower.coordinator.shutdown().await.unwrap();
        leader.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_failure_steps_down() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election.clone(), Arc::new(StaticConnector::new())).await;
        let c = &node.coordinator;
        c.become_leader(election.appoint(endpoint(1)).epoch)
            .await
            .unwrap();

        node.journal.fail_appends("disk gone");
        let err = c
            .submit(Operation::create_database("x"), RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Durability { .. }));

        let mut role = c.subscribe_role();
        tokio::time::timeout(
            Duration::from_secs(5),
            role.wait_for(|r| r.role == ClusterRole::Unknown),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(election.current_leader().is_none());
        assert!(matches!(
            c.submit(Operation::create_database("y"), RequestContext::default())
                .await,
            Err(Error::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election, Arc::new(StaticConnector::new())).await;
        let c = &node.coordinator;
        c.become_leader(1).await.unwrap();

        let err = c
            .submit(
                Operation::create_database("slow"),
                RequestContext::default().with_timeout(Duration::ZERO),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                role: ClusterRole::Leader,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stale_epoch_refused() {
        let election = Arc::new(LocalElection::new(0));
        let node = open(1, election, Arc::new(StaticConnector::new())).await;
        node.journal
            .append(
                5,
                &[JournalEntry::new(1, &Operation::create_database("x"), 0).unwrap()],
            )
            .unwrap();
        assert!(matches!(
            node.coordinator.become_leader(3).await,
            Err(Error::Fenced { epoch: 3, fence: 5 })
        ));
        assert_eq!(node.coordinator.role().role(), ClusterRole::Init);
    }
}
